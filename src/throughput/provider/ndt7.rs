//! NDT7 session over WebSockets: ping probes, a download phase and an
//! upload phase, run strictly in that order against one candidate.

use std::sync::Once;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ProviderMeta, SpeedTestProvider};
use crate::analysis::stats;
use crate::config::SessionConfig;
use crate::discovery::{Candidate, ProtocolVariant};
use crate::throughput::frame::Frame;
use crate::throughput::meter::{PhaseMeter, PhaseSummary};
use crate::throughput::{MeasurementResult, Phase, PhaseResult, SessionError, SpeedTestEvents};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Err means another provider is already installed; that one is used.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub struct Ndt7Provider {
    config: SessionConfig,
}

/// Why a phase loop stopped.
enum PhaseEnd {
    /// Budget elapsed or the server closed normally.
    Completed,
    Failed(String),
    Aborted,
}

/// What a single inbound message means for the phase.
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Closed,
}

impl Ndt7Provider {
    pub fn new(config: SessionConfig) -> Self {
        install_crypto_provider();
        Self { config }
    }

    async fn connect(
        &self,
        url: &str,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<WsStream, SessionError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SessionError::transport(phase, e))?;
        let protocol = HeaderValue::from_str(&self.config.subprotocol)
            .map_err(|e| SessionError::transport(phase, e))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Aborted),
            result = timeout(self.config.connect_timeout(), connect_async(request)) => match result {
                Err(_) => Err(SessionError::transport(phase, "connect timed out")),
                Ok(Err(e)) => Err(SessionError::transport(phase, e)),
                Ok(Ok((ws, _response))) => Ok(ws),
            },
        }
    }

    /// Median time-to-open over the configured number of probes.
    async fn measure_ping(
        &self,
        url: &str,
        events: &dyn SpeedTestEvents,
        cancel: &CancellationToken,
    ) -> Result<f64, SessionError> {
        let attempts = self.config.ping_attempts;
        let mut samples = Vec::with_capacity(attempts as usize);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SessionError::Aborted);
            }
            let percent = attempt as f64 / attempts as f64 * 100.0;
            events.on_progress(Phase::Ping, percent, 0.0);

            let started = Instant::now();
            match self.connect(url, Phase::Ping, cancel).await {
                Ok(mut ws) => {
                    let rtt = started.elapsed().as_secs_f64() * 1000.0;
                    samples.push(rtt);
                    events.on_progress(Phase::Ping, percent, rtt.round());
                    let _ = timeout(self.config.close_timeout(), ws.close(None)).await;
                }
                Err(SessionError::Aborted) => return Err(SessionError::Aborted),
                Err(e) => debug!(attempt, error = %e, "ping probe failed"),
            }
        }

        stats::median(&samples).ok_or(SessionError::Unreachable { attempts })
    }

    async fn run_download(
        &self,
        url: &str,
        events: &dyn SpeedTestEvents,
        cancel: &CancellationToken,
    ) -> Result<PhaseSummary, SessionError> {
        let mut ws = self.connect(url, Phase::Download, cancel).await?;
        let mut meter = PhaseMeter::new(Phase::Download, &self.config, events, Instant::now());
        let deadline = meter.deadline();
        let mut ticker = interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break PhaseEnd::Aborted,
                _ = sleep_until(deadline) => break PhaseEnd::Completed,
                _ = ticker.tick() => meter.tick(Instant::now()),
                frame = ws.next() => match frame {
                    None => break PhaseEnd::Completed,
                    Some(Ok(msg)) => {
                        if apply_message(&mut meter, msg, self.config.discard_opaque_frames)
                            == Flow::Closed
                        {
                            break PhaseEnd::Completed;
                        }
                    }
                    Some(Err(e)) => break PhaseEnd::Failed(e.to_string()),
                },
            }
        };

        close_gracefully(&mut ws, self.config.close_timeout()).await;
        settle(Phase::Download, meter, end)
    }

    async fn run_upload(
        &self,
        url: &str,
        events: &dyn SpeedTestEvents,
        cancel: &CancellationToken,
    ) -> Result<PhaseSummary, SessionError> {
        let ws = self.connect(url, Phase::Upload, cancel).await?;
        let (mut sink, mut stream) = ws.split();
        let mut meter = PhaseMeter::new(Phase::Upload, &self.config, events, Instant::now());
        let deadline = meter.deadline();
        let mut ticker = interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let chunk_size = self.config.upload_chunk_size;
        let ceiling = self.config.max_buffered_bytes;
        let chunk = vec![0u8; chunk_size];
        let mut unflushed = 0usize;

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break PhaseEnd::Aborted,
                _ = sleep_until(deadline) => break PhaseEnd::Completed,
                _ = ticker.tick() => meter.tick(Instant::now()),
                frame = stream.next() => match frame {
                    None => break PhaseEnd::Completed,
                    Some(Ok(msg)) => {
                        if apply_message(&mut meter, msg, true) == Flow::Closed {
                            break PhaseEnd::Completed;
                        }
                    }
                    Some(Err(e)) => break PhaseEnd::Failed(e.to_string()),
                },
                sent = async {
                    if unflushed >= ceiling {
                        sink.flush().await.map(|_| None)
                    } else {
                        sink.feed(Message::Binary(chunk.clone())).await.map(|_| Some(chunk_size))
                    }
                } => match sent {
                    Ok(Some(n)) => {
                        unflushed += n;
                        meter.record_client_bytes(n);
                    }
                    Ok(None) => unflushed = 0,
                    Err(e) => break PhaseEnd::Failed(e.to_string()),
                },
            }
        };

        let _ = timeout(self.config.close_timeout(), async {
            if sink.close().await.is_ok() {
                while let Some(Ok(msg)) = stream.next().await {
                    if let Message::Text(text) = msg {
                        if let Frame::Measurement(m) = Frame::from_text(&text) {
                            meter.record_measurement(&m, Instant::now());
                        }
                    }
                }
            }
        })
        .await;

        settle(Phase::Upload, meter, end)
    }
}

/// Route one inbound message into the meter.
fn apply_message(meter: &mut PhaseMeter<'_>, msg: Message, discard_opaque: bool) -> Flow {
    let (frame, len) = match &msg {
        Message::Text(text) => (Frame::from_text(text), text.len()),
        Message::Binary(data) => (Frame::from_binary(data), data.len()),
        Message::Close(_) => return Flow::Closed,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Flow::Continue,
    };

    match frame {
        Frame::Measurement(m) => meter.record_measurement(&m, Instant::now()),
        Frame::Opaque if !discard_opaque => meter.record_client_bytes(len),
        Frame::Opaque => {}
    }
    Flow::Continue
}

/// Send our close frame and wait briefly for the server's.
async fn close_gracefully(ws: &mut WsStream, wait: Duration) {
    let _ = timeout(wait, async {
        if ws.close(None).await.is_err() {
            return;
        }
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

/// Turn a finished phase loop into its result. A transport error only fails
/// the phase when nothing useful was observed before it.
fn settle(
    phase: Phase,
    meter: PhaseMeter<'_>,
    end: PhaseEnd,
) -> Result<PhaseSummary, SessionError> {
    match end {
        PhaseEnd::Aborted => Err(SessionError::Aborted),
        PhaseEnd::Failed(message) if !meter.has_useful_data() => {
            Err(SessionError::transport(phase, message))
        }
        PhaseEnd::Failed(message) => {
            warn!(%phase, error = %message, "phase ended early; keeping data gathered so far");
            Ok(meter.finish(Instant::now()))
        }
        PhaseEnd::Completed => Ok(meter.finish(Instant::now())),
    }
}

fn endpoint(candidate: &Candidate, variant: ProtocolVariant) -> Result<&str, SessionError> {
    candidate.url(variant).ok_or_else(|| {
        let phase = match variant {
            ProtocolVariant::Download => Phase::Download,
            ProtocolVariant::Upload => Phase::Upload,
        };
        SessionError::transport(phase, format!("{} has no {variant:?} endpoint", candidate.id))
    })
}

#[async_trait::async_trait]
impl SpeedTestProvider for Ndt7Provider {
    fn meta(&self) -> ProviderMeta {
        ProviderMeta {
            id: "ndt7",
            display_name: "NDT7 (M-Lab)",
            description: "WebSocket download/upload against the nearest M-Lab server.",
        }
    }

    async fn run(
        &self,
        candidate: &Candidate,
        events: &dyn SpeedTestEvents,
        cancel: &CancellationToken,
    ) -> Result<MeasurementResult, SessionError> {
        let download_url = endpoint(candidate, ProtocolVariant::Download)?;
        let upload_url = endpoint(candidate, ProtocolVariant::Upload)?;
        info!(server = %candidate.id, download_url, upload_url, "starting ndt7 session");

        let ping = self.measure_ping(download_url, events, cancel).await?;
        events.on_phase_complete(Phase::Ping, ping);
        debug!(server = %candidate.id, ping_ms = ping, "ping complete");

        let download = self.run_download(download_url, events, cancel).await?;
        events.on_phase_complete(Phase::Download, download.value);
        info!(
            server = %candidate.id,
            mbps = download.value,
            rtt_samples = download.rtts.len(),
            elapsed_ms = download.elapsed.as_millis() as u64,
            "download complete"
        );

        let upload = self.run_upload(upload_url, events, cancel).await?;
        events.on_phase_complete(Phase::Upload, upload.value);
        info!(server = %candidate.id, mbps = upload.value, "upload complete");

        Ok(MeasurementResult::from_phases(
            &candidate.id,
            PhaseResult { phase: Phase::Ping, value: ping },
            PhaseResult { phase: Phase::Download, value: download.value },
            PhaseResult { phase: Phase::Upload, value: upload.value },
            &download.rtts,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    use super::*;
    use crate::throughput::testing::{Event, RecordingEvents};

    const SUBPROTOCOL: &str = "net.measurementlab.ndt.v7";

    #[derive(Clone, Copy)]
    enum Script {
        Normal,
        /// Download connections are dropped without a close handshake.
        DropDownload,
        /// Download reports 80, 95 and 90 Mbps, then the stream is dropped.
        ReportThenDrop,
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            connect_timeout_ms: 1_000,
            phase_duration_ms: 600,
            warmup_ms: 100,
            data_point_interval_ms: 50,
            progress_interval_ms: 50,
            close_timeout_ms: 200,
            ..SessionConfig::default()
        }
    }

    fn candidate(addr: SocketAddr) -> Candidate {
        let mut urls = HashMap::new();
        urls.insert(ProtocolVariant::Download, format!("ws://{addr}/ndt/v7/download"));
        urls.insert(ProtocolVariant::Upload, format!("ws://{addr}/ndt/v7/upload"));
        Candidate { id: "local-ndt7".to_string(), urls }
    }

    /// 100 Mbps, 25 ms smoothed RTT.
    fn download_measurement(step: u64) -> String {
        format!(
            r#"{{"AppInfo":{{"ElapsedTime":{},"NumBytes":{}}},"TCPInfo":{{"SmoothedRTT":25000}}}}"#,
            step * 100_000,
            step * 1_250_000
        )
    }

    /// 40 Mbps.
    const UPLOAD_MEASUREMENT: &str = r#"{"AppInfo":{"ElapsedTime":100000,"NumBytes":500000}}"#;

    async fn spawn_server(script: Script) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, script));
            }
        });
        addr
    }

    async fn serve(stream: TcpStream, script: Script) {
        let mut path = String::new();
        let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            resp.headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
            Ok(resp)
        };
        let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
            return;
        };

        if path.ends_with("/download") {
            if matches!(script, Script::DropDownload) {
                // give the client time to treat the ping probe as open
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            if matches!(script, Script::ReportThenDrop) {
                for (elapsed_us, bytes) in [
                    (1_000_000u64, 10_000_000u64),
                    (2_000_000, 23_750_000),
                    (3_000_000, 33_750_000),
                ] {
                    let report = format!(
                        r#"{{"AppInfo":{{"ElapsedTime":{elapsed_us},"NumBytes":{bytes}}}}}"#
                    );
                    if ws.send(Message::Text(report)).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                return;
            }
            let mut step = 0u64;
            loop {
                tokio::select! {
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    },
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {
                        step += 1;
                        let out = if step % 5 == 0 {
                            Message::Text(download_measurement(step))
                        } else {
                            Message::Binary(vec![0u8; 4096])
                        };
                        if ws.send(out).await.is_err() {
                            break;
                        }
                    }
                }
            }
        } else {
            let mut received = 0u64;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(_) = msg {
                    received += 1;
                    if received % 10 == 0
                        && ws.send(Message::Text(UPLOAD_MEASUREMENT.to_string())).await.is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_full_session_against_local_server() {
        let addr = spawn_server(Script::Normal).await;
        let provider = Ndt7Provider::new(test_config());
        let events = RecordingEvents::default();

        let result = provider
            .run(&candidate(addr), &events, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.server_id, "local-ndt7");
        assert_eq!(result.download_mbps, 100.0);
        assert_eq!(result.upload_mbps, 40.0);
        assert_eq!(result.latency_ms, 25.0);
        assert_eq!(result.jitter_ms, 0.0);
        assert!(result.ping_ms >= 0.0);

        let completed: Vec<Phase> = events
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::PhaseComplete(p, _) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![Phase::Ping, Phase::Download, Phase::Upload]);
        assert!(!events.data_points(Phase::Download).is_empty());
        assert!(events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::Latency(ms) if *ms == 25.0)));
    }

    #[tokio::test]
    async fn test_unreachable_when_every_probe_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = Ndt7Provider::new(test_config());
        let err = provider
            .run(&candidate(addr), &RecordingEvents::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Unreachable { attempts: 3 });
    }

    #[tokio::test]
    async fn test_download_reset_without_data_is_transport_error() {
        let addr = spawn_server(Script::DropDownload).await;
        let provider = Ndt7Provider::new(test_config());

        let err = provider
            .run(&candidate(addr), &RecordingEvents::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport { phase: Phase::Download, .. }
        ));
    }

    #[tokio::test]
    async fn test_download_error_after_reports_keeps_last_figure() {
        let addr = spawn_server(Script::ReportThenDrop).await;
        let provider = Ndt7Provider::new(test_config());

        let result = provider
            .run(&candidate(addr), &RecordingEvents::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.download_mbps, 90.0);
        assert_eq!(result.upload_mbps, 40.0);
    }

    #[tokio::test]
    async fn test_cancel_mid_download_aborts() {
        let addr = spawn_server(Script::Normal).await;
        let provider = Ndt7Provider::new(SessionConfig {
            phase_duration_ms: 10_000,
            ..test_config()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = provider
            .run(&candidate(addr), &RecordingEvents::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Aborted);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_upload_endpoint_is_rejected_before_connecting() {
        let mut c = candidate("127.0.0.1:9".parse().unwrap());
        c.urls.remove(&ProtocolVariant::Upload);
        let provider = Ndt7Provider::new(test_config());
        let err = provider
            .run(&c, &RecordingEvents::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport { phase: Phase::Upload, .. }));
    }

    #[tokio::test]
    async fn test_missing_download_endpoint_names_download_phase() {
        let mut c = candidate("127.0.0.1:9".parse().unwrap());
        c.urls.remove(&ProtocolVariant::Download);
        let provider = Ndt7Provider::new(test_config());
        let err = provider
            .run(&c, &RecordingEvents::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport { phase: Phase::Download, .. }));
    }

    #[test]
    fn test_opaque_frames_counted_only_when_not_discarded() {
        let events = RecordingEvents::default();
        let config = SessionConfig::default();

        let mut counting = PhaseMeter::new(Phase::Download, &config, &events, Instant::now());
        assert_eq!(
            apply_message(&mut counting, Message::Binary(vec![0u8; 8192]), false),
            Flow::Continue
        );
        assert!(counting.has_useful_data());

        let mut discarding = PhaseMeter::new(Phase::Download, &config, &events, Instant::now());
        apply_message(&mut discarding, Message::Binary(vec![0u8; 8192]), true);
        apply_message(&mut discarding, Message::Text("x".repeat(64)), true);
        assert!(!discarding.has_useful_data());

        assert_eq!(
            apply_message(&mut discarding, Message::Close(None), true),
            Flow::Closed
        );
    }
}
