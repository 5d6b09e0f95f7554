//! Post-run cooldown with a once-per-second countdown.
//!
//! The countdown callback runs under the cooldown's lock, so once
//! [`Cooldown::stop`] returns no further tick from the stopped countdown is
//! delivered.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const TICK: Duration = Duration::from_secs(1);

#[derive(Default)]
struct CooldownInner {
    epoch: u64,
    ends_at: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
}

pub struct Cooldown {
    duration: Duration,
    inner: Arc<Mutex<CooldownInner>>,
}

fn lock(inner: &Mutex<CooldownInner>) -> MutexGuard<'_, CooldownInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl Cooldown {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            inner: Arc::new(Mutex::new(CooldownInner::default())),
        }
    }

    /// Start (or restart) the countdown when `allowed` holds at the moment
    /// the lock is taken. `on_tick` receives the whole seconds left, first
    /// immediately and then every second down to 0. Returns whether the
    /// countdown was started.
    pub fn start_if<A, F>(&self, allowed: A, on_tick: F) -> bool
    where
        A: FnOnce() -> bool,
        F: Fn(u64) + Send + 'static,
    {
        let mut guard = lock(&self.inner);
        if !allowed() {
            return false;
        }
        Self::halt(&mut guard);

        let seconds = self.duration.as_secs();
        guard.ends_at = Some(Instant::now() + self.duration);
        let epoch = guard.epoch;
        on_tick(seconds);
        if seconds == 0 {
            guard.ends_at = None;
            return true;
        }

        let inner = Arc::clone(&self.inner);
        guard.ticker = Some(tokio::spawn(async move {
            let mut left = seconds;
            while left > 0 {
                tokio::time::sleep(TICK).await;
                let mut guard = lock(&inner);
                if guard.epoch != epoch {
                    return;
                }
                left -= 1;
                if left == 0 {
                    guard.ends_at = None;
                    guard.ticker = None;
                }
                on_tick(left);
            }
            debug!("cooldown elapsed");
        }));
        true
    }

    pub fn stop(&self) {
        Self::halt(&mut lock(&self.inner));
    }

    /// Time left, or `None` when no cooldown is active.
    pub fn remaining(&self) -> Option<Duration> {
        let guard = lock(&self.inner);
        guard
            .ends_at
            .map(|end| end.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    fn halt(guard: &mut CooldownInner) {
        guard.epoch += 1;
        guard.ends_at = None;
        if let Some(ticker) = guard.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for Cooldown {
    fn drop(&mut self) {
        self.stop();
    }
}
