use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use ndt7_client::analysis::{capability_checklist, warnings};
use ndt7_client::config::SpeedTestConfig;
use ndt7_client::orchestrator::{Scenario, SpeedTestOrchestrator, SpeedTestState};
use ndt7_client::throughput::report;

#[derive(Parser)]
#[command(
    name = "ndt7-client",
    about = "NDT7 bandwidth measurement client",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $NDT7_CLIENT_CONFIG, then ./ndt7-client.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full ping/download/upload test against the nearest server
    Run {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Produce synthetic results without touching the network
        #[arg(long)]
        simulate: bool,
    },

    /// Show warnings and the capability checklist for a fixed preset
    Scenario {
        #[arg(value_enum)]
        preset: Preset,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Fast,
    Slow,
    HighLatency,
    Error,
}

impl From<Preset> for Scenario {
    fn from(preset: Preset) -> Self {
        match preset {
            Preset::Fast => Scenario::Fast,
            Preset::Slow => Scenario::Slow,
            Preset::HighLatency => Scenario::HighLatency,
            Preset::Error => Scenario::Error,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SpeedTestConfig> {
    match path {
        Some(path) => SpeedTestConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(SpeedTestConfig::load_or_default()),
    }
}

fn print_state(state: &SpeedTestState) {
    if let Some(result) = &state.result {
        println!("\n=== Speed Test Result ===");
        println!("{}", report::format_summary(result));
    }
    if let Some(text) = report::format_warnings(&state.warnings) {
        println!("\nWarnings:");
        println!("{}", text);
    }
    if !state.checklist.is_empty() {
        println!("\nWhat this connection handles:");
        for check in &state.checklist {
            let mark = if check.pass { "PASS" } else { "FAIL" };
            println!("  {:<4} {}", mark, check.capability.label());
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    ndt7_client::telemetry::init(&config.logging);

    match cli.command {
        Commands::Run { json, simulate } => {
            config.orchestrator.simulate |= simulate;
            let orchestrator = SpeedTestOrchestrator::from_config(&config)?;
            tracing::info!(provider = orchestrator.provider_name(), "Running speed test");

            let state = ndt7_client::run_once(&orchestrator).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                print_state(&state);
            }
        }
        Commands::Scenario { preset, json } => {
            let scenario = Scenario::from(preset);
            let Some(metrics) = scenario.metrics() else {
                anyhow::bail!("scenario {:?} has no metrics: the test failed", scenario);
            };
            let warnings = warnings(&metrics);
            let checklist = capability_checklist(&metrics);

            if json {
                let out = serde_json::json!({
                    "metrics": metrics,
                    "warnings": warnings,
                    "checklist": checklist,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                print_state(&SpeedTestState {
                    warnings,
                    checklist,
                    ..SpeedTestState::default()
                });
            }
        }
    }

    Ok(())
}
