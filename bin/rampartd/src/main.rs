//! ---
//! rampart_section: "04-daemon"
//! rampart_subsection: "binary"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Binary entrypoint for the Rampart resilience daemon."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rampart_common::config::from_path;
use rampart_common::{init_tracing, load_with_source, Loaded, LoggingConfig, Validate, ENV_CONFIG_PATH};
use rampart_metrics::{encode_text, new_registry};
use rampart_resilience::{FaultConfig, FaultType, Resilience, ResilienceConfig, ResilienceMetrics};
use serde::Deserialize;
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Rampart resilience daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliFault {
    Latency,
    Error,
    ServiceUnavailable,
    ResourceExhaustion,
    NetworkPartition,
}

impl From<CliFault> for FaultType {
    fn from(value: CliFault) -> Self {
        match value {
            CliFault::Latency => FaultType::Latency,
            CliFault::Error => FaultType::Error,
            CliFault::ServiceUnavailable => FaultType::ServiceUnavailable,
            CliFault::ResourceExhaustion => FaultType::ResourceExhaustion,
            CliFault::NetworkPartition => FaultType::NetworkPartition,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Load and validate the configuration")]
    Validate,
    #[command(about = "Wire the components and run their background loops until Ctrl-C")]
    Run,
    #[command(about = "Print component statistics as JSON")]
    Status {
        #[arg(long, help = "Also print Prometheus metrics")]
        metrics: bool,
    },
    #[command(about = "Run one chaos experiment against a simulated target")]
    Chaos {
        #[arg(long, value_enum)]
        fault: CliFault,
        #[arg(long)]
        target: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_name = "MS")]
        duration_ms: Option<u64>,
        #[arg(long, value_name = "RATE")]
        error_rate: Option<f64>,
        #[arg(long, value_name = "MS")]
        latency_ms: Option<u64>,
    },
}

/// Top-level document read by the daemon.
#[derive(Debug, Clone, Deserialize)]
struct AppConfig {
    #[serde(default)]
    logging: LoggingConfig,
    resilience: ResilienceConfig,
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<()> {
        self.resilience.validate()
    }
}

fn load_config(cli: &Cli) -> Result<Loaded<AppConfig>> {
    if let Some(path) = &cli.config {
        let config = from_path(path)?;
        return Ok(Loaded {
            config,
            source: path.clone(),
        });
    }
    let candidates = [
        PathBuf::from("configs/rampart.toml"),
        PathBuf::from("configs/rampart.example.toml"),
    ];
    load_with_source(ENV_CONFIG_PATH, &candidates)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Loaded { config, source } = load_config(&cli)?;
    let command = cli.command.unwrap_or(Commands::Run);

    let mut logging = config.logging.clone();
    if !matches!(command, Commands::Run) {
        logging.file_output = false;
    }
    init_tracing("rampartd", &logging)?;
    info!(config_path = %source.display(), "configuration loaded");

    match command {
        Commands::Validate => {
            println!("configuration {} is valid", source.display());
        }
        Commands::Run => run_daemon(config.resilience).await?,
        Commands::Status { metrics } => {
            let registry = new_registry();
            let resilience = Resilience::from_config(
                &config.resilience,
                Some(ResilienceMetrics::new(registry.clone())?),
            )?;
            resilience.health.check_all().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&resilience.snapshot())
                    .context("failed to render status")?
            );
            if metrics {
                print!("{}", encode_text(&registry)?);
            }
        }
        Commands::Chaos {
            fault,
            target,
            name,
            duration_ms,
            error_rate,
            latency_ms,
        } => {
            let resilience = Resilience::from_config(&config.resilience, None)?;
            let mut fault_config = FaultConfig::default();
            if let Some(rate) = error_rate {
                fault_config = fault_config.with_error_rate(rate);
            }
            if let Some(latency) = latency_ms {
                fault_config = fault_config.with_latency(Duration::from_millis(latency));
            }
            let fault: FaultType = fault.into();
            let name = name.unwrap_or_else(|| format!("{fault}-{target}"));
            let experiment = resilience
                .chaos
                .run_experiment(
                    &name,
                    fault,
                    &target,
                    fault_config,
                    duration_ms.map(Duration::from_millis),
                )
                .await?;
            resilience.stop();
            println!(
                "{}",
                serde_json::to_string_pretty(&experiment)
                    .context("failed to render experiment")?
            );
        }
    }

    Ok(())
}

async fn run_daemon(config: ResilienceConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = ResilienceMetrics::new(registry)?;
    let resilience = Resilience::from_config(&config, Some(metrics))?;
    let handles = resilience.start();
    info!(loops = handles.len(), "daemon running; waiting for termination signal");

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    resilience.stop();
    for handle in handles {
        handle.await.context("background loop panicked")?;
    }
    let snapshot = resilience.snapshot();
    info!(
        failures = snapshot.self_healer.total_failures,
        recoveries = snapshot.self_healer.total_recoveries,
        level = %snapshot.degradation.current_level,
        "shutdown complete",
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_configuration_is_valid() {
        let document = include_str!("../../../configs/rampart.example.toml");
        let config: AppConfig = toml::from_str(document).unwrap();
        config.validate().unwrap();
        assert!(!config.resilience.degradation.features.is_empty());
    }

    #[test]
    fn cli_parses_chaos_arguments() {
        let cli = Cli::try_parse_from([
            "rampartd",
            "chaos",
            "--fault",
            "service-unavailable",
            "--target",
            "payments",
            "--duration-ms",
            "500",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Chaos {
                fault,
                target,
                duration_ms,
                ..
            }) => {
                assert_eq!(FaultType::from(fault), FaultType::ServiceUnavailable);
                assert_eq!(target, "payments");
                assert_eq!(duration_ms, Some(500));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
