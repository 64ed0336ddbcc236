use clap::Parser;
use tracing_subscriber::EnvFilter;

use ec_domain::config::{ConfigSeverity, OrchestratorConfig};
use ec_orchestrator::cli::{Cli, Command, ConfigCommand};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Config {
            command: ConfigCommand::Validate,
        }) => {
            init_tracing();
            let config = OrchestratorConfig::from_env();
            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                    ConfigSeverity::Error => tracing::error!("config: {issue}"),
                }
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                anyhow::bail!(
                    "config validation failed with {} error(s)",
                    issues
                        .iter()
                        .filter(|i| i.severity == ConfigSeverity::Error)
                        .count()
                );
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Config {
            command: ConfigCommand::Show,
        }) => {
            let config = OrchestratorConfig::from_env();
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("ec-orchestrator {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for everything the orchestrator logs.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ec_orchestrator=debug")),
        )
        .json()
        .init();
}
