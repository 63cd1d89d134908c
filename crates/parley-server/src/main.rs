use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use parley_core::{telemetry, GatewayConfig};
use tracing::{error, info};

mod server;

/// Parley real-time chat gateway
#[derive(Parser, Debug)]
#[command(name = "parley-server", version, about)]
struct Cli {
    /// Path to a TOML configuration file (PARLEY__* variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Human-friendly multi-line logs for local development
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.pretty {
        telemetry::init_local("parley-server").map_err(|e| anyhow!(e))?;
    } else {
        telemetry::init("parley-server").map_err(|e| anyhow!(e))?;
    }

    info!("Parley gateway starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    config.log_config();

    let result = server::start(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Gateway terminated with error");
    }

    telemetry::shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["parley-server", "--pretty", "-c", "parley.toml"]).unwrap();
        assert!(cli.pretty);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("parley.toml")));

        let cli = Cli::try_parse_from(["parley-server"]).unwrap();
        assert!(!cli.pretty);
        assert!(cli.config.is_none());
    }
}
