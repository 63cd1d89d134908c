//! Persistence consumer process: reads the durable log and writes messages
//! to the store, re-publishing failures for retry or dead-lettering them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use parley_core::config::LogBackend;
use parley_core::{telemetry, LibSqlMessageStore, PersistConfig, PersistenceConsumer};
use parley_shutdown::GracefulShutdown;
use tracing::{error, info};

/// Parley persistence consumer
#[derive(Parser, Debug)]
#[command(name = "parley-persist", version, about)]
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
        telemetry::init_local("parley-persist").map_err(|e| anyhow!(e))?;
    } else {
        telemetry::init("parley-persist").map_err(|e| anyhow!(e))?;
    }
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PersistConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    config.log_config();

    let result = run(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Persistence consumer terminated with error");
    }

    telemetry::shutdown();
    result
}

async fn run(config: PersistConfig) -> Result<()> {
    let store = LibSqlMessageStore::open(config.store.path.as_deref())
        .await
        .context("Failed to open message store")?;
    store
        .initialize()
        .await
        .context("Failed to initialize message store schema")?;

    let consumer = build_consumer(&config, Arc::new(store))?;

    // The consumer holds no connections; the drain step returns immediately.
    let shutdown = Arc::new(GracefulShutdown::new(std::time::Duration::ZERO));
    let stop = shutdown.stop_token();
    let lifecycle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.run().await })
    };

    info!(
        group = %config.log.consumer_group,
        topics = ?consumer.settings().subscribed_topics(),
        "Persistence consumer running"
    );
    consumer.run(stop.clone()).await;

    stop.cancel();
    let signal = lifecycle.await.context("Shutdown task panicked")?;
    info!(?signal, "Persistence consumer stopped");
    Ok(())
}

#[cfg(feature = "kafka")]
fn build_consumer(config: &PersistConfig, store: Arc<LibSqlMessageStore>) -> Result<PersistenceConsumer> {
    use parley_core::log::kafka::{KafkaConsumer, KafkaProducer};
    use parley_core::ConsumerSettings;

    if config.log.backend != LogBackend::Kafka {
        return Err(memory_backend_error());
    }

    let settings = ConsumerSettings::new(&config.log, &config.consumer);
    let source = KafkaConsumer::new(
        &config.log.brokers,
        &config.log.consumer_group,
        &settings.subscribed_topics(),
    )
    .context("Failed to create Kafka consumer")?;
    let producer = KafkaProducer::new(&config.log.brokers, config.log.publish_timeout())
        .context("Failed to create Kafka producer")?;

    Ok(PersistenceConsumer::new(
        Box::new(source),
        store,
        Arc::new(producer),
        settings,
    ))
}

#[cfg(not(feature = "kafka"))]
fn build_consumer(config: &PersistConfig, _store: Arc<LibSqlMessageStore>) -> Result<PersistenceConsumer> {
    if config.log.backend != LogBackend::Kafka {
        return Err(memory_backend_error());
    }
    Err(anyhow!(
        "log.backend = kafka requires parley-persist built with the `kafka` feature"
    ))
}

fn memory_backend_error() -> anyhow::Error {
    anyhow!(
        "log.backend = memory is process-local; the gateway runs the persistence consumer itself in that mode"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["parley-persist", "--pretty", "-c", "parley.toml"]).unwrap();
        assert!(cli.pretty);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("parley.toml")));

        let cli = Cli::try_parse_from(["parley-persist"]).unwrap();
        assert!(!cli.pretty);
        assert!(cli.config.is_none());
    }
}
