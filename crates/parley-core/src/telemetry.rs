//! Logging initialization for Parley binaries.
//!
//! Environment variables:
//! - `RUST_LOG`: log filter (default: `info,parley_core=debug,<service>=debug`)
//! - `PARLEY_LOG_FORMAT`: `json` for structured output, anything else for text

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(service: &str) -> EnvFilter {
    let crate_target = service.replace('-', "_");
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,parley_core=debug,{crate_target}=debug")))
}

fn json_requested() -> bool {
    std::env::var("PARLEY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Initialize logging for a service.
pub fn init(service: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(filter(service));

    if json_requested() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?;
    }

    tracing::info!(service, "Telemetry initialized");
    Ok(())
}

/// Initialize human-friendly logging for local development.
pub fn init_local(service: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(filter(service))
        .with(tracing_subscriber::fmt::layer().with_target(true).pretty())
        .try_init()?;

    tracing::info!(service, "Local telemetry initialized");
    Ok(())
}

/// Flush and shut down telemetry before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}
