//! Pipeline metrics.
//!
//! Uses the global OpenTelemetry meter provider. Without an installed
//! provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("parley"))
}

// ============================================================================
// Gateway
// ============================================================================

/// Gauge for live registered connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("parley.connections.active")
        .with_description("Current number of registered connections")
        .with_unit("connection")
        .build()
}

/// Counter for inbound messages, labelled by delivery result.
pub fn messages_routed() -> Counter<u64> {
    meter()
        .u64_counter("parley.messages.routed")
        .with_description("Total inbound messages handled by routers")
        .with_unit("message")
        .build()
}

/// Counter for inbound text and binary frames.
pub fn frames_received() -> Counter<u64> {
    meter()
        .u64_counter("parley.frames.received")
        .with_description("Total data frames received from clients")
        .with_unit("frame")
        .build()
}

/// Counter for inbound frames that could not be decoded.
pub fn frames_malformed() -> Counter<u64> {
    meter()
        .u64_counter("parley.frames.malformed")
        .with_description("Total inbound frames that failed to decode")
        .with_unit("frame")
        .build()
}

/// Counter for durable publishes, labelled by result.
pub fn log_publishes() -> Counter<u64> {
    meter()
        .u64_counter("parley.log.publishes")
        .with_description("Total publishes to the durable log")
        .with_unit("record")
        .build()
}

// ============================================================================
// Persistence
// ============================================================================

/// Counter for consumed records, labelled by outcome.
pub fn records_processed() -> Counter<u64> {
    meter()
        .u64_counter("parley.consumer.records")
        .with_description("Total log records processed by the persistence consumer")
        .with_unit("record")
        .build()
}

/// Counter for committed log offsets.
pub fn offset_commits() -> Counter<u64> {
    meter()
        .u64_counter("parley.consumer.commits")
        .with_description("Total offsets committed by the persistence consumer")
        .with_unit("commit")
        .build()
}
