//! Durable log contract.
//!
//! An append-only, partitioned log with keyed records, string-keyed byte
//! attributes, consumer-group offsets, and at-least-once delivery. Records
//! that share a key keep their relative order.
//!
//! Two backends implement the contract:
//!
//! - [`memory::MemoryLog`]: process-local, used for development and tests
//! - `kafka::{KafkaProducer, KafkaConsumer}`: behind the `kafka` feature

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

pub use memory::{MemoryConsumer, MemoryLog};

/// Attribute carrying how many times a record has been re-published for retry.
pub const RETRY_COUNT_HEADER: &str = "retry-count";

/// Errors raised by durable log backends.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to read from log: {0}")]
    Read(String),

    #[error("Failed to commit offset: {0}")]
    Commit(String),

    #[error("Log backend configuration error: {0}")]
    Config(String),
}

impl LogError {
    pub fn publish(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

/// A string-keyed byte attribute (Kafka header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A record to be appended to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutboundRecord {
    /// Partitioning key; records with equal keys stay ordered
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub attributes: Vec<Attribute>,
}

impl OutboundRecord {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// A record read from the log, with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub attributes: Vec<Attribute>,
}

impl LogRecord {
    /// Value of the first attribute named `key`.
    pub fn attribute(&self, key: &str) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_slice())
    }

    /// Retry count carried by the record. Absent or unparsable values count as 0.
    pub fn retry_count(&self) -> u32 {
        self.attribute(RETRY_COUNT_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Return `attributes` with the retry count set to `count`, replacing any
/// existing retry-count attribute and keeping every other one.
pub fn with_retry_count(attributes: &[Attribute], count: u32) -> Vec<Attribute> {
    let mut out: Vec<Attribute> = attributes
        .iter()
        .filter(|a| a.key != RETRY_COUNT_HEADER)
        .cloned()
        .collect();
    out.push(Attribute::new(RETRY_COUNT_HEADER, count.to_string()));
    out
}

/// Write side of the durable log.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Append a record to `topic`. Returns once the log acknowledged it.
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<(), LogError>;
}

/// Read side of the durable log, bound to one consumer group.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Wait for the next record at or after the group's committed position.
    async fn next_record(&mut self) -> Result<LogRecord, LogError>;

    /// Record that `record` and everything before it in its partition
    /// have been handled.
    async fn commit(&mut self, record: &LogRecord) -> Result<(), LogError>;
}

/// Publish with bounded local retries and exponential backoff.
///
/// Waits `base_backoff * 2^(n-1)` after the n-th failed attempt. The last
/// error is returned once `attempts` are exhausted.
pub async fn publish_with_backoff(
    producer: &dyn LogProducer,
    topic: &str,
    record: OutboundRecord,
    attempts: u32,
    base_backoff: Duration,
) -> Result<(), LogError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match producer.publish(topic, record.clone()).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(topic, attempt, "Publish succeeded after retry");
                }
                return Ok(());
            }
            Err(e) if attempt < attempts => {
                warn!(
                    topic,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Publish failed, will retry"
                );
                let backoff = base_backoff.saturating_mul(2_u32.saturating_pow(attempt - 1));
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record_with(attributes: Vec<Attribute>) -> LogRecord {
        LogRecord {
            topic: "messages".into(),
            partition: 0,
            offset: 0,
            key: None,
            payload: Vec::new(),
            attributes,
        }
    }

    #[test]
    fn test_retry_count_defaults_to_zero() {
        assert_eq!(record_with(vec![]).retry_count(), 0);
    }

    #[test]
    fn test_retry_count_unparsable_is_zero() {
        let record = record_with(vec![Attribute::new(RETRY_COUNT_HEADER, "abc")]);
        assert_eq!(record.retry_count(), 0);
    }

    #[test]
    fn test_retry_count_parsed() {
        let record = record_with(vec![Attribute::new(RETRY_COUNT_HEADER, "2")]);
        assert_eq!(record.retry_count(), 2);
    }

    #[test]
    fn test_with_retry_count_replaces_and_preserves() {
        let attrs = vec![
            Attribute::new("trace", "abc"),
            Attribute::new(RETRY_COUNT_HEADER, "1"),
        ];
        let updated = with_retry_count(&attrs, 2);

        assert_eq!(updated.len(), 2);
        assert!(updated.contains(&Attribute::new("trace", "abc")));
        assert_eq!(record_with(updated).retry_count(), 2);
    }

    struct FlakyProducer {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LogProducer for FlakyProducer {
        async fn publish(&self, topic: &str, _record: OutboundRecord) -> Result<(), LogError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(LogError::publish(topic, "broker unavailable"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_with_backoff_recovers() {
        let producer = FlakyProducer {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let result = publish_with_backoff(
            &producer,
            "messages",
            OutboundRecord::new(b"x".to_vec()),
            3,
            Duration::from_millis(100),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(producer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_with_backoff_gives_up() {
        let producer = FlakyProducer {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let result = publish_with_backoff(
            &producer,
            "messages",
            OutboundRecord::new(b"x".to_vec()),
            3,
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(LogError::Publish { .. })));
        assert_eq!(producer.calls.load(Ordering::SeqCst), 3);
    }
}
