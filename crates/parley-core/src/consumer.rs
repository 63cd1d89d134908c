//! Persistence consumer.
//!
//! A single serial loop over the main (and retry) topic that stores every
//! message and moves failures through the retry / dead-letter protocol:
//!
//! ```text
//! Received -> Decoded -> Stored -> Commit -> Received
//!                     -> StoreFailed -> Retry (retry-count + 1) -> Commit -> Received
//!                                    -> DeadLetter              -> Commit -> Received
//! ```
//!
//! An offset is committed once a terminal action for the record has been
//! durably recorded: the message was stored (or already was), or a retry or
//! dead-letter copy was acknowledged by the log. Undecodable records are
//! skipped without a commit.
//!
//! A record whose retry / dead-letter publish fails is held: the consumer
//! handles it again with a growing backoff and does not read further until it
//! reaches a committable outcome. Commits are per-partition positions, so
//! moving on would let the next commit cover the held record. When stopped
//! while holding, the record stays uncommitted and is redelivered on restart.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConsumerConfig, LogConfig};
use crate::log::{
    publish_with_backoff, with_retry_count, LogConsumer, LogError, LogProducer, LogRecord,
    OutboundRecord,
};
use crate::message::Message;
use crate::metrics;
use crate::store::{MessageStore, StoreError};

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const MAX_HOLD_BACKOFF: Duration = Duration::from_secs(30);

/// Topics and limits the consumer works with.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub main_topic: String,
    /// Topic retries are republished to; equal to `main_topic` by default
    pub retry_topic: String,
    pub dead_letter_topic: String,
    /// Store failures tolerated before a message is dead-lettered
    pub max_retry: u32,
    /// Local attempts for each retry / dead-letter publish
    pub publish_attempts: u32,
    pub publish_backoff: Duration,
}

impl ConsumerSettings {
    pub fn new(log: &LogConfig, consumer: &ConsumerConfig) -> Self {
        Self {
            main_topic: log.main_topic.clone(),
            retry_topic: log.retry_topic().to_string(),
            dead_letter_topic: log.dead_letter_topic.clone(),
            max_retry: consumer.max_retry,
            publish_attempts: consumer.publish_attempts,
            publish_backoff: Duration::from_millis(consumer.publish_backoff_ms),
        }
    }

    /// Topics the consumer reads. Never includes the dead-letter topic.
    pub fn subscribed_topics(&self) -> Vec<&str> {
        if self.retry_topic == self.main_topic {
            vec![self.main_topic.as_str()]
        } else {
            vec![self.main_topic.as_str(), self.retry_topic.as_str()]
        }
    }
}

/// What happened to one log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stored for the first time
    Stored,
    /// The store already had this message id
    AlreadyStored,
    /// Store failed; republished with the new retry count
    Retried { retry_count: u32 },
    /// Store failed with the retry budget exhausted (or the message is
    /// invalid); the payload now sits in the dead-letter topic
    DeadLettered { retry_count: u32 },
    /// The payload could not be decoded
    Undecodable,
    /// Store failed and the retry / dead-letter publish kept failing until
    /// the consumer was stopped
    PublishFailed,
}

impl Outcome {
    /// Whether the record's offset is committed after this outcome.
    pub fn commits(&self) -> bool {
        !matches!(self, Outcome::Undecodable | Outcome::PublishFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Stored => "stored",
            Outcome::AlreadyStored => "already_stored",
            Outcome::Retried { .. } => "retried",
            Outcome::DeadLettered { .. } => "dead_lettered",
            Outcome::Undecodable => "undecodable",
            Outcome::PublishFailed => "publish_failed",
        }
    }
}

/// Serial reader that persists every message in the log.
pub struct PersistenceConsumer {
    consumer: Box<dyn LogConsumer>,
    store: Arc<dyn MessageStore>,
    producer: Arc<dyn LogProducer>,
    settings: ConsumerSettings,
}

impl PersistenceConsumer {
    pub fn new(
        consumer: Box<dyn LogConsumer>,
        store: Arc<dyn MessageStore>,
        producer: Arc<dyn LogProducer>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            consumer,
            store,
            producer,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Run until `cancel` fires.
    ///
    /// Cancellation is observed between records and while a record is held.
    /// A record that reached a committable outcome is always committed
    /// before the loop stops.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            topics = ?self.settings.subscribed_topics(),
            dead_letter_topic = %self.settings.dead_letter_topic,
            max_retry = self.settings.max_retry,
            "Persistence consumer started"
        );

        loop {
            match self.step(&cancel).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to read from log");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!("Persistence consumer stopped");
    }

    /// Read and process one record. Returns `Ok(None)` once cancelled.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<Option<Outcome>, LogError> {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            record = self.consumer.next_record() => record?,
        };

        Ok(Some(self.process(&record, cancel).await))
    }

    /// Apply the state machine to one record, committing where it allows.
    ///
    /// Returns [`Outcome::PublishFailed`] only when `cancel` fires while the
    /// record is held.
    #[instrument(
        skip(self, record, cancel),
        fields(topic = %record.topic, partition = record.partition, offset = record.offset)
    )]
    pub async fn process(&mut self, record: &LogRecord, cancel: &CancellationToken) -> Outcome {
        let mut attempt: u32 = 0;
        let outcome = loop {
            let outcome = self.handle(record).await;
            if outcome != Outcome::PublishFailed {
                break outcome;
            }

            let delay = self.hold_backoff(attempt);
            attempt = attempt.saturating_add(1);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Holding record until the log accepts it");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break outcome,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        metrics::records_processed().add(1, &[KeyValue::new("outcome", outcome.as_str())]);

        if outcome.commits() {
            match self.consumer.commit(record).await {
                Ok(()) => metrics::offset_commits().add(1, &[]),
                Err(e) => warn!(error = %e, "Offset commit failed"),
            }
        }

        outcome
    }

    async fn handle(&self, record: &LogRecord) -> Outcome {
        let message = match Message::decode(&record.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    size = record.payload.len(),
                    key = ?record.key.as_deref().map(String::from_utf8_lossy),
                    error = %e,
                    "Skipping undecodable log record"
                );
                return Outcome::Undecodable;
            }
        };

        let retry_count = record.retry_count();
        match self.store.store(&message).await {
            Ok(()) => {
                debug!(message_id = %message.id, "Message stored");
                Outcome::Stored
            }
            Err(StoreError::Duplicate(id)) => {
                debug!(message_id = %id, "Message already stored");
                Outcome::AlreadyStored
            }
            Err(StoreError::Invalid(reason)) => {
                warn!(message_id = %message.id, reason = %reason, "Invalid message, dead-lettering");
                self.dead_letter(record, retry_count).await
            }
            Err(e) if retry_count < self.settings.max_retry => {
                warn!(message_id = %message.id, retry_count, error = %e, "Store failed, retrying");
                self.retry(record, retry_count + 1).await
            }
            Err(e) => {
                error!(
                    message_id = %message.id,
                    retry_count,
                    error = %e,
                    "Store failed, retries exhausted"
                );
                self.dead_letter(record, retry_count).await
            }
        }
    }

    async fn retry(&self, record: &LogRecord, retry_count: u32) -> Outcome {
        let republished = OutboundRecord {
            key: record.key.clone(),
            payload: record.payload.clone(),
            attributes: with_retry_count(&record.attributes, retry_count),
        };

        match self
            .publish(&self.settings.retry_topic, republished)
            .await
        {
            Ok(()) => Outcome::Retried { retry_count },
            Err(e) => {
                error!(topic = %self.settings.retry_topic, error = %e, "Retry publish failed");
                Outcome::PublishFailed
            }
        }
    }

    async fn dead_letter(&self, record: &LogRecord, retry_count: u32) -> Outcome {
        let unmodified = OutboundRecord {
            key: record.key.clone(),
            payload: record.payload.clone(),
            attributes: record.attributes.clone(),
        };

        match self
            .publish(&self.settings.dead_letter_topic, unmodified)
            .await
        {
            Ok(()) => Outcome::DeadLettered { retry_count },
            Err(e) => {
                error!(
                    topic = %self.settings.dead_letter_topic,
                    error = %e,
                    "Dead-letter publish failed"
                );
                Outcome::PublishFailed
            }
        }
    }

    fn hold_backoff(&self, attempt: u32) -> Duration {
        self.settings
            .publish_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(MAX_HOLD_BACKOFF)
    }

    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<(), LogError> {
        publish_with_backoff(
            self.producer.as_ref(),
            topic,
            record,
            self.settings.publish_attempts,
            self.settings.publish_backoff,
        )
        .await
    }
}
