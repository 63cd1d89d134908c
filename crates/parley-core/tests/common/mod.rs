//! Shared test doubles for parley-core integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use parley_core::log::{LogError, LogProducer, MemoryLog, OutboundRecord};
use parley_core::{Message, MessageStore, StoreError, UserId};

/// Store that fails a fixed number of times, then records messages.
pub struct FlakyStore {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    stored: Mutex<Vec<Message>>,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            stored: Mutex::new(Vec::new()),
        })
    }

    /// A store that never succeeds.
    pub fn always_failing() -> Arc<Self> {
        Self::new(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Vec<Message> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn store(&self, message: &Message) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Database("database unavailable".into()));
        }

        let mut stored = self.stored.lock().unwrap();
        if stored.iter().any(|m| m.id == message.id) {
            return Err(StoreError::Duplicate(message.id));
        }
        stored.push(message.clone());
        Ok(())
    }
}

/// Producer that rejects every publish.
pub struct FailingProducer;

#[async_trait]
impl LogProducer for FailingProducer {
    async fn publish(&self, topic: &str, _record: OutboundRecord) -> Result<(), LogError> {
        Err(LogError::publish(topic, "broker unavailable"))
    }
}

/// Producer that rejects a fixed number of publishes, then appends to a log.
pub struct FlakyProducer {
    log: MemoryLog,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyProducer {
    pub fn new(log: MemoryLog, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            log,
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogProducer for FlakyProducer {
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<(), LogError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(LogError::publish(topic, "broker unavailable"));
        }
        self.log.publish(topic, record).await
    }
}

/// Producer that records every publish.
#[derive(Default)]
pub struct RecordingProducer {
    published: Mutex<Vec<(String, OutboundRecord)>>,
}

impl RecordingProducer {
    pub fn published(&self) -> Vec<(String, OutboundRecord)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogProducer for RecordingProducer {
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<(), LogError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), record));
        Ok(())
    }
}

/// A message with id and timestamp already assigned.
pub fn ready_message(content: &str) -> Message {
    Message::new(UserId::random(), UserId::random(), content).prepare_for_delivery(Utc::now())
}

/// Wire form of a message as a client would send it (no id, no timestamp).
pub fn client_frame(sender: UserId, recipient: UserId, content: &str) -> String {
    format!(
        r#"{{"sender_id":"{sender}","recipient_id":"{recipient}","content":"{content}"}}"#
    )
}
