//! Kafka-backed durable log.
//!
//! The producer waits for acknowledgement from all in-sync replicas; the
//! consumer disables auto-commit and commits explicitly after each record
//! has been handled.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message as _, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{Attribute, LogConsumer, LogError, LogProducer, LogRecord, OutboundRecord};

/// Producer writing to a Kafka cluster.
pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    /// Create a producer.
    ///
    /// - `acks=all`: wait for all in-sync replicas
    /// - `enable.idempotence=true`: no duplicates within a producer session
    pub fn new(brokers: &str, timeout: Duration) -> Result<Self, LogError> {
        info!(brokers, "Initializing Kafka producer");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("linger.ms", "10")
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()
            .map_err(|e| LogError::Config(format!("Failed to create Kafka producer: {e}")))?;

        Ok(Self { producer, timeout })
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<(), LogError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.attributes.len());
        for attribute in &record.attributes {
            headers = headers.insert(Header {
                key: attribute.key.as_str(),
                value: Some(attribute.value.as_slice()),
            });
        }

        let mut future_record = FutureRecord::to(topic)
            .payload(&record.payload)
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        match self
            .producer
            .send(future_record, Timeout::After(self.timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(topic, partition, offset, "Record persisted to Kafka");
                Ok(())
            }
            Err((err, _)) => Err(LogError::publish(topic, err)),
        }
    }
}

/// Consumer reading a set of topics as one consumer group.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// Create a consumer and subscribe it to `topics`.
    ///
    /// - `enable.auto.commit=false`: offsets are committed by the caller
    /// - `auto.offset.reset=earliest`: a new group reads from the beginning
    pub fn new(brokers: &str, group_id: &str, topics: &[&str]) -> Result<Self, LogError> {
        info!(brokers, group_id, ?topics, "Initializing Kafka consumer");

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .create()
            .map_err(|e| LogError::Config(format!("Failed to create Kafka consumer: {e}")))?;

        let mut subscribed: Vec<&str> = Vec::with_capacity(topics.len());
        for topic in topics {
            if !subscribed.contains(topic) {
                subscribed.push(topic);
            }
        }
        consumer
            .subscribe(&subscribed)
            .map_err(|e| LogError::Config(format!("Failed to subscribe: {e}")))?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn next_record(&mut self) -> Result<LogRecord, LogError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| LogError::Read(e.to_string()))?;

        let attributes = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| Attribute::new(h.key, h.value.unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(LogRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            attributes,
        })
    }

    async fn commit(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| LogError::Commit(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| LogError::Commit(e.to_string()))
    }
}
