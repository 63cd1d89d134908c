//! Process-local durable log.
//!
//! Each topic is a single partition held in memory. Consumer groups keep a
//! committed offset per topic; a new consumer in a group resumes from there,
//! so records that were read but never committed are delivered again.
//!
//! Records every subscribed group has committed are compacted away, keeping
//! only the last `retention` of them for inspection. Topics nobody reads
//! (the dead-letter topic) keep their last `retention` records. Offsets stay
//! absolute across compaction.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{LogConsumer, LogError, LogProducer, LogRecord, OutboundRecord};

/// Committed records kept per topic by [`MemoryLog::new`].
pub const DEFAULT_RETENTION: usize = 256;

#[derive(Default)]
struct Partition {
    /// Offset of `records[0]`
    base: i64,
    records: VecDeque<LogRecord>,
}

impl Partition {
    fn end(&self) -> i64 {
        self.base + self.records.len() as i64
    }

    /// First retained record at or after `offset`.
    fn read_from(&self, offset: i64) -> Option<&LogRecord> {
        let idx = usize::try_from(offset.max(self.base) - self.base).ok()?;
        self.records.get(idx)
    }

    fn truncate_before(&mut self, offset: i64) -> usize {
        let mut dropped = 0;
        while self.base < offset && self.records.pop_front().is_some() {
            self.base += 1;
            dropped += 1;
        }
        dropped
    }
}

struct Inner {
    topics: DashMap<String, Partition>,
    /// topic -> groups that have subscribed to it
    subscribers: DashMap<String, Vec<String>>,
    /// (group, topic) -> next offset to read
    committed: DashMap<(String, String), i64>,
    /// group -> number of commit calls
    commit_calls: DashMap<String, u64>,
    appended: Notify,
    retention: usize,
}

/// In-memory log shared by producers and consumers through cheap clones.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that keeps at most `retention` fully committed records per topic.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                subscribers: DashMap::new(),
                committed: DashMap::new(),
                commit_calls: DashMap::new(),
                appended: Notify::new(),
                retention,
            }),
        }
    }

    /// Create a consumer in `group` reading `topics`.
    ///
    /// Duplicate topic names are read once.
    pub fn consumer(&self, group: impl Into<String>, topics: &[&str]) -> MemoryConsumer {
        let mut subscribed: Vec<String> = Vec::with_capacity(topics.len());
        for topic in topics {
            if !subscribed.iter().any(|t| t == topic) {
                subscribed.push((*topic).to_string());
            }
        }

        let group = group.into();
        for topic in &subscribed {
            let mut groups = self.inner.subscribers.entry(topic.clone()).or_default();
            if !groups.contains(&group) {
                groups.push(group.clone());
            }
        }

        let positions = subscribed
            .iter()
            .map(|topic| {
                let start = self.committed_offset(&group, topic).unwrap_or(0);
                (topic.clone(), start)
            })
            .collect();

        MemoryConsumer {
            log: self.clone(),
            group,
            topics: subscribed,
            positions,
            next_topic: 0,
        }
    }

    /// Snapshot of the retained records in `topic`, in offset order.
    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        self.inner
            .topics
            .get(topic)
            .map(|partition| partition.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of retained records in `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|partition| partition.records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Offset the next record appended to `topic` will get.
    pub fn end_offset(&self, topic: &str) -> i64 {
        self.inner
            .topics
            .get(topic)
            .map(|partition| partition.end())
            .unwrap_or(0)
    }

    /// Committed position of `group` on `topic` (the next offset to read).
    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        self.inner
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .map(|offset| *offset)
    }

    /// How many times `group` has committed.
    pub fn commit_count(&self, group: &str) -> u64 {
        self.inner
            .commit_calls
            .get(group)
            .map(|count| *count)
            .unwrap_or(0)
    }

    fn append(&self, topic: &str, record: OutboundRecord) -> i64 {
        let offset = {
            let mut partition = self.inner.topics.entry(topic.to_string()).or_default();
            let offset = partition.end();
            partition.records.push_back(LogRecord {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: record.key,
                payload: record.payload,
                attributes: record.attributes,
            });
            offset
        };
        self.inner.appended.notify_waiters();
        self.compact(topic);
        offset
    }

    fn read_from(&self, topic: &str, offset: i64) -> Option<LogRecord> {
        let partition = self.inner.topics.get(topic)?;
        partition.read_from(offset).cloned()
    }

    /// Lowest committed position among the groups subscribed to `topic`.
    /// `None` when nobody reads the topic.
    fn low_watermark(&self, topic: &str) -> Option<i64> {
        let groups = self.inner.subscribers.get(topic)?;
        groups
            .iter()
            .map(|group| self.committed_offset(group, topic).unwrap_or(0))
            .min()
    }

    fn compact(&self, topic: &str) {
        let watermark = self.low_watermark(topic);
        let Some(mut partition) = self.inner.topics.get_mut(topic) else {
            return;
        };

        let floor = watermark.map_or(partition.end(), |w| w.min(partition.end()));
        let keep_from = floor.saturating_sub(self.inner.retention as i64);
        let dropped = partition.truncate_before(keep_from);
        if dropped > 0 {
            trace!(topic, dropped, base = partition.base, "Compacted topic");
        }
    }
}

impl fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLog")
            .field("topics", &self.inner.topics.len())
            .field("retention", &self.inner.retention)
            .finish()
    }
}

#[async_trait]
impl LogProducer for MemoryLog {
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<(), LogError> {
        let offset = self.append(topic, record);
        trace!(topic, offset, "Appended record");
        Ok(())
    }
}

/// Consumer over a [`MemoryLog`], bound to one group.
pub struct MemoryConsumer {
    log: MemoryLog,
    group: String,
    topics: Vec<String>,
    positions: HashMap<String, i64>,
    next_topic: usize,
}

impl MemoryConsumer {
    fn poll_once(&mut self) -> Option<LogRecord> {
        let count = self.topics.len();
        for i in 0..count {
            let idx = (self.next_topic + i) % count;
            let topic = &self.topics[idx];
            let position = self.positions.get(topic).copied().unwrap_or(0);
            if let Some(record) = self.log.read_from(topic, position) {
                self.positions.insert(topic.clone(), record.offset + 1);
                self.next_topic = (idx + 1) % count;
                return Some(record);
            }
        }
        None
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn next_record(&mut self) -> Result<LogRecord, LogError> {
        if self.topics.is_empty() {
            return Err(LogError::Config("consumer has no topics".into()));
        }

        loop {
            let inner = self.log.inner.clone();
            let appended = inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(record) = self.poll_once() {
                return Ok(record);
            }
            appended.await;
        }
    }

    async fn commit(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let next = record.offset + 1;
        let key = (self.group.clone(), record.topic.clone());
        self.log
            .inner
            .committed
            .entry(key)
            .and_modify(|offset| *offset = (*offset).max(next))
            .or_insert(next);
        *self
            .log
            .inner
            .commit_calls
            .entry(self.group.clone())
            .or_insert(0) += 1;
        self.log.compact(&record.topic);
        debug!(group = %self.group, topic = %record.topic, offset = record.offset, "Committed");
        Ok(())
    }
}
