//! Persistence consumer scenarios against the in-memory log.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ready_message, FailingProducer, FlakyProducer, FlakyStore};
use parley_core::log::{LogProducer, MemoryLog, OutboundRecord, RETRY_COUNT_HEADER};
use parley_core::{
    ConsumerSettings, LibSqlMessageStore, Message, MessageStore, Outcome, PersistenceConsumer,
    UserId,
};
use tokio_util::sync::CancellationToken;

const GROUP: &str = "persistence";

fn settings(max_retry: u32) -> ConsumerSettings {
    ConsumerSettings {
        main_topic: "messages".into(),
        retry_topic: "messages".into(),
        dead_letter_topic: "dead-messages".into(),
        max_retry,
        publish_attempts: 1,
        publish_backoff: Duration::from_millis(1),
    }
}

fn consumer_for(
    log: &MemoryLog,
    store: Arc<dyn MessageStore>,
    settings: ConsumerSettings,
) -> PersistenceConsumer {
    let source = log.consumer(GROUP, &settings.subscribed_topics());
    PersistenceConsumer::new(Box::new(source), store, Arc::new(log.clone()), settings)
}

async fn publish_message(log: &MemoryLog, message: &Message) {
    let record = OutboundRecord::new(message.encode().unwrap())
        .with_key(message.recipient_id.to_string().into_bytes());
    log.publish("messages", record).await.unwrap();
}

#[tokio::test]
async fn test_store_success_commits_once_without_republish() {
    let log = MemoryLog::new();
    let store = FlakyStore::new(0);
    let mut consumer = consumer_for(&log, store.clone(), settings(3));
    let message = ready_message("hello");
    publish_message(&log, &message).await;

    let outcome = consumer.step(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, Some(Outcome::Stored));
    assert_eq!(store.stored(), vec![message]);
    assert_eq!(log.commit_count(GROUP), 1);
    assert_eq!(log.committed_offset(GROUP, "messages"), Some(1));
    assert_eq!(log.len("messages"), 1);
    assert!(log.is_empty("dead-messages"));
}

#[tokio::test]
async fn test_exhausted_retries_go_to_dead_letter_topic() {
    let log = MemoryLog::new();
    let store = FlakyStore::always_failing();
    let mut consumer = consumer_for(&log, store.clone(), settings(2));
    let message = ready_message("doomed");
    publish_message(&log, &message).await;
    let cancel = CancellationToken::new();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(consumer.step(&cancel).await.unwrap().unwrap());
    }

    assert_eq!(
        outcomes,
        vec![
            Outcome::Retried { retry_count: 1 },
            Outcome::Retried { retry_count: 2 },
            Outcome::DeadLettered { retry_count: 2 },
        ]
    );
    assert_eq!(store.attempts(), 3);

    // Original plus exactly two republications, counting 1 and 2.
    let main = log.records("messages");
    let counts: Vec<u32> = main.iter().map(|r| r.retry_count()).collect();
    assert_eq!(counts, vec![0, 1, 2]);
    assert!(main.iter().all(|r| r.payload == main[0].payload));
    assert!(main.iter().all(|r| r.key == main[0].key));

    let dead = log.records("dead-messages");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, main[0].payload);

    // The dead-lettered copy is never read back.
    let next = tokio::time::timeout(Duration::from_millis(50), consumer.step(&cancel)).await;
    assert!(next.is_err());
    assert_eq!(store.attempts(), 3);
    assert_eq!(log.committed_offset(GROUP, "messages"), Some(3));
}

#[tokio::test]
async fn test_retry_count_increments_by_one_per_failure() {
    let log = MemoryLog::new();
    let store = FlakyStore::new(2);
    let mut consumer = consumer_for(&log, store.clone(), settings(5));
    let message = ready_message("eventually");
    publish_message(&log, &message).await;
    let cancel = CancellationToken::new();

    assert_eq!(
        consumer.step(&cancel).await.unwrap(),
        Some(Outcome::Retried { retry_count: 1 })
    );
    assert_eq!(
        consumer.step(&cancel).await.unwrap(),
        Some(Outcome::Retried { retry_count: 2 })
    );
    assert_eq!(consumer.step(&cancel).await.unwrap(), Some(Outcome::Stored));

    assert_eq!(store.stored().len(), 1);
    assert!(log.is_empty("dead-messages"));
}

#[tokio::test]
async fn test_other_attributes_survive_republication() {
    let log = MemoryLog::new();
    let store = FlakyStore::new(1);
    let mut consumer = consumer_for(&log, store, settings(3));
    let message = ready_message("traced");
    let record = OutboundRecord::new(message.encode().unwrap()).with_attributes(vec![
        parley_core::log::Attribute::new("trace-id", "abc123"),
    ]);
    log.publish("messages", record).await.unwrap();

    consumer.step(&CancellationToken::new()).await.unwrap();

    let republished = &log.records("messages")[1];
    assert_eq!(republished.attribute("trace-id"), Some(&b"abc123"[..]));
    assert_eq!(republished.attribute(RETRY_COUNT_HEADER), Some(&b"1"[..]));
}

#[tokio::test]
async fn test_duplicate_is_treated_as_stored() {
    let log = MemoryLog::new();
    let store = FlakyStore::new(0);
    let mut consumer = consumer_for(&log, store.clone(), settings(3));
    let message = ready_message("twice");
    publish_message(&log, &message).await;
    publish_message(&log, &message).await;
    let cancel = CancellationToken::new();

    assert_eq!(consumer.step(&cancel).await.unwrap(), Some(Outcome::Stored));
    assert_eq!(
        consumer.step(&cancel).await.unwrap(),
        Some(Outcome::AlreadyStored)
    );

    assert_eq!(store.stored().len(), 1);
    assert_eq!(log.committed_offset(GROUP, "messages"), Some(2));
    assert_eq!(log.len("messages"), 2);
}

#[tokio::test]
async fn test_undecodable_record_is_skipped_without_commit() {
    let log = MemoryLog::new();
    let store = FlakyStore::new(0);
    let mut consumer = consumer_for(&log, store.clone(), settings(3));
    log.publish("messages", OutboundRecord::new(b"{garbage".to_vec()))
        .await
        .unwrap();
    let message = ready_message("after garbage");
    publish_message(&log, &message).await;
    let cancel = CancellationToken::new();

    assert_eq!(consumer.step(&cancel).await.unwrap(), Some(Outcome::Undecodable));
    assert_eq!(log.committed_offset(GROUP, "messages"), None);

    assert_eq!(consumer.step(&cancel).await.unwrap(), Some(Outcome::Stored));
    assert_eq!(store.stored(), vec![message]);
    assert_eq!(log.commit_count(GROUP), 1);
}

#[tokio::test]
async fn test_uncommitted_record_is_redelivered_after_restart() {
    let log = MemoryLog::new();
    log.publish("messages", OutboundRecord::new(b"{garbage".to_vec()))
        .await
        .unwrap();

    let mut first = consumer_for(&log, FlakyStore::new(0), settings(3));
    assert_eq!(
        first.step(&CancellationToken::new()).await.unwrap(),
        Some(Outcome::Undecodable)
    );
    drop(first);

    let mut restarted = consumer_for(&log, FlakyStore::new(0), settings(3));
    assert_eq!(
        restarted.step(&CancellationToken::new()).await.unwrap(),
        Some(Outcome::Undecodable)
    );
}

#[tokio::test]
async fn test_separate_retry_topic_is_drained() {
    let log = MemoryLog::new();
    let store = FlakyStore::new(1);
    let mut settings = settings(3);
    settings.retry_topic = "messages-retry".into();
    let mut consumer = consumer_for(&log, store.clone(), settings);
    let message = ready_message("via retry topic");
    publish_message(&log, &message).await;
    let cancel = CancellationToken::new();

    assert_eq!(
        consumer.step(&cancel).await.unwrap(),
        Some(Outcome::Retried { retry_count: 1 })
    );
    assert_eq!(log.len("messages"), 1);
    assert_eq!(log.records("messages-retry")[0].retry_count(), 1);

    assert_eq!(consumer.step(&cancel).await.unwrap(), Some(Outcome::Stored));
    assert_eq!(store.stored(), vec![message]);
    assert_eq!(log.committed_offset(GROUP, "messages-retry"), Some(1));
}

#[tokio::test]
async fn test_failed_republish_holds_record_until_stopped() {
    let log = MemoryLog::new();
    let settings = settings(3);
    let source = log.consumer(GROUP, &settings.subscribed_topics());
    let store = FlakyStore::always_failing();
    let mut consumer = PersistenceConsumer::new(
        Box::new(source),
        store.clone(),
        Arc::new(FailingProducer),
        settings,
    );
    publish_message(&log, &ready_message("stuck")).await;
    publish_message(&log, &ready_message("behind")).await;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(2), consumer.step(&cancel))
        .await
        .expect("held record should release on cancel")
        .unwrap();

    assert_eq!(outcome, Some(Outcome::PublishFailed));
    assert!(store.attempts() > 1);
    assert_eq!(log.committed_offset(GROUP, "messages"), None);
    assert_eq!(log.commit_count(GROUP), 0);
}

#[tokio::test]
async fn test_failed_republish_is_never_skipped() {
    let log = MemoryLog::new();
    let store = FlakyStore::new(1);
    let producer = FlakyProducer::new(log.clone(), 1);
    let settings = settings(3);
    let source = log.consumer(GROUP, &settings.subscribed_topics());
    let mut consumer =
        PersistenceConsumer::new(Box::new(source), store.clone(), producer.clone(), settings);
    let first = ready_message("first");
    let second = ready_message("second");
    publish_message(&log, &first).await;
    publish_message(&log, &second).await;
    let cancel = CancellationToken::new();

    // Store fails and the retry publish fails: the record is held and handled
    // again instead of being passed over.
    let outcome = consumer.step(&cancel).await.unwrap();
    assert_eq!(outcome, Some(Outcome::Stored));
    assert_eq!(producer.attempts(), 1);
    assert_eq!(log.committed_offset(GROUP, "messages"), Some(1));

    assert_eq!(consumer.step(&cancel).await.unwrap(), Some(Outcome::Stored));
    assert_eq!(store.stored(), vec![first, second]);
    assert_eq!(log.committed_offset(GROUP, "messages"), Some(2));
}

#[tokio::test]
async fn test_held_record_is_redelivered_after_restart() {
    let log = MemoryLog::new();
    let message = ready_message("survives");
    publish_message(&log, &message).await;

    let held = settings(3);
    let source = log.consumer(GROUP, &held.subscribed_topics());
    let mut first = PersistenceConsumer::new(
        Box::new(source),
        FlakyStore::always_failing(),
        Arc::new(FailingProducer),
        held,
    );
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.cancel();
    });
    assert_eq!(
        first.step(&cancel).await.unwrap(),
        Some(Outcome::PublishFailed)
    );
    drop(first);

    let store = FlakyStore::new(0);
    let mut restarted = consumer_for(&log, store.clone(), settings(3));
    assert_eq!(
        restarted.step(&CancellationToken::new()).await.unwrap(),
        Some(Outcome::Stored)
    );
    assert_eq!(store.stored(), vec![message]);
}

#[tokio::test]
async fn test_invalid_message_is_dead_lettered_immediately() {
    let log = MemoryLog::new();
    let store = LibSqlMessageStore::open(None).await.unwrap();
    store.initialize().await.unwrap();
    let mut consumer = consumer_for(&log, Arc::new(store.clone()), settings(3));

    // Never admitted by a router: no id, no timestamp.
    let unadmitted = Message::new(UserId::random(), UserId::random(), "raw");
    publish_message(&log, &unadmitted).await;

    assert_eq!(
        consumer.step(&CancellationToken::new()).await.unwrap(),
        Some(Outcome::DeadLettered { retry_count: 0 })
    );
    assert_eq!(log.len("dead-messages"), 1);
    assert_eq!(log.len("messages"), 1);
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stores_into_libsql() {
    let log = MemoryLog::new();
    let store = LibSqlMessageStore::open(None).await.unwrap();
    let mut consumer = consumer_for(&log, Arc::new(store.clone()), settings(3));
    let message = ready_message("persisted");
    publish_message(&log, &message).await;

    assert_eq!(
        consumer.step(&CancellationToken::new()).await.unwrap(),
        Some(Outcome::Stored)
    );
    assert_eq!(store.get(message.id).await.unwrap(), Some(message));
}

#[tokio::test]
async fn test_step_returns_none_when_cancelled() {
    let log = MemoryLog::new();
    let mut consumer = consumer_for(&log, FlakyStore::new(0), settings(3));
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert_eq!(consumer.step(&cancel).await.unwrap(), None);
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let log = MemoryLog::new();
    let store = FlakyStore::new(0);
    let consumer = consumer_for(&log, store.clone(), settings(3));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    publish_message(&log, &ready_message("one")).await;
    publish_message(&log, &ready_message("two")).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while store.stored().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both messages should be stored");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("consumer should stop")
        .unwrap();
    assert_eq!(log.committed_offset(GROUP, "messages"), Some(2));
}
