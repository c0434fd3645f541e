use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tempfile::TempDir;

use super::Broker;
use crate::broker::handler::{Handler, HandlerRegistry, LogHandler};
use crate::broker::message::{ConsumeRequest, Message, MessageStatus, ProduceRequest};
use crate::broker::notifier::{Notification, Notifier};
use crate::broker::scheduler::Scheduler;
use crate::config::SchedulerSettings;
use crate::persistence::{CursorStore, MessageStore};
use crate::utils::error::BrokerError;

struct FailingHandler;

#[async_trait]
impl Handler for FailingHandler {
    fn name(&self) -> &str {
        "failing"
    }

    fn can_handle(&self, _message: &Message) -> bool {
        true
    }

    async fn process(&self, _message: &Message) -> crate::utils::error::Result<()> {
        Err(BrokerError::Processing("handler always fails".to_string()))
    }
}

struct Rig {
    _dir: TempDir,
    broker: Broker,
    log: Arc<MessageStore>,
    notifier: Arc<Notifier>,
}

fn rig_with(handlers: HandlerRegistry) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let log = Arc::new(MessageStore::new(db.clone()).unwrap());
    let cursors = Arc::new(CursorStore::new(db).unwrap());
    let notifier = Arc::new(Notifier::new());
    let broker = Broker::new(log.clone(), cursors, notifier.clone(), Arc::new(handlers));
    Rig {
        _dir: dir,
        broker,
        log,
        notifier,
    }
}

fn rig() -> Rig {
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(LogHandler));
    rig_with(handlers)
}

fn failing_rig() -> Rig {
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(FailingHandler));
    rig_with(handlers)
}

fn produce_request(topic: &str, content: &str) -> ProduceRequest {
    ProduceRequest {
        topic: topic.to_string(),
        content: content.to_string(),
        max_retries: 3,
        ..ProduceRequest::default()
    }
}

fn consume_request(topic: &str) -> ConsumeRequest {
    ConsumeRequest {
        topic: topic.to_string(),
        ..ConsumeRequest::default()
    }
}

async fn wait_for_status(log: &MessageStore, id: &str, status: MessageStatus) -> Message {
    for _ in 0..200 {
        if let Some(message) = log.get(id).unwrap() {
            if message.status == status {
                return message;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("message {id} never reached {status:?}");
}

#[tokio::test]
async fn produce_assigns_offset_one_and_pending() {
    let rig = rig();
    let stored = rig
        .broker
        .produce(produce_request("t", "hello"))
        .await
        .unwrap();
    assert_eq!(stored.offset, 1);
    assert_eq!(stored.status, MessageStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.scheduled_at.is_none());
}

#[tokio::test]
async fn produce_rejects_blank_topic_and_content() {
    let rig = rig();
    let no_topic = rig.broker.produce(produce_request("", "x")).await;
    assert!(matches!(no_topic, Err(BrokerError::Validation(_))));

    let no_content = rig.broker.produce(produce_request("t", " ")).await;
    assert!(matches!(no_content, Err(BrokerError::Validation(_))));
}

#[tokio::test]
async fn produce_with_delay_is_scheduled() {
    let rig = rig();
    let mut request = produce_request("t", "later");
    request.delay_sec = Some(3600);

    let stored = rig.broker.produce(request).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Scheduled);
    let at = stored.scheduled_at.expect("scheduled_at should be set");
    assert!(at > Utc::now() + TimeDelta::seconds(3500));
}

#[tokio::test]
async fn produce_with_absolute_schedule_parses_iso8601() {
    let rig = rig();
    let mut request = produce_request("t", "later");
    request.scheduled_at = Some("2099-01-01T00:00:00Z".to_string());

    let stored = rig.broker.produce(request).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Scheduled);

    let mut bad = produce_request("t", "later");
    bad.scheduled_at = Some("not-a-timestamp".to_string());
    assert!(matches!(
        rig.broker.produce(bad).await,
        Err(BrokerError::Validation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_produce_yields_gap_free_offsets() {
    let rig = rig();
    let mut tasks = Vec::new();
    for i in 0..50 {
        let broker = rig.broker.clone();
        tasks.push(tokio::spawn(async move {
            broker
                .produce(produce_request("t", &format!("m-{i}")))
                .await
                .unwrap()
                .offset
        }));
    }

    let mut offsets = Vec::new();
    for task in tasks {
        offsets.push(task.await.unwrap());
    }
    offsets.sort();
    assert_eq!(offsets, (1..=50).collect::<Vec<u64>>());
}

#[tokio::test]
async fn consume_delivers_and_commits_on_success() {
    let rig = rig();
    let stored = rig
        .broker
        .produce(produce_request("t", "hello"))
        .await
        .unwrap();

    let mut request = consume_request("t");
    request.max_messages = 1;
    let delivered = rig.broker.consume(request).await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].offset, 1);

    wait_for_status(&rig.log, &stored.id, MessageStatus::Completed).await;
    for _ in 0..200 {
        if rig.broker.committed_offset("default", "t").await.unwrap() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("offset 1 was never committed");
}

#[tokio::test]
async fn consume_skips_already_committed_offsets() {
    let rig = rig();
    for i in 0..3 {
        rig.broker
            .produce(produce_request("t", &format!("m-{i}")))
            .await
            .unwrap();
    }
    rig.broker.commit_offset("default", "t", 2).await.unwrap();

    let delivered = rig.broker.consume(consume_request("t")).await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].offset, 3);
}

#[tokio::test]
async fn consume_honors_from_offset_override() {
    let rig = rig();
    for i in 0..3 {
        rig.broker
            .produce(produce_request("t", &format!("m-{i}")))
            .await
            .unwrap();
    }
    rig.broker.commit_offset("default", "t", 3).await.unwrap();

    let mut request = consume_request("t");
    request.from_offset = Some(1);
    let delivered = rig.broker.consume(request).await.unwrap();
    assert_eq!(
        delivered.iter().map(|m| m.offset).collect::<Vec<_>>(),
        vec![2, 3]
    );
}

#[tokio::test]
async fn consume_with_elapsed_timeout_dispatches_nothing() {
    let rig = rig();
    rig.broker
        .produce(produce_request("t", "hello"))
        .await
        .unwrap();

    let mut request = consume_request("t");
    request.timeout_ms = 0;
    let delivered = rig.broker.consume(request).await.unwrap();
    assert!(delivered.is_empty());
}

#[tokio::test]
async fn scheduled_message_invisible_until_promotion() {
    let rig = rig();
    let mut request = produce_request("t", "later");
    // Already due, but still requires a promotion cycle to become pending
    request.scheduled_at = Some((Utc::now() - TimeDelta::seconds(5)).to_rfc3339());
    let stored = rig.broker.produce(request).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Scheduled);

    assert!(rig.broker.consume(consume_request("t")).await.unwrap().is_empty());

    let scheduler = Scheduler::new(
        rig.log.clone(),
        rig.notifier.clone(),
        &SchedulerSettings {
            promote_interval_secs: 10,
            retention_interval_secs: 3600,
            retention_hours: 24,
        },
    );
    assert_eq!(scheduler.promote_once().unwrap(), 1);
    assert_eq!(
        rig.log.get(&stored.id).unwrap().unwrap().status,
        MessageStatus::Pending
    );

    let delivered = rig.broker.consume(consume_request("t")).await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, stored.id);
    wait_for_status(&rig.log, &stored.id, MessageStatus::Completed).await;
}

#[tokio::test]
async fn promotion_skips_future_schedules() {
    let rig = rig();
    let mut request = produce_request("t", "later");
    request.delay_sec = Some(3600);
    let stored = rig.broker.produce(request).await.unwrap();

    let scheduler = Scheduler::new(
        rig.log.clone(),
        rig.notifier.clone(),
        &SchedulerSettings {
            promote_interval_secs: 10,
            retention_interval_secs: 3600,
            retention_hours: 24,
        },
    );
    assert_eq!(scheduler.promote_once().unwrap(), 0);
    assert_eq!(
        rig.log.get(&stored.id).unwrap().unwrap().status,
        MessageStatus::Scheduled
    );
}

#[tokio::test]
async fn failed_delivery_requeues_with_backoff_then_dead_letters() {
    let rig = failing_rig();
    let mut request = produce_request("t", "doomed");
    request.max_retries = 1;
    let stored = rig.broker.produce(request).await.unwrap();

    // First attempt: retried back to pending with one retry recorded
    rig.broker.consume(consume_request("t")).await.unwrap();
    let mut retried = rig.log.get(&stored.id).unwrap().unwrap();
    for _ in 0..200 {
        retried = rig.log.get(&stored.id).unwrap().unwrap();
        if retried.status == MessageStatus::Pending && retried.retry_count == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(retried.status, MessageStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    let backoff = retried.scheduled_at.expect("backoff timestamp should be set");
    assert!(backoff > Utc::now() + TimeDelta::seconds(30));
    assert!(backoff <= Utc::now() + TimeDelta::seconds(60));

    // Second attempt: retry budget exhausted, dead-lettered
    rig.broker.consume(consume_request("t")).await.unwrap();
    let dead = wait_for_status(&rig.log, &stored.id, MessageStatus::DeadLetter).await;
    assert!(dead.error_message.is_some());
    assert_eq!(dead.retry_count, 1);
    assert!(dead.processed_at.is_some());

    // Dead-lettered messages are no longer consumable
    assert!(rig.broker.consume(consume_request("t")).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_delivery_never_commits_the_cursor() {
    let rig = failing_rig();
    rig.broker
        .produce(produce_request("t", "doomed"))
        .await
        .unwrap();

    rig.broker.consume(consume_request("t")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.broker.committed_offset("default", "t").await.unwrap(), 0);
}

#[tokio::test]
async fn commit_offset_round_trips() {
    let rig = rig();
    rig.broker.commit_offset("g", "t", 7).await.unwrap();
    assert_eq!(rig.broker.committed_offset("g", "t").await.unwrap(), 7);

    // Permissive overwrite, even backwards
    rig.broker.commit_offset("g", "t", 3).await.unwrap();
    assert_eq!(rig.broker.committed_offset("g", "t").await.unwrap(), 3);
}

#[tokio::test]
async fn retention_sweep_is_idempotent() {
    let rig = rig();
    let stored = rig
        .broker
        .produce(produce_request("t", "done"))
        .await
        .unwrap();
    rig.log
        .update_status(&stored.id, MessageStatus::Completed, None)
        .unwrap();

    // Zero-hour window makes everything terminal immediately purgeable
    let scheduler = Scheduler::new(
        rig.log.clone(),
        rig.notifier.clone(),
        &SchedulerSettings {
            promote_interval_secs: 10,
            retention_interval_secs: 3600,
            retention_hours: 0,
        },
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.sweep_once().unwrap(), 1);
    assert_eq!(scheduler.sweep_once().unwrap(), 0);
    assert!(rig.log.get(&stored.id).unwrap().is_none());
}

#[tokio::test]
async fn active_workers_drains_to_zero() {
    let rig = rig();
    rig.broker
        .produce(produce_request("t", "hello"))
        .await
        .unwrap();
    rig.broker.consume(consume_request("t")).await.unwrap();

    for _ in 0..200 {
        if rig.broker.active_workers() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("delivery workers never drained");
}

#[tokio::test]
async fn produce_notifies_topic_subscribers() {
    let rig = rig();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    rig.notifier.register("sub-1".to_string(), tx);
    rig.notifier.subscribe_topic("t", "sub-1".to_string());

    let stored = rig
        .broker
        .produce(produce_request("t", "hello"))
        .await
        .unwrap();

    match rx.try_recv().unwrap() {
        Notification::NewMessage {
            topic,
            message_id,
            offset,
            status,
            ..
        } => {
            assert_eq!(topic, "t");
            assert_eq!(message_id, stored.id);
            assert_eq!(offset, 1);
            assert_eq!(status, MessageStatus::Pending);
        }
        other => panic!("expected NEW_MESSAGE, got {other:?}"),
    }
}

#[tokio::test]
async fn scheduled_produce_does_not_notify_until_promoted() {
    let rig = rig();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    rig.notifier.register("sub-1".to_string(), tx);
    rig.notifier.subscribe_topic("t", "sub-1".to_string());

    let mut request = produce_request("t", "later");
    request.scheduled_at = Some((Utc::now() - TimeDelta::seconds(1)).to_rfc3339());
    rig.broker.produce(request).await.unwrap();
    assert!(rx.try_recv().is_err());

    let scheduler = Scheduler::new(
        rig.log.clone(),
        rig.notifier.clone(),
        &SchedulerSettings {
            promote_interval_secs: 10,
            retention_interval_secs: 3600,
            retention_hours: 24,
        },
    );
    scheduler.promote_once().unwrap();
    assert!(matches!(
        rx.try_recv().unwrap(),
        Notification::NewMessage { .. }
    ));
}

#[tokio::test]
async fn group_hint_reaches_group_subscribers() {
    let rig = rig();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    rig.notifier.register("sub-1".to_string(), tx);
    rig.notifier.subscribe_group("mailers", "sub-1".to_string());

    let mut request = produce_request("t", "hello");
    request.consumer_group = Some("mailers".to_string());
    rig.broker.produce(request).await.unwrap();

    assert!(matches!(
        rx.try_recv().unwrap(),
        Notification::NewMessage { .. }
    ));
}

#[tokio::test]
async fn broadcast_evicts_dead_subscribers() {
    let rig = rig();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    rig.notifier.register("sub-1".to_string(), tx);
    rig.notifier.subscribe_topic("t", "sub-1".to_string());
    drop(rx);

    rig.broker
        .produce(produce_request("t", "hello"))
        .await
        .unwrap();

    assert!(!rig.notifier.is_topic_subscriber("t", &"sub-1".to_string()));
    assert!(!rig.notifier.is_registered(&"sub-1".to_string()));
}

#[tokio::test]
async fn group_status_reaches_group_subscribers_only() {
    let rig = rig();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    rig.notifier.register("sub-1".to_string(), tx);
    rig.notifier.subscribe_group("g", "sub-1".to_string());

    rig.notifier
        .notify_group_status("g", "rebalancing", serde_json::json!({"members": 2}));
    match rx.try_recv().unwrap() {
        Notification::ConsumerGroupStatus { target, status, .. } => {
            assert_eq!(target, "g");
            assert_eq!(status, "rebalancing");
        }
        other => panic!("expected CONSUMER_GROUP_STATUS, got {other:?}"),
    }

    rig.notifier
        .notify_group_status("other", "idle", serde_json::Value::Null);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unmatched_messages_complete_trivially() {
    // Registry with no handlers at all
    let rig = rig_with(HandlerRegistry::new());
    let stored = rig
        .broker
        .produce(produce_request("t", "hello"))
        .await
        .unwrap();
    rig.broker.consume(consume_request("t")).await.unwrap();
    wait_for_status(&rig.log, &stored.id, MessageStatus::Completed).await;
}
