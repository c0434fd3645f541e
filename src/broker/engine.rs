use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::broker::handler::HandlerRegistry;
use crate::broker::message::{ConsumeRequest, Message, MessageStatus, ProduceRequest};
use crate::broker::notifier::Notifier;
use crate::persistence::{CursorStore, MessageStore};
use crate::utils::error::{BrokerError, Result};

/// Hard cap on a single consume batch.
const MAX_BATCH: usize = 100;

/// Backoff added per retry attempt.
const RETRY_BACKOFF_SECS: i64 = 60;

/// The broker engine: produce, consume, commit.
///
/// Producing appends to the topic log (the store serializes offset
/// assignment per topic) and announces immediately visible messages through
/// the notifier. Consuming resolves the group's cursor, pulls a bounded
/// batch of pending messages in offset order and hands each one to its own
/// tokio task, which walks the message through the
/// PROCESSING -> COMPLETED / retry / DEAD_LETTER transitions and commits
/// the cursor on success.
///
/// Delivery tasks are fire-and-forget: callers observe their outcome only
/// through the message and cursor state, and completion order across a
/// batch is not guaranteed. A later offset may commit before an earlier
/// message finishes retrying, so the committed cursor may regress; that
/// permissive semantics is intentional.
#[derive(Debug, Clone)]
pub struct Broker {
    log: Arc<MessageStore>,
    cursors: Arc<CursorStore>,
    notifier: Arc<Notifier>,
    handlers: Arc<HandlerRegistry>,
    active_workers: Arc<AtomicUsize>,
}

impl Broker {
    pub fn new(
        log: Arc<MessageStore>,
        cursors: Arc<CursorStore>,
        notifier: Arc<Notifier>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            log,
            cursors,
            notifier,
            handlers,
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    /// Number of delivery tasks currently in flight.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Appends a message to its topic.
    ///
    /// The stored message carries the assigned offset; when it is
    /// immediately `Pending` the notifier announces it right away,
    /// `Scheduled` messages are announced by the scheduler at promotion.
    pub async fn produce(&self, request: ProduceRequest) -> Result<Message> {
        if request.topic.trim().is_empty() {
            return Err(BrokerError::Validation("topic is required".to_string()));
        }
        if request.content.trim().is_empty() {
            return Err(BrokerError::Validation("content is required".to_string()));
        }
        let scheduled_at = resolve_schedule(&request)?;
        let status = if scheduled_at.is_some() {
            MessageStatus::Scheduled
        } else {
            MessageStatus::Pending
        };

        let message = Message {
            id: Uuid::new_v4().to_string(),
            topic: request.topic,
            content: request.content,
            headers: request.headers,
            offset: 0,
            created_at: Utc::now(),
            scheduled_at,
            processed_at: None,
            status,
            retry_count: 0,
            max_retries: request.max_retries,
            error_message: None,
            consumer_group: request.consumer_group,
        };

        let stored = self.log.append(message)?;
        tracing::debug!(
            "produced message {} to topic {} at offset {}",
            stored.id,
            stored.topic,
            stored.offset
        );
        if stored.status == MessageStatus::Pending {
            self.notifier.notify_new_message(&stored);
        }
        Ok(stored)
    }

    /// Pulls one batch of pending messages for a consumer group.
    ///
    /// The returned messages are the dispatched batch in ascending offset
    /// order; their processing runs detached. Once the batch or the
    /// timeout budget is exhausted the cursor's active flag is cleared,
    /// regardless of tasks still in flight.
    pub async fn consume(&self, request: ConsumeRequest) -> Result<Vec<Message>> {
        if request.topic.trim().is_empty() {
            return Err(BrokerError::Validation("topic is required".to_string()));
        }
        let consumer_id = Uuid::new_v4().to_string();
        let group = request.consumer_group.clone();
        self.cursors
            .set_active(&group, &request.topic, &consumer_id, true)?;

        let result = self.dispatch_batch(&request, &group);

        self.cursors
            .set_active(&group, &request.topic, &consumer_id, false)?;
        result
    }

    fn dispatch_batch(&self, request: &ConsumeRequest, group: &str) -> Result<Vec<Message>> {
        let start = match request.from_offset {
            Some(offset) => offset,
            None => self.cursors.committed(group, &request.topic)?,
        };
        let limit = request.max_messages.min(MAX_BATCH);
        let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);

        let batch = self.log.fetch_pending(&request.topic, start, limit)?;
        let fetched = batch.len();
        let mut delivered = Vec::with_capacity(fetched);
        for message in batch {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "consume timeout for group {group} on topic {}, {} messages not dispatched",
                    request.topic,
                    fetched - delivered.len()
                );
                break;
            }
            delivered.push(message.clone());
            self.spawn_delivery(message, group.to_string(), request.auto_commit);
        }
        Ok(delivered)
    }

    /// Hands one message to its own task. Failures inside the task are
    /// contained: they end in a requeued or dead-lettered message, never in
    /// a caller-visible error.
    fn spawn_delivery(&self, message: Message, group: String, auto_commit: bool) {
        let engine = self.clone();
        engine.active_workers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = engine.deliver(&message, &group, auto_commit).await {
                tracing::error!("delivery bookkeeping for message {} failed: {e}", message.id);
            }
            engine.active_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn deliver(&self, message: &Message, group: &str, auto_commit: bool) -> Result<()> {
        self.log
            .update_status(&message.id, MessageStatus::Processing, None)?;
        match self.handlers.process(message).await {
            Ok(()) => {
                self.log
                    .update_status(&message.id, MessageStatus::Completed, None)?;
                if auto_commit {
                    self.cursors.commit(group, &message.topic, message.offset)?;
                }
                tracing::debug!(
                    "processed message {} from topic {}",
                    message.id,
                    message.topic
                );
            }
            Err(e) => self.apply_failure(message, &e.to_string())?,
        }
        Ok(())
    }

    /// Retry/dead-letter transition for a failed delivery attempt.
    fn apply_failure(&self, message: &Message, error: &str) -> Result<()> {
        let attempt = message.retry_count + 1;
        if attempt <= message.max_retries {
            let backoff = Utc::now() + TimeDelta::seconds(attempt as i64 * RETRY_BACKOFF_SECS);
            self.log.requeue_retry(&message.id, attempt, backoff)?;
            tracing::warn!(
                "retrying message {} (attempt {}/{})",
                message.id,
                attempt,
                message.max_retries
            );
        } else {
            self.log
                .update_status(&message.id, MessageStatus::DeadLetter, Some(error.to_string()))?;
            tracing::error!(
                "message {} moved to dead letter queue after {} retries: {error}",
                message.id,
                message.max_retries
            );
        }
        Ok(())
    }

    pub async fn commit_offset(&self, group: &str, topic: &str, offset: u64) -> Result<()> {
        self.cursors.commit(group, topic, offset)?;
        tracing::debug!("committed offset {offset} for group {group} topic {topic}");
        Ok(())
    }

    pub async fn committed_offset(&self, group: &str, topic: &str) -> Result<u64> {
        self.cursors.committed(group, topic)
    }
}

fn resolve_schedule(request: &ProduceRequest) -> Result<Option<DateTime<Utc>>> {
    if let Some(delay) = request.delay_sec {
        return Ok(Some(Utc::now() + TimeDelta::seconds(delay as i64)));
    }
    match &request.scheduled_at {
        Some(raw) => {
            let at = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| BrokerError::Validation(format!("invalid scheduledAt: {e}")))?;
            Ok(Some(at.with_timezone(&Utc)))
        }
        None => Ok(None),
    }
}
