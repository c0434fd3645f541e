use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use crate::broker::message::MessageStatus;
use crate::broker::notifier::Notifier;
use crate::config::SchedulerSettings;
use crate::persistence::MessageStore;
use crate::utils::error::Result;

/// Background maintenance: promotion of due scheduled messages and
/// retention cleanup of old completed/dead-lettered ones.
///
/// Both duties run as independent interval loops; a failed cycle is logged
/// and never stops the following cycles, and during retention one topic's
/// failure never blocks the other topics. The single-cycle entry points are
/// public so tests can drive them directly.
pub struct Scheduler {
    log: Arc<MessageStore>,
    notifier: Arc<Notifier>,
    promote_interval: Duration,
    retention_interval: Duration,
    retention_window: TimeDelta,
}

impl Scheduler {
    pub fn new(log: Arc<MessageStore>, notifier: Arc<Notifier>, settings: &SchedulerSettings) -> Self {
        Self {
            log,
            notifier,
            promote_interval: Duration::from_secs(settings.promote_interval_secs),
            retention_interval: Duration::from_secs(settings.retention_interval_secs),
            retention_window: TimeDelta::hours(settings.retention_hours as i64),
        }
    }

    /// Starts the two background loops on the current runtime.
    pub fn spawn(self: &Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.promote_interval);
            tick.tick().await; // the first tick fires immediately
            loop {
                tick.tick().await;
                match scheduler.promote_once() {
                    Ok(promoted) if promoted > 0 => {
                        tracing::debug!("promoted {promoted} scheduled messages");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("error processing scheduled messages: {e}"),
                }
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.retention_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                match scheduler.sweep_once() {
                    Ok(removed) if removed > 0 => {
                        tracing::info!("retention removed {removed} old messages");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("error cleaning up old messages: {e}"),
                }
            }
        });
    }

    /// One promotion cycle: flip every due `Scheduled` message to `Pending`
    /// and announce it exactly like a fresh produce. Returns how many
    /// messages were promoted; an individual message's failure is logged
    /// and skipped.
    pub fn promote_once(&self) -> Result<usize> {
        let due = self.log.fetch_due(Utc::now())?;
        let mut promoted = 0;
        for mut message in due {
            if let Err(e) = self
                .log
                .update_status(&message.id, MessageStatus::Pending, None)
            {
                tracing::error!("failed to promote scheduled message {}: {e}", message.id);
                continue;
            }
            message.status = MessageStatus::Pending;
            tracing::debug!("scheduled message {} is now available", message.id);
            self.notifier.notify_new_message(&message);
            promoted += 1;
        }
        Ok(promoted)
    }

    /// One retention cycle: purge completed and dead-lettered messages
    /// older than the retention window, per topic, best-effort.
    pub fn sweep_once(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.retention_window;
        let mut removed = 0;
        for topic in self.log.topics() {
            match self.log.purge(&topic, cutoff) {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!("deleted {count} old messages from topic {topic}");
                    }
                    removed += count;
                }
                Err(e) => tracing::error!("retention failed for topic {topic}: {e}"),
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("promote_interval", &self.promote_interval)
            .field("retention_interval", &self.retention_interval)
            .finish()
    }
}
