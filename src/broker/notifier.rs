use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::broker::message::{Message, MessageStatus};

pub type SubscriberId = String;

/// Server-side notification frame pushed to live subscribers.
///
/// The transport layer owns the wire framing; the broker only emits these
/// typed frames into each subscriber's channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Notification {
    #[serde(rename = "NEW_MESSAGE", rename_all = "camelCase")]
    NewMessage {
        topic: String,
        message_id: String,
        status: MessageStatus,
        offset: u64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "CONSUMER_GROUP_STATUS", rename_all = "camelCase")]
    ConsumerGroupStatus {
        target: String,
        status: String,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "pong", rename_all = "camelCase")]
    Pong { timestamp: DateTime<Utc> },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        error_type: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    pub fn new_message(message: &Message) -> Self {
        Self::NewMessage {
            topic: message.topic.clone(),
            message_id: message.id.clone(),
            status: message.status,
            offset: message.offset,
            timestamp: message.created_at,
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn error(error_type: &str, message: impl Into<String>) -> Self {
        Self::Error {
            error_type: error_type.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    topics: HashMap<String, HashSet<SubscriberId>>,
    groups: HashMap<String, HashSet<SubscriberId>>,
    subscribers: HashMap<SubscriberId, UnboundedSender<Notification>>,
}

impl Registry {
    fn evict(&mut self, id: &SubscriberId) {
        self.subscribers.remove(id);
        for set in self.topics.values_mut() {
            set.remove(id);
        }
        for set in self.groups.values_mut() {
            set.remove(id);
        }
    }
}

/// In-memory registry of live notification subscribers.
///
/// Maintains a subscriber set per topic and per consumer group plus the
/// channel for every registered subscriber. Broadcasts are best-effort and
/// self-healing: a subscriber whose channel is gone is evicted from every
/// set as a side effect of the failed send, so no separate reaper runs.
#[derive(Debug, Default)]
pub struct Notifier {
    registry: Mutex<Registry>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber's channel. Subscriptions are added separately.
    pub fn register(&self, id: SubscriberId, sender: UnboundedSender<Notification>) {
        let mut registry = self.registry.lock().unwrap();
        registry.subscribers.insert(id, sender);
    }

    pub fn subscribe_topic(&self, topic: &str, id: SubscriberId) {
        let mut registry = self.registry.lock().unwrap();
        registry.topics.entry(topic.to_string()).or_default().insert(id);
    }

    pub fn subscribe_group(&self, group: &str, id: SubscriberId) {
        let mut registry = self.registry.lock().unwrap();
        registry.groups.entry(group.to_string()).or_default().insert(id);
    }

    /// Removes the subscriber from every topic and group set, keeping its
    /// channel registered so it can re-subscribe.
    pub fn unsubscribe(&self, id: &SubscriberId) {
        let mut registry = self.registry.lock().unwrap();
        for set in registry.topics.values_mut() {
            set.remove(id);
        }
        for set in registry.groups.values_mut() {
            set.remove(id);
        }
    }

    /// Drops the subscriber entirely, used when its connection closes.
    pub fn remove(&self, id: &SubscriberId) {
        let mut registry = self.registry.lock().unwrap();
        registry.evict(id);
    }

    /// Announces a newly visible message to the topic's subscribers and,
    /// when the message carries a consumer-group hint, to that group's
    /// subscribers as well.
    pub fn notify_new_message(&self, message: &Message) {
        let notification = Notification::new_message(message);
        let mut registry = self.registry.lock().unwrap();
        broadcast(&mut registry, Scope::Topic(&message.topic), &notification);
        if let Some(group) = message.consumer_group.clone() {
            broadcast(&mut registry, Scope::Group(&group), &notification);
        }
    }

    /// Pushes a status event to every subscriber of a consumer group.
    pub fn notify_group_status(&self, group: &str, status: &str, data: serde_json::Value) {
        let notification = Notification::ConsumerGroupStatus {
            target: group.to_string(),
            status: status.to_string(),
            data,
            timestamp: Utc::now(),
        };
        let mut registry = self.registry.lock().unwrap();
        broadcast(&mut registry, Scope::Group(group), &notification);
    }

    /// Sends one frame directly to a single subscriber, evicting it when
    /// the send fails.
    pub fn send_to(&self, id: &SubscriberId, notification: Notification) {
        let mut registry = self.registry.lock().unwrap();
        let dead = match registry.subscribers.get(id) {
            Some(sender) => sender.send(notification).is_err(),
            None => false,
        };
        if dead {
            tracing::warn!("failed to send notification to {id}, evicting");
            registry.evict(id);
        }
    }

    pub fn is_topic_subscriber(&self, topic: &str, id: &SubscriberId) -> bool {
        let registry = self.registry.lock().unwrap();
        registry.topics.get(topic).is_some_and(|set| set.contains(id))
    }

    pub fn is_group_subscriber(&self, group: &str, id: &SubscriberId) -> bool {
        let registry = self.registry.lock().unwrap();
        registry.groups.get(group).is_some_and(|set| set.contains(id))
    }

    pub fn is_registered(&self, id: &SubscriberId) -> bool {
        let registry = self.registry.lock().unwrap();
        registry.subscribers.contains_key(id)
    }
}

enum Scope<'a> {
    Topic(&'a str),
    Group(&'a str),
}

fn broadcast(registry: &mut Registry, scope: Scope<'_>, notification: &Notification) {
    let targets: Vec<SubscriberId> = match scope {
        Scope::Topic(topic) => registry.topics.get(topic),
        Scope::Group(group) => registry.groups.get(group),
    }
    .map(|set| set.iter().cloned().collect())
    .unwrap_or_default();

    let mut dead = Vec::new();
    for id in targets {
        match registry.subscribers.get(&id) {
            Some(sender) => {
                if sender.send(notification.clone()).is_err() {
                    dead.push(id);
                }
            }
            None => dead.push(id),
        }
    }
    for id in dead {
        tracing::warn!("failed to send notification to {id}, evicting");
        registry.evict(&id);
    }
}
