use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a message inside the broker.
///
/// `Completed` is terminal. `Failed` is part of the wire status set for
/// clients; the delivery engine itself moves failed deliveries back to
/// `Pending` (retry) or on to `DeadLetter` (retry budget exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

/// One unit of work in a topic log.
///
/// A message is appended with a per-topic, gap-free `offset` assigned
/// exactly once by the store and never reused. `content` and `headers` are
/// opaque to the broker; `scheduled_at` delays visibility, and
/// `retry_count`/`max_retries` drive the retry and dead-letter transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub content: String,
    pub headers: Option<HashMap<String, serde_json::Value>>,
    pub offset: u64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub consumer_group: Option<String>,
}

/// Request to append a message to a topic.
///
/// `delay_sec` and `scheduled_at` (an ISO-8601 timestamp) both mark the
/// message `Scheduled` instead of immediately `Pending`; `delay_sec` wins
/// when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub topic: String,
    pub content: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub delay_sec: Option<u64>,
    #[serde(default)]
    pub scheduled_at: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub consumer_group: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ProduceRequest {
    fn default() -> Self {
        Self {
            topic: String::new(),
            content: String::new(),
            headers: None,
            delay_sec: None,
            scheduled_at: None,
            max_retries: default_max_retries(),
            consumer_group: None,
        }
    }
}

/// Request to pull a batch of messages for a consumer group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub topic: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
    #[serde(default)]
    pub from_offset: Option<u64>,
}

fn default_consumer_group() -> String {
    "default".to_string()
}

fn default_max_messages() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_auto_commit() -> bool {
    true
}

impl Default for ConsumeRequest {
    fn default() -> Self {
        Self {
            topic: String::new(),
            consumer_group: default_consumer_group(),
            max_messages: default_max_messages(),
            timeout_ms: default_timeout_ms(),
            auto_commit: default_auto_commit(),
            from_offset: None,
        }
    }
}
