use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::broker::message::{Message, MessageStatus};
use crate::utils::error::{BrokerError, Result};

const LOG_PREFIX: &str = "log/";
const INDEX_TREE: &str = "message_index";
const CURSOR_TREE: &str = "consumer_cursors";

/// Durable, append-only per-topic message log.
///
/// Each topic is a sled tree (`log/<topic>`) keyed by big-endian offset, so
/// iteration order is offset order. A separate index tree maps message id
/// to its `(topic, offset)` location for by-id updates.
///
/// Offset assignment is the one place that needs strict mutual exclusion:
/// each topic has its own allocator mutex holding the last assigned offset,
/// and the read-compute-persist step for an append runs entirely under it.
/// Appends to different topics never contend with each other.
pub struct MessageStore {
    db: Db,
    index: Tree,
    offsets: Mutex<HashMap<String, Arc<Mutex<u64>>>>,
}

impl MessageStore {
    pub fn new(db: Db) -> Result<Self> {
        let index = db.open_tree(INDEX_TREE)?;
        Ok(Self {
            db,
            index,
            offsets: Mutex::new(HashMap::new()),
        })
    }

    fn topic_tree(&self, topic: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("{LOG_PREFIX}{topic}"))?)
    }

    /// Returns the allocator for `topic`, seeding it from the stored
    /// maximum offset on first use.
    fn allocator(&self, topic: &str) -> Result<Arc<Mutex<u64>>> {
        let mut allocators = self.offsets.lock().unwrap();
        if let Some(alloc) = allocators.get(topic) {
            return Ok(alloc.clone());
        }
        let tree = self.topic_tree(topic)?;
        let max = match tree.last()? {
            Some((key, _)) => decode_offset(&key),
            None => 0,
        };
        let alloc = Arc::new(Mutex::new(max));
        allocators.insert(topic.to_string(), alloc.clone());
        Ok(alloc)
    }

    /// Appends `message` to its topic, assigning the next offset.
    ///
    /// The offset read, the increment and the write happen under the
    /// topic's allocator lock; a failed write does not advance the counter,
    /// so no gap is introduced.
    pub fn append(&self, mut message: Message) -> Result<Message> {
        let alloc = self.allocator(&message.topic)?;
        let tree = self.topic_tree(&message.topic)?;

        let mut last = alloc.lock().unwrap();
        let offset = *last + 1;
        message.offset = offset;

        let row = serde_json::to_vec(&message)?;
        let locator = serde_json::to_vec(&(&message.topic, offset))?;
        tree.insert(offset.to_be_bytes(), row)?;
        if let Err(e) = self.index.insert(message.id.as_bytes(), locator) {
            let _ = tree.remove(offset.to_be_bytes());
            return Err(e.into());
        }
        *last = offset;
        Ok(message)
    }

    /// Pending messages for `topic` with offset strictly greater than
    /// `after`, in ascending offset order, at most `limit` of them.
    pub fn fetch_pending(&self, topic: &str, after: u64, limit: usize) -> Result<Vec<Message>> {
        let tree = self.topic_tree(topic)?;
        let start = after.saturating_add(1).to_be_bytes();
        let mut batch = Vec::new();
        for entry in tree.range(start..) {
            if batch.len() >= limit {
                break;
            }
            let (_, row) = entry?;
            let message: Message = serde_json::from_slice(&row)?;
            if message.status == MessageStatus::Pending {
                batch.push(message);
            }
        }
        Ok(batch)
    }

    /// All scheduled messages due at or before `now`, across every topic.
    pub fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let mut due = Vec::new();
        for topic in self.topics() {
            let tree = self.topic_tree(&topic)?;
            for entry in tree.iter() {
                let (_, row) = entry?;
                let message: Message = serde_json::from_slice(&row)?;
                if message.status == MessageStatus::Scheduled
                    && message.scheduled_at.is_some_and(|at| at <= now)
                {
                    due.push(message);
                }
            }
        }
        Ok(due)
    }

    /// Messages of `topic` with `from <= offset <= to`, in offset order.
    pub fn fetch_range(&self, topic: &str, from: u64, to: u64) -> Result<Vec<Message>> {
        let tree = self.topic_tree(topic)?;
        let mut messages = Vec::new();
        for entry in tree.range(from.to_be_bytes()..=to.to_be_bytes()) {
            let (_, row) = entry?;
            messages.push(serde_json::from_slice(&row)?);
        }
        Ok(messages)
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>> {
        let Some(locator) = self.index.get(id.as_bytes())? else {
            return Ok(None);
        };
        let (topic, offset): (String, u64) = serde_json::from_slice(&locator)?;
        let tree = self.topic_tree(&topic)?;
        match tree.get(offset.to_be_bytes())? {
            Some(row) => Ok(Some(serde_json::from_slice(&row)?)),
            None => Ok(None),
        }
    }

    /// Updates the status of the message with `id`, recording
    /// `processed_at` once the message moves past `Processing` and the
    /// error text when one is given.
    pub fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.mutate(id, |message| {
            message.status = status;
            if matches!(
                status,
                MessageStatus::Completed | MessageStatus::Failed | MessageStatus::DeadLetter
            ) {
                message.processed_at = Some(Utc::now());
            }
            if error.is_some() {
                message.error_message = error;
            }
        })
    }

    /// Re-enters a failed message as `Pending` with its new retry count and
    /// backoff timestamp. The offset is untouched.
    pub fn requeue_retry(
        &self,
        id: &str,
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(id, |message| {
            message.status = MessageStatus::Pending;
            message.retry_count = retry_count;
            message.scheduled_at = Some(scheduled_at);
        })
    }

    /// Deletes completed and dead-lettered messages of `topic` created
    /// before `before`. Returns how many rows were removed; running it
    /// again with no intervening completions removes nothing.
    pub fn purge(&self, topic: &str, before: DateTime<Utc>) -> Result<usize> {
        let tree = self.topic_tree(topic)?;
        let mut expired = Vec::new();
        for entry in tree.iter() {
            let (key, row) = entry?;
            let message: Message = serde_json::from_slice(&row)?;
            if matches!(
                message.status,
                MessageStatus::Completed | MessageStatus::DeadLetter
            ) && message.created_at < before
            {
                expired.push((key, message.id));
            }
        }
        let removed = expired.len();
        for (key, id) in expired {
            tree.remove(key)?;
            self.index.remove(id.as_bytes())?;
        }
        Ok(removed)
    }

    /// Names of every topic that has ever been appended to.
    pub fn topics(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|name| {
                std::str::from_utf8(&name)
                    .ok()
                    .and_then(|name| name.strip_prefix(LOG_PREFIX))
                    .map(str::to_string)
            })
            .collect()
    }

    fn mutate(&self, id: &str, apply: impl FnOnce(&mut Message)) -> Result<()> {
        let Some(locator) = self.index.get(id.as_bytes())? else {
            return Err(BrokerError::Validation(format!("unknown message id: {id}")));
        };
        let (topic, offset): (String, u64) = serde_json::from_slice(&locator)?;
        let tree = self.topic_tree(&topic)?;
        let Some(row) = tree.get(offset.to_be_bytes())? else {
            return Err(BrokerError::Validation(format!("unknown message id: {id}")));
        };
        let mut message: Message = serde_json::from_slice(&row)?;
        apply(&mut message);
        tree.insert(offset.to_be_bytes(), serde_json::to_vec(&message)?)?;
        Ok(())
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore").field("db", &"sled::Db").finish()
    }
}

fn decode_offset(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    if key.len() == 8 {
        buf.copy_from_slice(key);
    }
    u64::from_be_bytes(buf)
}

/// Committed progress of one consumer group on one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCursor {
    pub consumer_group: String,
    pub topic: String,
    pub offset: u64,
    pub last_committed: DateTime<Utc>,
    pub consumer_id: String,
    pub active: bool,
}

/// Durable per-(consumer group, topic) cursor table.
///
/// Cursors are created lazily on first commit or first liveness update and
/// never deleted. Commits are permissive overwrites: a later commit always
/// replaces the stored offset, even with a smaller one.
///
/// Commits and liveness updates both rewrite the whole row, and delivery
/// tasks commit concurrently with the session toggling its flag, so every
/// read-modify-write runs under the store lock. An interleaved liveness
/// update can then never write back a stale offset over a fresh commit.
pub struct CursorStore {
    tree: Tree,
    lock: Mutex<()>,
}

impl CursorStore {
    pub fn new(db: Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(CURSOR_TREE)?,
            lock: Mutex::new(()),
        })
    }

    fn key(group: &str, topic: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(group.len() + topic.len() + 1);
        key.extend_from_slice(group.as_bytes());
        key.push(0);
        key.extend_from_slice(topic.as_bytes());
        key
    }

    pub fn get(&self, group: &str, topic: &str) -> Result<Option<ConsumerCursor>> {
        match self.tree.get(Self::key(group, topic))? {
            Some(row) => Ok(Some(serde_json::from_slice(&row)?)),
            None => Ok(None),
        }
    }

    fn put(&self, cursor: &ConsumerCursor) -> Result<()> {
        let key = Self::key(&cursor.consumer_group, &cursor.topic);
        self.tree.insert(key, serde_json::to_vec(cursor)?)?;
        Ok(())
    }

    /// Commits `offset` for the pair, refreshing `last_committed` and
    /// creating the cursor with a default consumer id if it did not exist.
    pub fn commit(&self, group: &str, topic: &str, offset: u64) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut cursor = self
            .get(group, topic)?
            .unwrap_or_else(|| Self::fresh(group, topic));
        cursor.offset = offset;
        cursor.last_committed = Utc::now();
        cursor.active = true;
        self.put(&cursor)
    }

    /// Last committed offset for the pair, 0 when nothing was committed.
    pub fn committed(&self, group: &str, topic: &str) -> Result<u64> {
        Ok(self.get(group, topic)?.map(|c| c.offset).unwrap_or(0))
    }

    /// Toggles the liveness flag at consume-session start and end.
    pub fn set_active(
        &self,
        group: &str,
        topic: &str,
        consumer_id: &str,
        active: bool,
    ) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut cursor = self
            .get(group, topic)?
            .unwrap_or_else(|| Self::fresh(group, topic));
        cursor.consumer_id = consumer_id.to_string();
        cursor.active = active;
        self.put(&cursor)
    }

    pub fn list_active(&self) -> Result<Vec<ConsumerCursor>> {
        let mut active = Vec::new();
        for entry in self.tree.iter() {
            let (_, row) = entry?;
            let cursor: ConsumerCursor = serde_json::from_slice(&row)?;
            if cursor.active {
                active.push(cursor);
            }
        }
        Ok(active)
    }

    fn fresh(group: &str, topic: &str) -> ConsumerCursor {
        ConsumerCursor {
            consumer_group: group.to_string(),
            topic: topic.to_string(),
            offset: 0,
            last_committed: Utc::now(),
            consumer_id: "default".to_string(),
            active: false,
        }
    }
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore").field("tree", &CURSOR_TREE).finish()
    }
}
