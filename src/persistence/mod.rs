//! The `persistence` module provides the durable storage backing the broker:
//! the per-topic message log and the consumer cursor table.
//!
//! It uses `sled` as an embedded key-value store. Topic logs are sled trees
//! keyed by big-endian offset, which makes ascending-offset scans the
//! natural iteration order.

pub mod sled_store;

pub use sled_store::{ConsumerCursor, CursorStore, MessageStore};
