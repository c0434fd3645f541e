//! # PulseMQ
//!
//! `pulsemq` is a single-node message broker built with Rust. Producers
//! append messages to named topic logs, consumer groups pull messages in
//! offset order and commit their progress, and live subscribers receive
//! push notifications over WebSockets when new work arrives. Failed
//! deliveries are retried with a backoff and dead-lettered once their
//! retry budget is spent.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: the delivery engine, the retry/dead-letter state machine, the
//!   scheduler for delayed messages and the notification fan-out.
//! - `config`: handles loading and managing server configuration.
//! - `persistence`: the sled-backed topic log and consumer cursor store.
//! - `transport`: the WebSocket push-notification server and its frame protocol.
//! - `utils`: shared utilities, such as error types and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::Broker;
pub use broker::handler::{Handler, HandlerRegistry, LogHandler};
pub use broker::message::{ConsumeRequest, Message, MessageStatus, ProduceRequest};
pub use broker::notifier::Notifier;
pub use broker::scheduler::Scheduler;
pub use persistence::{CursorStore, MessageStore};
pub use utils::error::BrokerError;
