//! The `transport` module is responsible for the push-notification channel,
//! a WebSocket server carrying subscription actions from clients and
//! notification frames back to them.
//!
//! It defines the client frame protocol and implements the WebSocket
//! server itself, managing connections, frame parsing, and forwarding
//! subscription requests to the notifier.

pub mod message;
pub mod websocket;
