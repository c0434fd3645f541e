//! The `broker` module implements the core of pulsemq: producing and
//! consuming messages, the retry and dead-letter state machine, the
//! scheduler that promotes delayed messages, and the notification fan-out.
//!
//! `Broker` is the central engine; `Handler` is the seam through which
//! message processing plugs in, and `Notifier` carries delivery events to
//! connected subscribers.

pub mod engine;
pub mod handler;
pub mod message;
pub mod notifier;
pub mod scheduler;

pub use engine::Broker;

#[cfg(test)]
mod tests;
