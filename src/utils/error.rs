//! The `error` module defines the error types used within the `pulsemq`
//! application.
//!
//! This module centralizes error handling, providing a consistent way to
//! represent and propagate errors throughout the system.

use thiserror::Error;

/// Errors surfaced by broker operations.
///
/// `Validation` is rejected before any state is touched. `Storage` and
/// `Codec` are surfaced to the caller of the failing operation and never
/// swallowed. `Processing` only drives the retry/dead-letter transition of
/// the affected message. `Transport` evicts the affected subscriber and
/// nothing else.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("notification transport failure: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
