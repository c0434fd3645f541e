//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `pulsemq` application.
//!
//! This module aims to centralize reusable components, such as the broker
//! error types and logging setup, to promote code consistency and reduce
//! duplication.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }
}
