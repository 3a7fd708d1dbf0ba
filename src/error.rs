//! Error types for the Turnstile engine.
//!
//! Exceeding a rate limit is not an error. It is reported through
//! [`Decision`](crate::ratelimit::Decision) like any other outcome.

use thiserror::Error;

use crate::monitor::AlertId;
use crate::ratelimit::RuleId;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid rule or engine configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A management call referenced a rule that does not exist
    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),

    /// A management call referenced an alert that does not exist
    #[error("Alert not found: {0}")]
    AlertNotFound(AlertId),

    /// External rule repository failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// A duration could not be applied to a timestamp
    #[error("Time arithmetic overflow")]
    TimeOverflow,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Configuration(err.to_string())
    }
}

impl From<serde_yaml::Error> for TurnstileError {
    fn from(err: serde_yaml::Error) -> Self {
        TurnstileError::Configuration(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
