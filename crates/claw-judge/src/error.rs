//! Error types for the claw-judge crate.

use thiserror::Error;

/// Errors that can occur while building or evaluating strategies.
#[derive(Debug, Error)]
pub enum JudgeError {
    /// The strategy as a whole is unusable.
    #[error("invalid strategy: {reason}")]
    InvalidStrategy {
        /// The reason the strategy is invalid.
        reason: String,
    },

    /// An execution block of a judgement is unusable.
    #[error("invalid execution: {reason}")]
    InvalidExecution {
        /// The reason the execution is invalid.
        reason: String,
    },

    /// A trigger expression is unusable, or cannot run for the given series.
    #[error("invalid trigger: {reason}")]
    InvalidTrigger {
        /// The reason the trigger is invalid.
        reason: String,
    },

    /// The alert thresholds can never fire or never clear.
    #[error("invalid alert thresholds: {reason}")]
    InvalidAlert {
        /// The reason the thresholds are invalid.
        reason: String,
    },

    /// An event could not be delivered.
    #[error("publish failed: {reason}")]
    Publish {
        /// The reason delivery failed.
        reason: String,
    },

    /// The publisher was closed; the event was not taken.
    #[error("publisher closed")]
    Closed,

    /// The remote strategy catalog failed.
    #[error("strategy catalog failed: {reason}")]
    Remote {
        /// The reason the catalog call failed.
        reason: String,
    },

    /// Reading series data or the series index failed.
    #[error("storage error: {0}")]
    Storage(#[from] claw_series::SeriesError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// File system error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for JudgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for JudgeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Remote {
            reason: err.to_string(),
        }
    }
}

/// Result type for judge operations.
pub type Result<T> = std::result::Result<T, JudgeError>;
