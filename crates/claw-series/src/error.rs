//! Error types for the claw-series crate.

use thiserror::Error;

/// Errors that can occur while resolving series or reading their data.
#[derive(Debug, Error)]
pub enum SeriesError {
    /// The series description is unusable.
    #[error("invalid series: {reason}")]
    InvalidSeries {
        /// The reason the series is invalid.
        reason: String,
    },

    /// No buffer is registered for the given series id.
    #[error("series id not found: {id}")]
    IndexNotFound {
        /// The id that was looked up.
        id: u32,
    },

    /// The series buffer holds no history at all.
    #[error("history empty for series {id}")]
    HistoryEmpty {
        /// The series id.
        id: u32,
    },

    /// No history of the requested span exists for the series.
    #[error("no history with span {span} for series {id}")]
    SpanNotMatched {
        /// The series id.
        id: u32,
        /// The requested span.
        span: i64,
    },

    /// The read was not answered in time.
    #[error("data query timeout")]
    QueryTimeout,

    /// The requested time range is malformed.
    #[error("invalid range: start {start} end {end}")]
    InvalidRange {
        /// Range start (unix seconds).
        start: i64,
        /// Range end (unix seconds).
        end: i64,
    },

    /// The remote query or index service failed.
    #[error("downstream failed: {reason}")]
    Downstream {
        /// The reason reported by the client.
        reason: String,
    },

    /// The dispatcher is no longer accepting requests.
    #[error("query queue closed")]
    QueueClosed,
}

impl From<reqwest::Error> for SeriesError {
    fn from(err: reqwest::Error) -> Self {
        Self::Downstream {
            reason: err.to_string(),
        }
    }
}

/// Result type for series operations.
pub type Result<T> = std::result::Result<T, SeriesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_index_not_found() {
        let err = SeriesError::IndexNotFound { id: 42 };
        assert_eq!(err.to_string(), "series id not found: 42");
    }

    #[test]
    fn error_display_span_not_matched() {
        let err = SeriesError::SpanNotMatched { id: 7, span: 86400 };
        assert_eq!(err.to_string(), "no history with span 86400 for series 7");
    }

    #[test]
    fn error_display_invalid_range() {
        let err = SeriesError::InvalidRange { start: 20, end: 10 };
        assert_eq!(err.to_string(), "invalid range: start 20 end 10");
    }

    #[test]
    fn error_display_query_timeout() {
        assert_eq!(SeriesError::QueryTimeout.to_string(), "data query timeout");
    }

    #[test]
    fn error_display_downstream() {
        let err = SeriesError::Downstream {
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "downstream failed: connection refused");
    }
}
