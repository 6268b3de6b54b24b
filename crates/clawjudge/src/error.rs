//! Error types for clawjudge.

use thiserror::Error;

/// Errors of the clawjudge service.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration is unusable.
    #[error("configuration error: {0}")]
    Invalid(String),

    /// The node identity could not be determined.
    #[error("identity error: {0}")]
    Identity(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A component could not be built.
    #[error("judge error: {0}")]
    Judge(#[from] claw_judge::JudgeError),

    /// The series layer could not be built.
    #[error("series error: {0}")]
    Series(#[from] claw_series::SeriesError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_display() {
        let err = ConfigError::Invalid("storage.batch must be greater than 0".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: storage.batch must be greater than 0"
        );
    }

    #[test]
    fn test_identity_display() {
        let err = ConfigError::Identity("no hostname".to_string());
        assert_eq!(err.to_string(), "identity error: no hostname");
    }

    #[test]
    fn test_from_io() {
        let err: ConfigError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_from_judge() {
        let err: ConfigError = claw_judge::JudgeError::Publish {
            reason: "empty file name".to_string(),
        }
        .into();
        assert!(err.to_string().contains("empty file name"));
    }
}
