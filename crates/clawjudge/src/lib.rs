//! clawjudge - alert strategy evaluator
//!
//! Configuration and error types of the `clawjudge` binary. The evaluation
//! engine lives in `claw-judge`, the series buffer in `claw-series`.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;

pub use config::{IdentityConfig, JudgeConfig};
pub use error::ConfigError;
