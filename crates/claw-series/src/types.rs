//! Core data types for series samples.
//!
//! This module provides:
//! - [`Point`]: a single `(timestamp, value)` sample
//! - Keyword constants shared by series keys and counter strings

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tag key that carries the endpoint a series belongs to.
pub const ENDPOINT_KEY: &str = "endpoint";

/// Separator between the parts of a series key.
pub const COUNTER_SEPARATOR: &str = "/";

/// A single sample of a series.
///
/// Timestamps are unix seconds aligned to the series granularity. A `NaN`
/// value marks a missing sample and is encoded as JSON `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// The sampled value, `NaN` when absent.
    #[serde(
        serialize_with = "serialize_value",
        deserialize_with = "deserialize_value"
    )]
    pub value: f64,
}

impl Point {
    /// Creates a new point.
    #[must_use]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Creates a point with a missing value.
    #[must_use]
    pub const fn null(timestamp: i64) -> Self {
        Self {
            timestamp,
            value: f64::NAN,
        }
    }

    /// Returns true if the value is present and finite.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.value.is_finite()
    }
}

fn serialize_value<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        serializer.serialize_none()
    }
}

fn deserialize_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod point_tests {
        use super::*;

        #[test]
        fn test_point_new() {
            let p = Point::new(10, 91.0);
            assert_eq!(p.timestamp, 10);
            assert!((p.value - 91.0).abs() < f64::EPSILON);
            assert!(p.is_valid());
        }

        #[test]
        fn test_point_null_is_invalid() {
            let p = Point::null(20);
            assert!(p.value.is_nan());
            assert!(!p.is_valid());
        }

        #[test]
        fn test_infinite_is_invalid() {
            assert!(!Point::new(1, f64::INFINITY).is_valid());
        }
    }

    mod serde_tests {
        use super::*;

        #[test]
        fn test_nan_serializes_as_null() {
            let json = serde_json::to_string(&Point::null(30)).unwrap();
            assert_eq!(json, r#"{"timestamp":30,"value":null}"#);
        }

        #[test]
        fn test_null_deserializes_as_nan() {
            let p: Point = serde_json::from_str(r#"{"timestamp":30,"value":null}"#).unwrap();
            assert_eq!(p.timestamp, 30);
            assert!(p.value.is_nan());
        }

        #[test]
        fn test_value_roundtrip() {
            let p: Point = serde_json::from_str(r#"{"timestamp":40,"value":1.5}"#).unwrap();
            assert_eq!(p, Point::new(40, 1.5));
        }
    }
}
