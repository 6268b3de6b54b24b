//! Core types for the evaluation engine.
//!
//! This module provides the small closed vocabularies shared by every layer:
//! - [`Status`]: the verdict of a trigger, an execution or a whole slot
//! - [`EventCode`]: what an alert driver decided to emit
//! - [`LogicOperator`]: the `and`/`or` combinator over verdicts and thresholds
//! - [`ThresholdOperator`]: comparison of a value against a threshold
//! - [`MathOperator`]: the reduction applied by a statistics trigger

use serde::{Deserialize, Serialize};

/// Function name of the "happened N times within a duration" trigger.
pub const TRIGGER_DURATION_HAPPEN: &str = "duration_happen";
/// Function name of the "aggregate over a duration" trigger.
pub const TRIGGER_DURATION_STAT: &str = "duration_stat";
/// Function name of the "no data within a duration" trigger.
pub const TRIGGER_NODATA: &str = "nodata";

/// Cadence used before any series has been resolved, in seconds.
pub const DEFAULT_INTERVAL: i64 = 10;

/// Verdict over one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Skip the slot for good.
    Empty,
    /// The condition does not hold.
    Recover,
    /// The condition holds.
    Alert,
    /// Data was not available yet; retry the slot later.
    Null,
    /// Neutral starting value of a combination.
    Init,
}

impl Status {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Recover => "RECOVER",
            Self::Alert => "ALERT",
            Self::Null => "NULL",
            Self::Init => "INIT",
        }
    }

    /// Returns true if a slot with this verdict is finished and need not be retried.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Alert | Self::Recover | Self::Empty)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of an alert driver's event check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCode {
    /// Nothing to emit.
    Null,
    /// Emit a recovery.
    Recover,
    /// Emit an alert.
    Alert,
}

/// Logical combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicOperator {
    /// Both operands must hold.
    And,
    /// Either operand may hold.
    Or,
}

impl LogicOperator {
    /// Parses `and` or `or`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            _ => None,
        }
    }

    /// Returns the operator as it appears in strategies.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }

    /// Combines two boolean results.
    #[must_use]
    pub const fn apply(&self, a: bool, b: bool) -> bool {
        match self {
            Self::And => a && b,
            Self::Or => a || b,
        }
    }

    /// Combines two verdicts.
    ///
    /// `Empty` dominates and `Init` is absorbed by the other operand. `Null`
    /// dominates too, except that `or` with an `Alert` operand yields `Alert`.
    /// The table is deliberately asymmetric: `and` never rescues `Recover` from
    /// `Null`.
    #[must_use]
    pub const fn combine(&self, a: Status, b: Status) -> Status {
        match (a, b) {
            (Status::Empty, _) | (_, Status::Empty) | (Status::Init, Status::Init) => Status::Empty,
            (Status::Init, other) | (other, Status::Init) => other,
            (Status::Null, other) | (other, Status::Null) => {
                if matches!(self, Self::Or) && matches!(other, Status::Alert) {
                    Status::Alert
                } else {
                    Status::Null
                }
            }
            _ => self.combine_settled(a, b),
        }
    }

    /// Two-valued combination used when no operand can be unknown.
    ///
    /// Anything that is not an `Alert` counts as `Recover` under `and`, and
    /// anything that is not a `Recover` counts as `Alert` under `or`.
    #[must_use]
    pub const fn combine_settled(&self, a: Status, b: Status) -> Status {
        match self {
            Self::And => {
                if matches!(a, Status::Alert) && matches!(b, Status::Alert) {
                    Status::Alert
                } else {
                    Status::Recover
                }
            }
            Self::Or => {
                if matches!(a, Status::Recover) && matches!(b, Status::Recover) {
                    Status::Recover
                } else {
                    Status::Alert
                }
            }
        }
    }
}

impl std::fmt::Display for LogicOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Comparison operators for thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThresholdOperator {
    /// Equal (=).
    #[serde(rename = "=")]
    Equal,
    /// Not equal (!=).
    #[serde(rename = "!=")]
    NotEqual,
    /// Greater than (>).
    #[serde(rename = ">")]
    GreaterThan,
    /// Greater than or equal (>=).
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    /// Less than (<).
    #[serde(rename = "<")]
    LessThan,
    /// Less than or equal (<=).
    #[serde(rename = "<=")]
    LessThanOrEqual,
}

impl ThresholdOperator {
    /// Parses an operator symbol.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            ">" => Some(Self::GreaterThan),
            ">=" => Some(Self::GreaterThanOrEqual),
            "<" => Some(Self::LessThan),
            "<=" => Some(Self::LessThanOrEqual),
            _ => None,
        }
    }

    /// Evaluates `left <op> right`. Values compare exactly.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn evaluate(&self, left: f64, right: f64) -> bool {
        match self {
            Self::Equal => left == right,
            Self::NotEqual => left != right,
            Self::GreaterThan => left > right,
            Self::GreaterThanOrEqual => left >= right,
            Self::LessThan => left < right,
            Self::LessThanOrEqual => left <= right,
        }
    }

    /// Returns the operator as a string symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
        }
    }
}

impl std::fmt::Display for ThresholdOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_symbol())
    }
}

/// Reduction of a statistics trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MathOperator {
    /// Largest value.
    Max,
    /// Smallest value.
    Min,
    /// Arithmetic mean.
    Avg,
    /// Sum of values.
    Sum,
    /// Every value must satisfy the threshold on its own.
    All,
}

impl MathOperator {
    /// Parses `max`, `min`, `avg`, `sum` or `all`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            "avg" => Some(Self::Avg),
            "sum" => Some(Self::Sum),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Returns the operator name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Min => "min",
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::All => "all",
        }
    }
}

impl std::fmt::Display for MathOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod status_tests {
        use super::*;

        #[test]
        fn test_settled() {
            assert!(Status::Alert.is_settled());
            assert!(Status::Recover.is_settled());
            assert!(Status::Empty.is_settled());
            assert!(!Status::Null.is_settled());
            assert!(!Status::Init.is_settled());
        }

        #[test]
        fn test_display() {
            assert_eq!(Status::Alert.to_string(), "ALERT");
            assert_eq!(Status::Null.to_string(), "NULL");
        }
    }

    mod combine_tests {
        use super::*;
        use test_case::test_case;
        use Status::{Alert, Empty, Init, Null, Recover};

        #[test_case(LogicOperator::And, Alert, Alert, Alert ; "and alert alert")]
        #[test_case(LogicOperator::And, Alert, Recover, Recover ; "and alert recover")]
        #[test_case(LogicOperator::And, Recover, Recover, Recover ; "and recover recover")]
        #[test_case(LogicOperator::And, Alert, Null, Null ; "and alert null")]
        #[test_case(LogicOperator::And, Recover, Null, Null ; "and recover null")]
        #[test_case(LogicOperator::And, Null, Null, Null ; "and null null")]
        #[test_case(LogicOperator::Or, Alert, Alert, Alert ; "or alert alert")]
        #[test_case(LogicOperator::Or, Alert, Recover, Alert ; "or alert recover")]
        #[test_case(LogicOperator::Or, Recover, Recover, Recover ; "or recover recover")]
        #[test_case(LogicOperator::Or, Alert, Null, Alert ; "or alert null")]
        #[test_case(LogicOperator::Or, Null, Alert, Alert ; "or null alert")]
        #[test_case(LogicOperator::Or, Recover, Null, Null ; "or recover null")]
        #[test_case(LogicOperator::Or, Null, Null, Null ; "or null null")]
        #[test_case(LogicOperator::And, Empty, Alert, Empty ; "empty dominates")]
        #[test_case(LogicOperator::Or, Null, Empty, Empty ; "empty dominates null")]
        #[test_case(LogicOperator::And, Init, Alert, Alert ; "init absorbed left")]
        #[test_case(LogicOperator::Or, Null, Init, Null ; "init absorbed right")]
        #[test_case(LogicOperator::And, Init, Init, Empty ; "init init")]
        fn test_combine(op: LogicOperator, a: Status, b: Status, expected: Status) {
            assert_eq!(op.combine(a, b), expected);
        }

        #[test_case(LogicOperator::And, Alert, Empty, Recover ; "and missing operand")]
        #[test_case(LogicOperator::Or, Alert, Empty, Alert ; "or missing operand")]
        #[test_case(LogicOperator::Or, Recover, Recover, Recover ; "or both recover")]
        fn test_combine_settled(op: LogicOperator, a: Status, b: Status, expected: Status) {
            assert_eq!(op.combine_settled(a, b), expected);
        }

        #[test]
        fn test_apply() {
            assert!(LogicOperator::Or.apply(false, true));
            assert!(!LogicOperator::And.apply(false, true));
        }
    }

    mod parse_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("=", 5.0, 5.0, true ; "equal")]
        #[test_case("!=", 5.0, 5.0, false ; "not equal")]
        #[test_case(">", 6.0, 5.0, true ; "greater")]
        #[test_case(">=", 5.0, 5.0, true ; "greater or equal")]
        #[test_case("<", 4.0, 5.0, true ; "less")]
        #[test_case("<=", 6.0, 5.0, false ; "less or equal")]
        fn test_threshold_operator(symbol: &str, left: f64, right: f64, expected: bool) {
            let op = ThresholdOperator::parse(symbol).unwrap();
            assert_eq!(op.evaluate(left, right), expected);
            assert_eq!(op.as_symbol(), symbol);
        }

        #[test]
        fn test_unknown_operators() {
            assert!(ThresholdOperator::parse("==").is_none());
            assert!(LogicOperator::parse("xor").is_none());
            assert!(MathOperator::parse("median").is_none());
        }

        #[test]
        fn test_math_operator_roundtrip() {
            for name in ["max", "min", "avg", "sum", "all"] {
                assert_eq!(MathOperator::parse(name).unwrap().as_str(), name);
            }
        }
    }
}
