//! Strategy catalog schema.
//!
//! A [`Strategy`] is one alerting rule as delivered by the catalog. Operator
//! fields stay plain strings on the wire and are validated when the strategy is
//! turned into entities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{TRIGGER_DURATION_HAPPEN, TRIGGER_DURATION_STAT, ThresholdOperator};

/// Points cached per series on top of the longest trigger period.
const BASE_BUFFER_SIZE: usize = 4;

/// One alerting rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    /// Unique strategy id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Alert priority.
    pub priority: i64,
    /// Model kind, `1` for thresholds.
    pub category: i64,
    /// Combinator over the judgements, `and` or `or`.
    pub operator: String,
    /// One entry per watched metric.
    pub judgements: Vec<StrategyJudgement>,
    /// Alert and recovery conditions.
    pub alert: StrategyAlert,
    /// What happens downstream once an event fires.
    pub action: StrategyAction,
    /// Queue the events of this strategy are routed to.
    pub partition: String,
    /// Longest backlog, in seconds, a judgement catches up on.
    pub window_size: i64,
    /// Endpoints the strategy applies to.
    pub endpoints: Vec<String>,
    /// Last modification, unix seconds.
    pub updated: i64,
}

/// Metric, tag filters and execution of one judgement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyJudgement {
    /// Metric name.
    pub metric: String,
    /// Tag filters.
    pub tags: Vec<StrategyTagFilter>,
    /// Expressions evaluated against the metric.
    pub execution: StrategyExecution,
}

/// A tag filter: `tagk = [tagv]` or `tagk != [tagv]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyTagFilter {
    /// Tag key.
    pub tagk: String,
    /// `=` or `!=`; anything else is ignored.
    pub operator: String,
    /// Tag values.
    pub tagv: Vec<String>,
}

/// Expressions of a judgement and when they apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyExecution {
    /// Days of the week the execution is active, `0` is Sunday.
    pub effective_day: Vec<i64>,
    /// First active minute of the day.
    pub effective_start: i64,
    /// End of the active minutes, exclusive.
    pub effective_end: i64,
    /// Combinator over the expressions.
    pub operator: String,
    /// Expressions, one trigger each.
    pub expressions: Vec<StrategyExpression>,
}

/// One trigger invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyExpression {
    /// Trigger function name.
    pub func: String,
    /// Trigger parameters.
    pub params: Vec<String>,
    /// Combinator over the thresholds.
    pub operator: String,
    /// Thresholds.
    pub thresholds: Vec<StrategyThreshold>,
}

/// A threshold such as `> 90`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyThreshold {
    /// Threshold value.
    pub threshold: f64,
    /// Comparison symbol.
    pub operator: String,
}

impl StrategyThreshold {
    /// Returns true if `value` satisfies the threshold. Unknown operators never match.
    #[must_use]
    pub fn compare(&self, value: f64) -> bool {
        ThresholdOperator::parse(&self.operator).is_some_and(|op| op.evaluate(value, self.threshold))
    }
}

/// Hysteresis and rate limiting of a strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyAlert {
    /// Alert after this many alerting slots.
    #[serde(rename = "alert_count")]
    pub alert_count_threshold: i64,
    /// Recover after this many recovered slots.
    #[serde(rename = "recover_count")]
    pub recover_count_threshold: i64,
    /// Alert after alerting for this many seconds.
    #[serde(rename = "alert_duration")]
    pub alert_duration_threshold: i64,
    /// Recover after recovering for this many seconds.
    #[serde(rename = "recover_duration")]
    pub recover_duration_threshold: i64,
    /// At most this many alerts per limit window.
    #[serde(rename = "limit_count")]
    pub limit_count_threshold: i64,
    /// Length of the limit window in seconds.
    #[serde(rename = "limit_duration")]
    pub limit_duration_threshold: i64,
}

/// Downstream notification settings, carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyAction {
    /// Receiver groups.
    pub groups: Vec<i64>,
    /// Callback URLs.
    pub callbacks: Vec<String>,
    /// Whether silences also mute callbacks.
    pub silence_extended: bool,
    /// `0` none, `1` alert and recovery, `2` alert only.
    pub notify_mode: i64,
}

/// Returns the period parameter of happen/stat expressions.
fn expression_periods(strategy: &Strategy) -> impl Iterator<Item = i64> + '_ {
    strategy
        .judgements
        .iter()
        .flat_map(|j| j.execution.expressions.iter())
        .filter(|e| {
            (e.func == TRIGGER_DURATION_HAPPEN || e.func == TRIGGER_DURATION_STAT) && e.params.len() == 2
        })
        .filter_map(|e| e.params[0].parse::<i64>().ok())
}

impl Strategy {
    /// Returns the ring size and the spans every matched series needs cached.
    #[must_use]
    pub fn max_buffer_size_and_span(&self, interval: i64) -> (usize, Vec<i64>) {
        let interval = interval.max(1);
        let max_period = expression_periods(self)
            .map(|p| p / interval)
            .fold(1, i64::max);
        (BASE_BUFFER_SIZE + max_period as usize, vec![0])
    }

    /// Returns how many judged points a series keeps as event evidence.
    #[must_use]
    pub fn max_event_history_size(&self, interval: i64) -> usize {
        let interval = interval.max(1);
        let alert = &self.alert;
        let base = [
            alert.alert_count_threshold,
            alert.recover_count_threshold,
            alert.alert_duration_threshold / interval,
            alert.recover_duration_threshold / interval,
        ]
        .into_iter()
        .chain(expression_periods(self).map(|p| p / interval))
        .fold(1, i64::max);
        base as usize
    }
}

impl StrategyJudgement {
    /// Splits the tag filters into include and exclude maps.
    #[must_use]
    pub fn xclude(&self) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, Vec<String>>) {
        let mut include = BTreeMap::new();
        let mut exclude = BTreeMap::new();
        for filter in &self.tags {
            match filter.xclude() {
                Some((true, k, v)) => {
                    include.insert(k.to_string(), v.to_vec());
                }
                Some((false, k, v)) => {
                    exclude.insert(k.to_string(), v.to_vec());
                }
                None => {}
            }
        }
        (include, exclude)
    }
}

impl StrategyTagFilter {
    /// Returns `(is_include, tagk, tagv)`, or `None` for an empty key or an
    /// operator other than `=` and `!=`.
    #[must_use]
    pub fn xclude(&self) -> Option<(bool, &str, &[String])> {
        if self.tagk.is_empty() {
            return None;
        }
        match self.operator.as_str() {
            "=" => Some((true, self.tagk.as_str(), self.tagv.as_slice())),
            "!=" => Some((false, self.tagk.as_str(), self.tagv.as_slice())),
            _ => None,
        }
    }
}
