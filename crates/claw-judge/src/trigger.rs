//! Triggers: stateless evaluators of one series at one slot.
//!
//! Every trigger reads the window `(current - delta, current]` of the series
//! from storage, where `delta` is its duration rounded up to whole series
//! granularities (at least one granularity). Happen and stat triggers only decide
//! once the point at exactly `current` is present; before that the slot is
//! [`Status::Null`] and will be retried.

use claw_series::{Point, Storage};

use crate::error::{JudgeError, Result};
use crate::schema::{StrategyExpression, StrategyThreshold};
use crate::types::{
    LogicOperator, MathOperator, Status, TRIGGER_DURATION_HAPPEN, TRIGGER_DURATION_STAT, TRIGGER_NODATA,
};

/// Description of a trigger result, with the metric name left open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    head: String,
    tail: String,
}

impl TriggerInfo {
    /// Renders the description for `metric`, e.g. `happen(cpu.idle,30s,2)=92.00 >90.00`.
    #[must_use]
    pub fn render(&self, metric: &str) -> String {
        format!("{}{metric}{}", self.head, self.tail)
    }
}

/// Outcome of one trigger run.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Verdict for the slot.
    pub status: Status,
    /// Evidence points.
    pub points: Vec<Point>,
    /// Description, present for alert and recover verdicts.
    pub info: Option<TriggerInfo>,
}

impl Verdict {
    /// A verdict without evidence.
    #[must_use]
    pub const fn bare(status: Status) -> Self {
        Self {
            status,
            points: Vec::new(),
            info: None,
        }
    }

    fn decided(alert: bool, points: Vec<Point>, info: TriggerInfo) -> Self {
        Self {
            status: if alert { Status::Alert } else { Status::Recover },
            points,
            info: Some(info),
        }
    }
}

/// Thresholds combined with `and`/`or`.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerThreshold {
    thresholds: Vec<StrategyThreshold>,
    operator: LogicOperator,
}

impl TriggerThreshold {
    /// Creates a threshold set.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::InvalidTrigger` for an empty list or an unknown operator.
    pub fn new(thresholds: &[StrategyThreshold], operator: &str) -> Result<Self> {
        if thresholds.is_empty() {
            return Err(invalid("empty expression threshold"));
        }
        let operator = LogicOperator::parse(operator).ok_or_else(|| invalid("illegal expression operator"))?;
        Ok(Self {
            thresholds: thresholds.to_vec(),
            operator,
        })
    }

    /// Returns true if `value` satisfies the thresholds, folded left to right.
    #[must_use]
    pub fn compare(&self, value: f64) -> bool {
        let mut results = self.thresholds.iter().map(|t| t.compare(value));
        let first = results.next().unwrap_or(false);
        results.fold(first, |acc, r| self.operator.apply(acc, r))
    }

    /// Describes a single threshold as `>90.00`; several thresholds are not described.
    fn describe(&self) -> String {
        match self.thresholds.as_slice() {
            [only] => format!("{}{:.2}", only.operator, only.threshold),
            _ => String::new(),
        }
    }
}

/// Builds [`TriggerInfo`] values for one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InfoTemplate {
    head: String,
    args: String,
    suffix: String,
}

impl InfoTemplate {
    fn new(name: &str, args: String, suffix: String) -> Self {
        Self {
            head: format!("{name}("),
            args: format!("{args})"),
            suffix,
        }
    }

    fn info(&self, value: Option<f64>) -> TriggerInfo {
        let mut tail = self.args.clone();
        if let Some(v) = value {
            tail.push_str(&format!("={v:.2}"));
        }
        if !self.suffix.is_empty() {
            tail.push(' ');
            tail.push_str(&self.suffix);
        }
        TriggerInfo {
            head: self.head.clone(),
            tail,
        }
    }
}

/// Alerts when at least `limit` points of the window satisfy the thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationHappen {
    threshold: TriggerThreshold,
    template: InfoTemplate,
    duration: i64,
    limit: usize,
}

/// Alerts when an aggregate of the window satisfies the thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationStat {
    threshold: TriggerThreshold,
    template: InfoTemplate,
    duration: i64,
    operator: MathOperator,
}

/// Alerts when the window holds no data at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Nodata {
    template: InfoTemplate,
    duration: i64,
}

/// A trigger of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// `duration_happen(duration, count)`.
    DurationHappen(DurationHappen),
    /// `duration_stat(duration, max|min|avg|sum|all)`.
    DurationStat(DurationStat),
    /// `nodata(duration)`.
    Nodata(Nodata),
}

fn invalid(reason: impl Into<String>) -> JudgeError {
    JudgeError::InvalidTrigger {
        reason: reason.into(),
    }
}

fn param_illegal() -> JudgeError {
    invalid("param illegal")
}

/// Window length for a duration, rounded up to whole granularities, at least one granularity.
/// Saturates instead of overflowing on huge durations.
fn window_delta(duration: i64, granularity: i64) -> i64 {
    let steps = duration.saturating_add(granularity - 1) / granularity;
    steps.max(1).saturating_mul(granularity)
}

/// Valid points in `(stime, etime]` and whether the point at `etime` was among them.
fn window_points(points: Vec<Point>, stime: i64, etime: i64) -> (Vec<Point>, bool) {
    let ps: Vec<Point> = points
        .into_iter()
        .filter(|p| p.timestamp > stime && p.timestamp <= etime && !p.value.is_nan())
        .collect();
    let enough = ps.iter().any(|p| p.timestamp == etime);
    (ps, enough)
}

impl DurationHappen {
    /// Parses `[duration, count]`.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::InvalidTrigger` for bad thresholds or parameters.
    pub fn new(thresholds: &[StrategyThreshold], operator: &str, params: &[String]) -> Result<Self> {
        let threshold = TriggerThreshold::new(thresholds, operator)?;
        let [duration, limit] = params else {
            return Err(param_illegal());
        };
        let duration_secs: i64 = duration.parse().map_err(|_| param_illegal())?;
        let limit_count: i64 = limit.parse().map_err(|_| param_illegal())?;
        if duration_secs <= 0 || limit_count <= 0 {
            return Err(param_illegal());
        }
        let template = InfoTemplate::new("happen", format!(",{duration}s,{limit}"), threshold.describe());
        Ok(Self {
            threshold,
            template,
            duration: duration_secs,
            limit: limit_count as usize,
        })
    }

    async fn run(&self, stg: &dyn Storage, id: u32, current: i64, granularity: i64) -> Result<Verdict> {
        // `limit` points can never fit into the window.
        let needed = i64::try_from(self.limit).ok().and_then(|l| l.checked_mul(granularity));
        if needed.is_none_or(|n| n > self.duration.saturating_add(granularity)) {
            return Ok(Verdict::bare(Status::Empty));
        }
        let stime = current.saturating_sub(window_delta(self.duration, granularity));
        let (ps, enough) = window_points(stg.query(id, stime, current, 0).await?, stime, current);
        if !enough {
            return Ok(Verdict::bare(Status::Null));
        }
        // A gap left fewer points than required.
        if ps.len() < self.limit {
            return Ok(Verdict::bare(Status::Empty));
        }
        let count = ps.iter().filter(|p| self.threshold.compare(p.value)).count();
        let last = ps.last().map(|p| p.value);
        let info = self.template.info(last);
        Ok(Verdict::decided(count >= self.limit, ps, info))
    }
}

impl DurationStat {
    /// Parses `[duration, operator]`.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::InvalidTrigger` for bad thresholds or parameters.
    pub fn new(thresholds: &[StrategyThreshold], operator: &str, params: &[String]) -> Result<Self> {
        let threshold = TriggerThreshold::new(thresholds, operator)?;
        let [duration, math] = params else {
            return Err(param_illegal());
        };
        let duration_secs: i64 = duration.parse().map_err(|_| param_illegal())?;
        let math_op = MathOperator::parse(math).ok_or_else(param_illegal)?;
        let template = InfoTemplate::new(math_op.as_str(), format!(",{duration}s"), threshold.describe());
        Ok(Self {
            threshold,
            template,
            duration: duration_secs,
            operator: math_op,
        })
    }

    /// Reduces the window. Returns the final value and whether it triggers.
    fn reduce(&self, ps: &[Point]) -> (f64, bool) {
        let values = ps.iter().map(|p| p.value);
        let n = ps.len() as f64;
        let final_value = match self.operator {
            MathOperator::Max => values.reduce(f64::max).unwrap_or(0.0),
            MathOperator::Min => values.reduce(f64::min).unwrap_or(0.0),
            MathOperator::Avg => values.map(|v| v / n).sum(),
            MathOperator::Sum => values.sum(),
            MathOperator::All => {
                // The first failing point decides.
                let mut last = 0.0;
                for v in values {
                    last = v;
                    if !self.threshold.compare(v) {
                        return (v, false);
                    }
                }
                return (last, !ps.is_empty());
            }
        };
        (final_value, self.threshold.compare(final_value))
    }

    async fn run(&self, stg: &dyn Storage, id: u32, current: i64, granularity: i64) -> Result<Verdict> {
        let stime = current.saturating_sub(window_delta(self.duration, granularity));
        let (ps, enough) = window_points(stg.query(id, stime, current, 0).await?, stime, current);
        if !enough {
            return Ok(Verdict::bare(Status::Null));
        }
        let (final_value, triggered) = self.reduce(&ps);
        let info = self.template.info(Some(final_value));
        Ok(Verdict::decided(triggered, ps, info))
    }
}

impl Nodata {
    /// Parses `[duration, ...]`.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::InvalidTrigger` if the duration is missing or malformed.
    pub fn new(params: &[String]) -> Result<Self> {
        let duration = params.first().ok_or_else(param_illegal)?;
        let duration_secs: i64 = duration.parse().map_err(|_| param_illegal())?;
        Ok(Self {
            template: InfoTemplate::new("nodata", format!(",#{duration}s"), String::new()),
            duration: duration_secs,
        })
    }

    async fn run(&self, stg: &dyn Storage, id: u32, current: i64, granularity: i64) -> Result<Verdict> {
        let delta = self.duration.max(granularity);
        // Shifted one second so the oldest slot of the window is not double counted.
        let stime = current.saturating_sub(delta).saturating_add(1);
        let (mut ps, _) = window_points(stg.query(id, stime, current, 0).await?, stime, current);
        let info = self.template.info(None);
        match ps.pop() {
            None => Ok(Verdict::decided(true, vec![Point::null(current.saturating_sub(granularity))], info)),
            Some(latest) => Ok(Verdict::decided(false, vec![latest], info)),
        }
    }
}

impl Trigger {
    /// Builds the trigger named by `expression.func`.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::InvalidTrigger` for unknown functions or bad parameters.
    pub fn from_expression(expression: &StrategyExpression) -> Result<Self> {
        match expression.func.as_str() {
            TRIGGER_DURATION_HAPPEN => Ok(Self::DurationHappen(DurationHappen::new(
                &expression.thresholds,
                &expression.operator,
                &expression.params,
            )?)),
            TRIGGER_DURATION_STAT => Ok(Self::DurationStat(DurationStat::new(
                &expression.thresholds,
                &expression.operator,
                &expression.params,
            )?)),
            TRIGGER_NODATA => Ok(Self::Nodata(Nodata::new(&expression.params)?)),
            other => Err(invalid(format!("unknown func: {other}"))),
        }
    }

    /// Returns the function name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DurationHappen(_) => TRIGGER_DURATION_HAPPEN,
            Self::DurationStat(_) => TRIGGER_DURATION_STAT,
            Self::Nodata(_) => TRIGGER_NODATA,
        }
    }

    /// Evaluates series `id` at slot `current`.
    ///
    /// # Errors
    ///
    /// Storage failures surface as `JudgeError::Storage`; an unassigned id or a
    /// non-positive granularity as `JudgeError::InvalidTrigger`. A happen window
    /// that can never be satisfied yields `Status::Empty`.
    pub async fn run(&self, stg: &dyn Storage, id: u32, current: i64, granularity: i64) -> Result<Verdict> {
        if id == 0 {
            return Err(invalid("illegal ID"));
        }
        if granularity <= 0 {
            return Err(invalid("illegal granularity"));
        }
        match self {
            Self::DurationHappen(t) => t.run(stg, id, current, granularity).await,
            Self::DurationStat(t) => t.run(stg, id, current, granularity).await,
            Self::Nodata(t) => t.run(stg, id, current, granularity).await,
        }
    }
}
