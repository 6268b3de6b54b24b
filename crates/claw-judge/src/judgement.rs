//! Judgement entities: one series (or one tuple of series) driven through time.
//!
//! A judgement keeps a cursor `next` into the slot grid of its interval. Each
//! pass evaluates every slot from `next` up to the window that ended one full
//! interval ago, feeds the combined verdict to its [`AlertPointDriver`] and
//! collects the events the driver decides to emit. The cursor only moves past
//! settled slots, so a slot whose data could not be read is retried on the
//! next pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use claw_series::{ChainHistory, History, Point, Storage};
use tracing::{debug, error, warn};

use crate::driver::AlertPointDriver;
use crate::error::{JudgeError, Result};
use crate::event::{Event, EventType};
use crate::execution::ExecutionEntity;
use crate::schema::{Strategy, StrategyAlert};
use crate::trigger::TriggerInfo;
use crate::types::{EventCode, LogicOperator, Status};

/// Slots of backlog a judgement catches up on when the strategy sets no window.
const DEFAULT_WINDOW_SLOTS: i64 = 30;

/// Returns the slot window `[start, end)` judged at `now`, one interval behind.
#[must_use]
pub fn time_window(now: i64, interval: i64) -> (i64, i64) {
    let start = now - now.rem_euclid(interval) - interval;
    (start, start + interval)
}

/// One member series of a judgement.
#[derive(Debug, Clone)]
pub struct MetricEntity {
    key: String,
    id: u32,
    history: Option<ChainHistory>,
}

impl MetricEntity {
    /// Creates a member for series `id` of metric `key`.
    #[must_use]
    pub fn new(key: impl Into<String>, id: u32) -> Self {
        Self {
            key: key.into(),
            id,
            history: None,
        }
    }

    /// Returns the metric name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the series id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }
}

/// Descriptions produced by the executions of one member series.
struct InfoTuple {
    metric: String,
    infos: Vec<TriggerInfo>,
    operator: LogicOperator,
}

/// Evaluation state of one series or series tuple of a strategy.
#[derive(Debug, Clone)]
pub struct JudgementEntity {
    sid: i64,
    next: i64,
    deadline: i64,
    interval: i64,
    history_size: usize,
    window_size: i64,
    metrics: Vec<MetricEntity>,
    driver: AlertPointDriver,
}

impl JudgementEntity {
    /// Creates a judgement over `metrics` at cadence `interval`.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero interval, no metrics, or unusable alert thresholds.
    pub fn new(strategy: &Strategy, mut metrics: Vec<MetricEntity>, interval: i64) -> Result<Self> {
        if interval <= 0 {
            return Err(JudgeError::InvalidStrategy {
                reason: "zero interval".to_string(),
            });
        }
        if metrics.is_empty() {
            return Err(JudgeError::InvalidStrategy {
                reason: "empty metric".to_string(),
            });
        }
        let driver = AlertPointDriver::new(&strategy.alert)?;
        metrics.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(Self {
            sid: strategy.id,
            next: 0,
            deadline: 0,
            interval,
            history_size: strategy.max_event_history_size(interval),
            window_size: window_size(strategy, interval),
            metrics,
            driver,
        })
    }

    /// Returns the id of the first member series; unique within a strategy.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.metrics.first().map_or(0, |m| m.id)
    }

    /// Returns the next slot to judge, `0` before the first pass.
    #[must_use]
    pub const fn next(&self) -> i64 {
        self.next
    }

    /// Returns the cadence.
    #[must_use]
    pub const fn interval(&self) -> i64 {
        self.interval
    }

    /// Returns the member series.
    #[must_use]
    pub fn metrics(&self) -> &[MetricEntity] {
        &self.metrics
    }

    /// Applies new alert thresholds without touching the recorded state.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::InvalidAlert` and keeps the old thresholds if the new ones are unusable.
    pub fn set_alert(&mut self, alert: &StrategyAlert) -> Result<()> {
        self.driver.set_threshold(alert)
    }

    /// Takes over `newest`, built from a newer strategy or index.
    ///
    /// A changed cadence or member set restarts the judgement from `newest`.
    /// Otherwise the cursor, driver and evidence are kept and only the sizing
    /// is refreshed.
    pub fn update(&mut self, newest: Self) {
        let same_members = self.metrics.len() == newest.metrics.len()
            && self
                .metrics
                .iter()
                .zip(&newest.metrics)
                .all(|(a, b)| a.key == b.key && a.id == b.id);
        if self.interval != newest.interval || self.sid != newest.sid || !same_members {
            debug!(sid = self.sid, series = self.id(), "judgement replaced");
            *self = newest;
            return;
        }
        if self.history_size != newest.history_size {
            self.history_size = newest.history_size;
            for m in &mut self.metrics {
                if let Some(h) = m.history.as_mut() {
                    h.set_size(newest.history_size);
                }
            }
        }
        self.window_size = newest.window_size;
    }

    fn initialize(&mut self, now: i64) {
        let (start, end) = time_window(now, self.interval);
        self.next = start;
        self.deadline = end;
    }

    /// Judges every pending slot up to `now` and returns the events to publish.
    ///
    /// `operator` combines the member series; `executions` are the executions
    /// effective at `now`.
    pub async fn run(
        &mut self,
        stg: &dyn Storage,
        strategy: &Strategy,
        operator: LogicOperator,
        executions: &[Arc<ExecutionEntity>],
        now: i64,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        if self.driver.thresholds() != &strategy.alert {
            if let Err(e) = self.set_alert(&strategy.alert) {
                warn!(sid = self.sid, error = %e, "judgement kept previous alert thresholds");
            }
        }
        let (start, end) = time_window(now, self.interval);
        if self.next == 0 {
            debug!(sid = self.sid, series = self.id(), "judgement first start");
            self.initialize(now);
        }
        if self.next > start {
            debug!(sid = self.sid, ts = start, next = self.next, "judgement slot already finished");
            return events;
        }
        if self.window_size > 0 && start - self.next > self.window_size {
            warn!(
                sid = self.sid,
                next = self.next,
                reset = start - self.window_size,
                "judgement cursor too old, fast-forwarding"
            );
            self.next = start - self.window_size;
        }
        self.deadline = end;

        let mut ongoings: BTreeMap<i64, Status> = BTreeMap::new();
        let mut current = self.next;
        while current < self.deadline {
            if let Some(event) = self.judge_slot(stg, strategy, operator, executions, current, &mut ongoings).await {
                events.push(event);
            }
            current += self.interval;
        }

        if let Some((ts, _)) = ongoings.iter().rev().find(|(_, s)| s.is_settled()) {
            self.next = ts + self.interval;
            debug!(sid = self.sid, series = self.id(), next = self.next, "judgement cursor advanced");
        }
        events
    }

    async fn judge_slot(
        &mut self,
        stg: &dyn Storage,
        strategy: &Strategy,
        operator: LogicOperator,
        executions: &[Arc<ExecutionEntity>],
        current: i64,
        ongoings: &mut BTreeMap<i64, Status>,
    ) -> Option<Event> {
        debug!(sid = self.sid, ts = current, series = self.id(), size = self.metrics.len(), "judgement slot start");

        let mut status = Status::Init;
        let mut evidence: HashMap<u32, Vec<Point>> = HashMap::new();
        let mut infos: Vec<InfoTuple> = Vec::new();
        let mut ran = false;

        for metric in &self.metrics {
            let mut metric_status = Status::Init;
            for execution in executions.iter().filter(|e| e.key() == metric.key) {
                ran = true;
                let outcome = execution.run(stg, metric.id, current, self.interval).await;
                metric_status = operator.combine(metric_status, outcome.status);
                if !outcome.infos.is_empty() {
                    infos.push(InfoTuple {
                        metric: metric.key.clone(),
                        infos: outcome.infos,
                        operator: outcome.operator,
                    });
                }
                if !outcome.points.is_empty() {
                    evidence.entry(metric.id).or_default().extend(outcome.points);
                }
            }
            status = operator.combine(status, metric_status);
        }
        if ran {
            ongoings.insert(current, status);
        }

        // Already recovered: only the driver needs to see it.
        if self.driver.last_event() == EventCode::Recover && status == Status::Recover {
            self.driver.happen(current, status);
            return None;
        }

        let happened = self.driver.happen(current, status);
        if happened.valid {
            for m in &mut self.metrics {
                if let Some(points) = evidence.remove(&m.id) {
                    let size = self.history_size;
                    m.history.get_or_insert_with(|| ChainHistory::new(size)).write(&points);
                }
            }
        } else if matches!(status, Status::Alert | Status::Recover) {
            warn!(sid = self.sid, ts = current, series = self.id(), "judgement slot rejected by driver");
        }
        if happened.changed {
            for h in self.metrics.iter_mut().filter_map(|m| m.history.as_mut()) {
                h.cleanup();
            }
        }

        let dumped = self.driver.dump_event(current, self.interval);
        let Some(event_type) = EventType::from_code(dumped.code) else {
            if dumped.clean {
                for h in self.metrics.iter_mut().filter_map(|m| m.history.as_mut()) {
                    h.reset();
                }
            }
            return None;
        };

        let mut event = Event::new(strategy.id, strategy.partition.clone(), event_type);
        for m in &mut self.metrics {
            let Some(series) = stg.get(m.id) else {
                error!(sid = self.sid, series = m.id, "judgement series not found");
                continue;
            };
            let Some(history) = m.history.as_mut() else {
                warn!(sid = self.sid, series = m.id, "judgement event without history");
                continue;
            };
            let points = history.dump();
            if points.is_empty() {
                warn!(sid = self.sid, series = m.id, "judgement event without points");
                continue;
            }
            history.reset();
            event.set_points(series.key(), series.metric.clone(), &series.tags, series.granularity, points);
        }
        event.set_info(render_info(&infos, operator));

        event.finalize().then_some(event)
    }
}

/// Joins the descriptions, e.g. `(happen(cpu,30s,2)=92.00 >90.00) and (max(mem,30s)=1.00 >0.50)`.
fn render_info(tuples: &[InfoTuple], operator: LogicOperator) -> String {
    let wrap = tuples.len() > 1;
    tuples
        .iter()
        .map(|t| {
            let inner = t
                .infos
                .iter()
                .map(|i| i.render(&t.metric))
                .collect::<Vec<_>>()
                .join(&format!(" {} ", t.operator));
            if wrap { format!("({inner})") } else { inner }
        })
        .collect::<Vec<_>>()
        .join(&format!(" {operator} "))
}

fn window_size(strategy: &Strategy, interval: i64) -> i64 {
    if strategy.window_size > 0 {
        strategy.window_size - strategy.window_size % interval + interval
    } else {
        interval * DEFAULT_WINDOW_SLOTS
    }
}
