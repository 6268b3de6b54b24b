//! Nodata pre-handler.
//!
//! The nodata trigger only sees series that exist in the index. This handler
//! covers the other case: for strategies with an effective nodata expression
//! it derives the counters the tag filters expect, looks them up in the index
//! and alerts on the ones nobody reports at all.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, Timelike};
use claw_series::series::counter_to_tags;
use claw_series::{ENDPOINT_KEY, IndexRequest, Point, Storage};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bitmap::{BitMap, EFFECTIVE_DAY_SIZE, EFFECTIVE_MINUTE_SIZE};
use crate::driver::AlertPointDriver;
use crate::event::{Event, EventType};
use crate::publish::EventPublisher;
use crate::schema::{Strategy, StrategyAlert, StrategyExecution};
use crate::types::{EventCode, LogicOperator, Status, TRIGGER_NODATA};

/// Returns the duration of the first nodata expression effective on weekday
/// `day` at `minute`.
fn nodata_duration(execution: &StrategyExecution, day: i64, minute: i64) -> Option<i64> {
    if execution.effective_day.is_empty() {
        return None;
    }
    let mut days = BitMap::new(EFFECTIVE_DAY_SIZE);
    days.set(&execution.effective_day);
    let mut minutes = BitMap::new(EFFECTIVE_MINUTE_SIZE);
    minutes.set_range(execution.effective_start, execution.effective_end);
    if !days.is_set(day) || !minutes.is_set(minute) {
        return None;
    }
    execution
        .expressions
        .iter()
        .filter(|e| e.func == TRIGGER_NODATA)
        .find_map(|e| e.params.first()?.parse::<i64>().ok())
}

/// Cartesian product of the tag values, keys in order, as counter strings.
fn cartesian(tagkvs: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut out = vec![String::new()];
    for (k, values) in tagkvs {
        out = out
            .iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    if prefix.is_empty() {
                        format!("{k}={v}")
                    } else {
                        format!("{prefix},{k}={v}")
                    }
                })
            })
            .collect();
    }
    out
}

/// Tag filters of one judgement of a nodata strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodataJudgement {
    metric: String,
    include: BTreeMap<String, Vec<String>>,
    exclude: BTreeMap<String, Vec<String>>,
}

impl NodataJudgement {
    /// Returns the counters the filters expect on `endpoints`.
    ///
    /// An `endpoint` include filter replaces `endpoints`; an `endpoint` exclude
    /// filter narrows them. Excluded values win over included ones.
    #[must_use]
    pub fn expected_counters(&self, endpoints: &[String]) -> Vec<String> {
        let mut tagkvs = BTreeMap::new();
        let hosts: Vec<String> = match (self.include.get(ENDPOINT_KEY), self.exclude.get(ENDPOINT_KEY)) {
            (Some(included), _) => included.clone(),
            (None, Some(excluded)) => endpoints.iter().filter(|e| !excluded.contains(*e)).cloned().collect(),
            (None, None) => endpoints.to_vec(),
        };
        if hosts.is_empty() {
            return Vec::new();
        }
        tagkvs.insert(ENDPOINT_KEY.to_string(), hosts);

        for (k, values) in &self.include {
            if k == ENDPOINT_KEY {
                continue;
            }
            let left: Vec<String> = match self.exclude.get(k) {
                Some(excluded) => values.iter().filter(|v| !excluded.contains(*v)).cloned().collect(),
                None => values.clone(),
            };
            if !left.is_empty() {
                tagkvs.insert(k.clone(), left);
            }
        }
        cartesian(&tagkvs)
    }

    /// Returns the expected counters that no indexed counter of `endpoints` carries.
    pub async fn missing(&self, sid: i64, stg: &dyn Storage, endpoints: &[String]) -> Vec<String> {
        let expected = self.expected_counters(endpoints);
        if expected.is_empty() {
            return expected;
        }
        let mut indexed = Vec::new();
        for endpoint in endpoints {
            let request = IndexRequest::new(endpoint.clone(), self.metric.clone(), self.include.clone(), self.exclude.clone());
            match stg.index(&request).await {
                Ok(found) => indexed.extend(found.into_iter().map(|c| counter_to_tags(&c.counter))),
                Err(e) => warn!(sid, endpoint = %endpoint, error = %e, "nodata pre handler index failed"),
            }
        }
        expected
            .into_iter()
            .filter(|counter| {
                let want = counter_to_tags(counter);
                !indexed
                    .iter()
                    .any(|have| want.iter().all(|(k, v)| have.get(k) == Some(v)))
            })
            .collect()
    }
}

/// The nodata view of a strategy at one point in time.
#[derive(Debug, Clone)]
pub struct NodataStrategy {
    sid: i64,
    partition: String,
    operator: LogicOperator,
    endpoints: Vec<String>,
    judgements: Vec<NodataJudgement>,
    metrics: String,
    alert: StrategyAlert,
    info: String,
}

impl NodataStrategy {
    /// Builds the view of `strategy` at `now`, or `None` if no judgement has an
    /// effective nodata expression.
    #[must_use]
    pub fn new(strategy: &Strategy, now: &DateTime<Local>) -> Option<Self> {
        if strategy.judgements.is_empty() || strategy.endpoints.is_empty() {
            return None;
        }
        let day = i64::from(now.weekday().num_days_from_sunday());
        let minute = i64::from(now.hour() * 60 + now.minute());

        let mut duration: Option<i64> = None;
        let mut metrics = BTreeSet::new();
        let mut judgements = Vec::new();
        for judgement in &strategy.judgements {
            let Some(d) = nodata_duration(&judgement.execution, day, minute) else {
                continue;
            };
            duration = Some(duration.map_or(d, |m| m.min(d)));
            let (include, exclude) = judgement.xclude();
            judgements.push(NodataJudgement {
                metric: judgement.metric.clone(),
                include,
                exclude,
            });
            metrics.insert(judgement.metric.clone());
        }
        let duration = duration?;
        let metrics = metrics.into_iter().collect::<Vec<_>>().join(",");
        let alert = StrategyAlert {
            alert_count_threshold: 0,
            alert_duration_threshold: duration,
            ..strategy.alert
        };

        Some(Self {
            sid: strategy.id,
            partition: strategy.partition.clone(),
            operator: LogicOperator::parse(&strategy.operator).unwrap_or(LogicOperator::And),
            endpoints: strategy.endpoints.clone(),
            judgements,
            info: format!("nodata({metrics},#{duration}s)"),
            metrics,
            alert,
        })
    }

    /// Returns the description carried by the events.
    #[must_use]
    pub fn info(&self) -> &str {
        &self.info
    }

    /// Returns the combined verdict of every counter missing in some judgement.
    async fn statuses(&self, stg: &dyn Storage) -> BTreeMap<String, Status> {
        let mut per_judgement = Vec::with_capacity(self.judgements.len());
        for judgement in &self.judgements {
            let missing: BTreeSet<String> = judgement.missing(self.sid, stg, &self.endpoints).await.into_iter().collect();
            per_judgement.push(missing);
        }
        let all: BTreeSet<&String> = per_judgement.iter().flatten().collect();
        all.into_iter()
            .map(|counter| {
                let alerting = match self.operator {
                    LogicOperator::And => per_judgement.iter().all(|m| m.contains(counter)),
                    LogicOperator::Or => true,
                };
                let status = if alerting { Status::Alert } else { Status::Recover };
                (counter.clone(), status)
            })
            .collect()
    }

    fn event(&self, counter: &str, code: EventCode, ts: i64) -> Option<Event> {
        let event_type = EventType::from_code(code)?;
        let point = match code {
            EventCode::Alert => Point::null(ts),
            _ => Point::new(ts, 0.0),
        };
        let mut event = Event::new(self.sid, self.partition.clone(), event_type);
        event.set_points(counter, self.metrics.clone(), &counter_to_tags(counter), 0, vec![point]);
        if !event.finalize() {
            return None;
        }
        event.set_info(self.info.clone());
        Some(event)
    }
}

/// Tracks one driver per (strategy, missing counter) across catalog pulls.
pub struct NodataHandler {
    drivers: Mutex<HashMap<i64, HashMap<String, AlertPointDriver>>>,
    storage: Arc<dyn Storage>,
    publisher: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for NodataHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodataHandler")
            .field("strategies", &self.drivers.lock().len())
            .finish_non_exhaustive()
    }
}

impl NodataHandler {
    /// Creates a handler without drivers.
    pub fn new(storage: Arc<dyn Storage>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            drivers: Mutex::new(HashMap::new()),
            storage,
            publisher,
        }
    }

    /// Returns the number of counters tracked for strategy `sid`.
    #[must_use]
    pub fn tracked(&self, sid: i64) -> usize {
        self.drivers.lock().get(&sid).map_or(0, HashMap::len)
    }

    /// Checks every strategy at `now` and publishes the resulting events.
    /// Returns the number of events published.
    pub async fn handle(&self, strategies: &[Strategy], now: DateTime<Local>) -> usize {
        let sids: BTreeSet<i64> = strategies.iter().map(|s| s.id).collect();
        self.drivers.lock().retain(|sid, _| sids.contains(sid));

        debug!(ts = now.timestamp(), "nodata pre handler start");
        let mut published = 0;
        for strategy in strategies {
            let Some(nodata) = NodataStrategy::new(strategy, &now) else {
                continue;
            };
            let statuses = nodata.statuses(self.storage.as_ref()).await;
            let events = self.judge(&nodata, &statuses, now.timestamp());
            for event in &events {
                match self.publisher.publish(event).await {
                    Ok(()) => published += 1,
                    Err(e) => warn!(sid = nodata.sid, error = %e, "nodata pre handler event push failed"),
                }
            }
        }
        published
    }

    fn judge(&self, nodata: &NodataStrategy, statuses: &BTreeMap<String, Status>, ts: i64) -> Vec<Event> {
        let mut events = Vec::new();
        let mut all = self.drivers.lock();
        let drivers = all.entry(nodata.sid).or_default();

        drivers.retain(|counter, driver| {
            if let Err(e) = driver.set_threshold(&nodata.alert) {
                warn!(sid = nodata.sid, error = %e, "nodata pre handler kept previous thresholds");
            }
            let alerting = statuses.get(counter) == Some(&Status::Alert);
            driver.happen(ts, if alerting { Status::Alert } else { Status::Recover });
            let code = driver.dump_event(ts, 0).code;
            events.extend(nodata.event(counter, code, ts));
            !(code == EventCode::Recover && !alerting)
        });

        for (counter, status) in statuses {
            if *status != Status::Alert || drivers.contains_key(counter) {
                continue;
            }
            let mut driver = match AlertPointDriver::new(&nodata.alert) {
                Ok(d) => d,
                Err(e) => {
                    warn!(sid = nodata.sid, error = %e, "nodata pre handler new driver failed");
                    continue;
                }
            };
            driver.happen(ts, Status::Alert);
            let code = driver.dump_event(ts, 0).code;
            if code == EventCode::Alert {
                events.extend(nodata.event(counter, code, ts));
            }
            drivers.insert(counter.clone(), driver);
        }
        events
    }
}
