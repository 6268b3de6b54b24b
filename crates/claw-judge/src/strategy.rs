//! Strategy entities: the running form of one alerting rule.
//!
//! A [`StrategyEntity`] owns the judgements of a rule and runs two loops once
//! started:
//!
//! - the evaluation loop, one pass per cadence (the smallest granularity among
//!   the matched series), which fans out every judgement under a concurrency
//!   limit and stops waiting after one cadence;
//! - the index loop, which resolves the tag filters of every judgement to
//!   series, creates judgements for new series (or series tuples) and retires
//!   the ones that no longer match.
//!
//! Newer versions of the rule are staged with [`StrategyEntity::set_cache`] and
//! only swapped in between passes, so a pass always sees one consistent
//! [`StrategyPlan`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike};
use claw_series::series::counter_to_tags;
use claw_series::{IndexRequest, Series, Storage, panic_message};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::driver::AlertPointDriver;
use crate::error::{JudgeError, Result};
use crate::event::Event;
use crate::execution::ExecutionEntity;
use crate::judgement::{JudgementEntity, MetricEntity};
use crate::publish::EventPublisher;
use crate::schema::Strategy;
use crate::types::{DEFAULT_INTERVAL, LogicOperator};

/// Separator between a metric and its judgement index in pairing keys.
const METRIC_KEY_SEPARATOR: char = '&';

/// Lifecycle of a strategy entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    /// Built, not started.
    Empty,
    /// Resolving series before the first pass.
    Starting,
    /// A pass is in progress.
    Running,
    /// Between passes.
    Waiting,
    /// Asked to stop.
    Stopping,
    /// The evaluation loop has exited.
    Stopped,
}

impl EntityStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "unknown",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Waiting)
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated strategy with its executions.
#[derive(Debug, Clone)]
pub struct StrategyPlan {
    /// The rule.
    pub strategy: Arc<Strategy>,
    /// Combinator over the judgements.
    pub operator: LogicOperator,
    /// One execution per judgement.
    pub executions: Arc<[Arc<ExecutionEntity>]>,
}

impl StrategyPlan {
    /// Validates `strategy` and builds its executions.
    ///
    /// # Errors
    ///
    /// Returns an error for a strategy without judgements or endpoints, with an
    /// unknown operator, unusable alert thresholds or an invalid execution.
    pub fn new(strategy: Strategy) -> Result<Self> {
        if strategy.judgements.is_empty() {
            return Err(JudgeError::InvalidStrategy {
                reason: "empty judgement".to_string(),
            });
        }
        if strategy.endpoints.is_empty() {
            return Err(JudgeError::InvalidStrategy {
                reason: "empty endpoint list".to_string(),
            });
        }
        let operator = LogicOperator::parse(&strategy.operator).ok_or_else(|| JudgeError::InvalidStrategy {
            reason: format!("unknown operator: {}", strategy.operator),
        })?;
        AlertPointDriver::new(&strategy.alert)?;
        let executions = strategy
            .judgements
            .iter()
            .map(|j| ExecutionEntity::new(strategy.id, &j.execution, j.metric.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            strategy: Arc::new(strategy),
            operator,
            executions: executions.into(),
        })
    }

    /// Returns the strategy id.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.strategy.id
    }
}

/// Strategy, status and size of a strategy entity.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySummary {
    /// The active rule.
    #[serde(flatten)]
    pub strategy: Strategy,
    /// Lifecycle status.
    pub status: String,
    /// Cadence in seconds.
    pub interval: i64,
    /// Number of matched series.
    pub series_count: usize,
}

/// A matched series while resolving the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CounterUnit {
    id: u32,
    granularity: i64,
}

struct State {
    plan: StrategyPlan,
    cache: Option<StrategyPlan>,
    judgements: HashMap<u32, Arc<Mutex<JudgementEntity>>>,
    status: EntityStatus,
    interval: i64,
    concurrency: usize,
    series: HashSet<u32>,
}

struct Shared {
    sid: i64,
    state: RwLock<State>,
    indexing: AtomicBool,
    storage: Arc<dyn Storage>,
    publisher: Arc<dyn EventPublisher>,
    stop: watch::Sender<bool>,
}

/// Handle to a running strategy. Cloning shares the entity.
#[derive(Clone)]
pub struct StrategyEntity {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StrategyEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEntity")
            .field("sid", &self.shared.sid)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Judgements run concurrently per cadence second of series.
fn concurrency_for(interval: i64, judgements: usize) -> usize {
    let c = judgements / interval.max(1) as usize;
    c.max(1)
}

/// Strips the judgement index suffix. The metric itself may contain the separator.
fn metric_of(mkey: &str) -> &str {
    mkey.rsplit_once(METRIC_KEY_SEPARATOR).map_or(mkey, |(metric, _)| metric)
}

/// Groups per-judgement counters into member sets.
///
/// With one judgement every counter is its own member set. With several, a
/// counter of the first judgement forms a set with the counters of the other
/// judgements that have the same counter string and granularity, and the set
/// is kept only if every judgement contributed.
fn pair_counters(counters: &BTreeMap<String, BTreeMap<String, CounterUnit>>) -> Vec<BTreeMap<String, CounterUnit>> {
    let mkeys: Vec<&String> = counters.keys().collect();
    let Some((first, rest)) = mkeys.split_first() else {
        return Vec::new();
    };
    let mut sets = Vec::new();
    for (counter, unit) in &counters[*first] {
        let mut pairs = BTreeMap::new();
        pairs.insert((*first).as_str(), *unit);
        for mkey in rest {
            let matched = counters[*mkey]
                .get(counter)
                .filter(|other| other.granularity == unit.granularity);
            if let Some(other) = matched {
                pairs.insert(mkey.as_str(), *other);
            }
        }
        if pairs.len() == mkeys.len() {
            sets.push(pairs.into_iter().map(|(mkey, u)| (metric_of(mkey).to_string(), u)).collect());
        }
    }
    sets
}

impl StrategyEntity {
    /// Creates a stopped entity for `plan`.
    pub fn new(plan: StrategyPlan, storage: Arc<dyn Storage>, publisher: Arc<dyn EventPublisher>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                sid: plan.id(),
                state: RwLock::new(State {
                    plan,
                    cache: None,
                    judgements: HashMap::new(),
                    status: EntityStatus::Empty,
                    interval: DEFAULT_INTERVAL,
                    concurrency: 1,
                    series: HashSet::new(),
                }),
                indexing: AtomicBool::new(false),
                storage,
                publisher,
                stop,
            }),
        }
    }

    /// Returns the strategy id.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.shared.sid
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> EntityStatus {
        self.shared.state.read().status
    }

    fn set_status(&self, status: EntityStatus) {
        self.shared.state.write().status = status;
    }

    /// Returns the cadence in seconds.
    #[must_use]
    pub fn interval(&self) -> i64 {
        self.shared.state.read().interval
    }

    /// Returns the number of matched series.
    #[must_use]
    pub fn series_count(&self) -> usize {
        self.shared.state.read().series.len()
    }

    /// Returns the ids of the matched series.
    #[must_use]
    pub fn series_ids(&self) -> HashSet<u32> {
        self.shared.state.read().series.clone()
    }

    /// Returns true while an index refresh is in progress.
    #[must_use]
    pub fn is_indexing(&self) -> bool {
        self.shared.indexing.load(Ordering::Acquire)
    }

    /// Returns the number of judgements.
    #[must_use]
    pub fn judgement_count(&self) -> usize {
        self.shared.state.read().judgements.len()
    }

    /// Returns the active plan.
    #[must_use]
    pub fn plan(&self) -> StrategyPlan {
        self.shared.state.read().plan.clone()
    }

    /// Returns the strategy, status and size.
    #[must_use]
    pub fn summary(&self) -> StrategySummary {
        let state = self.shared.state.read();
        StrategySummary {
            strategy: (*state.plan.strategy).clone(),
            status: state.status.as_str().to_string(),
            interval: state.interval,
            series_count: state.series.len(),
        }
    }

    /// Stages a newer version of the rule. Ignored unless the entity is running
    /// and `newest` is at least as recent as the staged (or active) version.
    pub fn set_cache(&self, newest: StrategyPlan) {
        let mut state = self.shared.state.write();
        if !state.status.is_active() {
            return;
        }
        let baseline = state
            .cache
            .as_ref()
            .map_or(state.plan.strategy.updated, |c| c.strategy.updated);
        if newest.strategy.updated >= baseline {
            state.cache = Some(newest);
        }
    }

    /// Swaps in the staged version, if any. Alert thresholds reach the
    /// judgements on their next run.
    pub fn apply_cache(&self) {
        let mut state = self.shared.state.write();
        if let Some(cache) = state.cache.take() {
            debug!(sid = self.shared.sid, updated = cache.strategy.updated, "strategy config swapped");
            state.plan = cache;
        }
    }

    /// Returns the executions effective on weekday `day` (0 is Sunday) at `minute` of the day.
    #[must_use]
    pub fn executions_by_time(&self, day: i64, minute: i64) -> Vec<Arc<ExecutionEntity>> {
        let state = self.shared.state.read();
        state
            .plan
            .executions
            .iter()
            .filter(|e| e.effective(day, minute))
            .cloned()
            .collect()
    }

    /// Re-resolves the series of every judgement and rebuilds the judgement set.
    ///
    /// Skipped while another refresh of this entity is in progress.
    pub async fn update_index(&self) {
        if self
            .shared
            .indexing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(sid = self.shared.sid, "strategy index update already running");
            return;
        }
        self.resolve_index().await;
        self.shared.indexing.store(false, Ordering::Release);
    }

    async fn resolve_index(&self) {
        let sid = self.shared.sid;
        let strategy = {
            let state = self.shared.state.read();
            state.cache.as_ref().map_or_else(|| state.plan.strategy.clone(), |c| c.strategy.clone())
        };
        let storage = &self.shared.storage;

        let mut sizing: Option<(usize, Vec<i64>)> = None;
        let mut all = HashSet::new();
        let mut fresh: HashMap<u32, JudgementEntity> = HashMap::new();
        let mut ids = HashSet::new();
        let mut interval = 0;
        let mut index_failed = false;

        for endpoint in &strategy.endpoints {
            let mut counters: BTreeMap<String, BTreeMap<String, CounterUnit>> = BTreeMap::new();

            for (i, judgement) in strategy.judgements.iter().enumerate() {
                let metric = &judgement.metric;
                let mkey = format!("{metric}{METRIC_KEY_SEPARATOR}{i}");
                let units = counters.entry(mkey).or_default();

                let (include, exclude) = judgement.xclude();
                let request = IndexRequest::new(endpoint.clone(), metric.clone(), include, exclude);
                let found = match storage.index(&request).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(sid, endpoint = %endpoint, metric = %metric, error = %e, "strategy index failed");
                        index_failed = true;
                        continue;
                    }
                };

                for counter in found {
                    if counter.step <= 0 {
                        warn!(sid, counter = %counter.counter, "strategy index skipped zero step");
                        continue;
                    }
                    let (size, spans) =
                        sizing.get_or_insert_with(|| strategy.max_buffer_size_and_span(counter.step));
                    let tags = counter_to_tags(&counter.counter);
                    let series = match Series::new(metric.clone(), tags, counter.step, counter.dstype.clone()) {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(sid, counter = %counter.counter, error = %e, "strategy index skipped series");
                            continue;
                        }
                    };
                    let id = storage.generate_and_set(series, *size, spans);
                    units.entry(counter.counter).or_insert(CounterUnit {
                        id,
                        granularity: counter.step,
                    });
                }
            }

            for members in pair_counters(&counters) {
                let mut granularity = 0;
                let metrics: Vec<MetricEntity> = members
                    .into_iter()
                    .map(|(metric, unit)| {
                        granularity = unit.granularity;
                        ids.insert(unit.id);
                        MetricEntity::new(metric, unit.id)
                    })
                    .collect();
                if interval == 0 || granularity < interval {
                    interval = granularity;
                }
                match JudgementEntity::new(&strategy, metrics, granularity) {
                    Ok(je) => {
                        all.insert(je.id());
                        fresh.insert(je.id(), je);
                    }
                    Err(e) => warn!(sid, error = %e, "strategy judgement rejected"),
                }
            }
        }

        if interval == 0 && index_failed {
            warn!(sid, "strategy index unavailable, keeping judgements");
            return;
        }
        if interval == 0 {
            warn!(sid, "strategy index found no series");
            let mut state = self.shared.state.write();
            state.judgements.clear();
            state.interval = DEFAULT_INTERVAL;
            state.concurrency = 1;
            state.series.clear();
            return;
        }

        // Existing judgements take over their newer version outside the state lock.
        let existing: Vec<(u32, Arc<Mutex<JudgementEntity>>)> = {
            let state = self.shared.state.read();
            state
                .judgements
                .iter()
                .filter(|(id, _)| fresh.contains_key(id))
                .map(|(id, j)| (*id, j.clone()))
                .collect()
        };
        for (id, judgement) in existing {
            if let Some(newest) = fresh.remove(&id) {
                judgement.lock().await.update(newest);
            }
        }

        let mut state = self.shared.state.write();
        // Series behind a failed index call are unknown, not gone.
        if index_failed {
            interval = interval.min(state.interval);
        } else {
            state.judgements.retain(|id, _| all.contains(id));
        }
        for (id, je) in fresh {
            state.judgements.entry(id).or_insert_with(|| Arc::new(Mutex::new(je)));
        }
        state.interval = interval;
        state.concurrency = concurrency_for(interval, state.judgements.len());
        if index_failed {
            state.series.extend(ids);
        } else {
            state.series = ids;
        }
        debug!(
            sid,
            interval,
            judgements = state.judgements.len(),
            series = state.series.len(),
            "strategy index updated"
        );
    }

    /// Runs one pass at `now` and publishes the resulting events.
    ///
    /// Returns once every judgement finished or one cadence elapsed. Judgements
    /// still running at that point are left to finish (and publish) on their own.
    pub async fn run_once(&self, now: DateTime<Local>) {
        let sid = self.shared.sid;
        self.set_status(EntityStatus::Running);
        let day = i64::from(now.weekday().num_days_from_sunday());
        let minute = i64::from(now.hour() * 60 + now.minute());
        let executions: Arc<[Arc<ExecutionEntity>]> = self.executions_by_time(day, minute).into();
        if executions.is_empty() {
            debug!(sid, "strategy had no effective executions");
            return;
        }

        let (strategy, operator, judgements, interval, concurrency) = {
            let state = self.shared.state.read();
            (
                state.plan.strategy.clone(),
                state.plan.operator,
                state.judgements.values().cloned().collect::<Vec<_>>(),
                state.interval,
                state.concurrency,
            )
        };
        let ts = now.timestamp();
        let started = std::time::Instant::now();
        let limiter = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        for judgement in judgements {
            let limiter = limiter.clone();
            let storage = self.shared.storage.clone();
            let publisher = self.shared.publisher.clone();
            let strategy = strategy.clone();
            let executions = executions.clone();
            tasks.spawn(async move {
                let Ok(_permit) = limiter.acquire_owned().await else {
                    return;
                };
                let Ok(mut judgement) = judgement.try_lock_owned() else {
                    debug!(sid, "judgement still busy with an earlier pass");
                    return;
                };
                let run = AssertUnwindSafe(judgement.run(storage.as_ref(), &strategy, operator, &executions, ts))
                    .catch_unwind()
                    .await;
                match run {
                    Ok(events) => publish_events(sid, publisher.as_ref(), &events).await,
                    Err(payload) => {
                        let backtrace = std::backtrace::Backtrace::force_capture();
                        error!(
                            sid,
                            series = judgement.id(),
                            panic = %panic_message(payload.as_ref()),
                            backtrace = %backtrace,
                            "judgement run panicked"
                        );
                    }
                }
            });
        }

        let deadline = Duration::from_secs(interval.max(1) as u64);
        let finished = tokio::time::timeout(deadline, async { while tasks.join_next().await.is_some() {} }).await;
        if finished.is_err() {
            warn!(sid, remaining = tasks.len(), "strategy pass timed out");
            tasks.detach_all();
        }
        debug!(sid, cost_ms = started.elapsed().as_millis() as u64, "strategy pass finished");
    }

    /// Resolves the series and starts the evaluation and index loops.
    pub async fn start(&self, index_interval: Duration) {
        let sid = self.shared.sid;
        info!(sid, "strategy entity started");
        self.set_status(EntityStatus::Starting);
        self.update_index().await;

        let entity = self.clone();
        let mut stop = self.shared.stop.subscribe();
        tokio::spawn(async move {
            loop {
                let interval = Duration::from_secs(entity.interval().max(1) as u64);
                tokio::select! {
                    _ = stop.changed() => {
                        entity.set_status(EntityStatus::Stopped);
                        info!(sid, "strategy run stopped");
                        return;
                    }
                    () = tokio::time::sleep(interval) => {
                        entity.apply_cache();
                        let pass = AssertUnwindSafe(entity.run_once(Local::now())).catch_unwind().await;
                        if let Err(payload) = pass {
                            entity.set_status(EntityStatus::Stopped);
                            error!(sid, panic = %panic_message(payload.as_ref()), "strategy loop panicked");
                            return;
                        }
                        entity.set_status(EntityStatus::Waiting);
                    }
                }
            }
        });

        let entity = self.clone();
        let mut stop = self.shared.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    () = tokio::time::sleep(index_interval) => {
                        entity.update_index().await;
                        debug!(sid, "strategy index update finished");
                    }
                }
            }
        });
    }

    /// Asks both loops to exit. The status becomes `Stopped` once the
    /// evaluation loop has seen the request.
    pub fn stop(&self) {
        self.set_status(EntityStatus::Stopping);
        self.shared.stop.send_replace(true);
    }
}

async fn publish_events(sid: i64, publisher: &dyn EventPublisher, events: &[Event]) {
    for event in events {
        if let Err(e) = publisher.publish(event).await {
            warn!(sid, error = %e, "strategy event push failed");
            continue;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            let json = serde_json::to_string(event).unwrap_or_default();
            debug!(sid, event = %json, "strategy event pushed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::happen_strategy;
    use crate::testing::{MockPublisher, MockStorage};
    use chrono::TimeZone;
    use claw_series::Point;

    fn entity(strategy: Strategy) -> (StrategyEntity, Arc<MockStorage>, Arc<MockPublisher>) {
        let stg = Arc::new(MockStorage::default());
        let publisher = Arc::new(MockPublisher::default());
        let plan = StrategyPlan::new(strategy).unwrap();
        let e = StrategyEntity::new(plan, stg.clone(), publisher.clone());
        (e, stg, publisher)
    }

    fn two_metric_strategy() -> Strategy {
        let mut s = happen_strategy("cpu.idle", ">", 90.0, 30, 2);
        let mut mem = s.judgements[0].clone();
        mem.metric = "mem.used".to_string();
        s.judgements.push(mem);
        s
    }

    mod plan_tests {
        use super::*;

        #[test]
        fn test_valid_plan() {
            let plan = StrategyPlan::new(happen_strategy("cpu.idle", ">", 90.0, 30, 2)).unwrap();
            assert_eq!(plan.id(), 7);
            assert_eq!(plan.operator, LogicOperator::And);
            assert_eq!(plan.executions.len(), 1);
        }

        #[test]
        fn test_rejections() {
            let mut s = happen_strategy("cpu.idle", ">", 90.0, 30, 2);
            s.endpoints.clear();
            assert!(StrategyPlan::new(s).is_err());

            let mut s = happen_strategy("cpu.idle", ">", 90.0, 30, 2);
            s.judgements.clear();
            assert!(StrategyPlan::new(s).is_err());

            let mut s = happen_strategy("cpu.idle", ">", 90.0, 30, 2);
            s.operator = "xor".to_string();
            assert!(StrategyPlan::new(s).is_err());

            let mut s = happen_strategy("cpu.idle", ">", 90.0, 30, 2);
            s.judgements[0].execution.expressions.clear();
            assert!(StrategyPlan::new(s).is_err());
        }
    }

    mod helper_tests {
        use super::*;

        #[test]
        fn test_concurrency() {
            assert_eq!(concurrency_for(10, 0), 1);
            assert_eq!(concurrency_for(10, 15), 1);
            assert_eq!(concurrency_for(10, 250), 25);
            assert_eq!(concurrency_for(0, 5), 5);
        }

        #[test]
        fn test_metric_of() {
            assert_eq!(metric_of("cpu.idle&0"), "cpu.idle");
            assert_eq!(metric_of("plain"), "plain");
            assert_eq!(metric_of("a&b&1"), "a&b");
        }

        #[test]
        fn test_pairing_keeps_separator_in_metric() {
            let unit = CounterUnit { id: 1, granularity: 10 };
            let mut counters = BTreeMap::new();
            counters.insert("rx&tx&0".to_string(), BTreeMap::from([("endpoint=h1".to_string(), unit)]));
            let sets = pair_counters(&counters);
            assert_eq!(sets.len(), 1);
            assert_eq!(sets[0]["rx&tx"], unit);
        }

        #[test]
        fn test_pairing_requires_every_metric() {
            let unit = |id, granularity| CounterUnit { id, granularity };
            let mut counters = BTreeMap::new();
            counters.insert(
                "cpu&0".to_string(),
                BTreeMap::from([
                    ("endpoint=h1,core=0".to_string(), unit(1, 10)),
                    ("endpoint=h1,core=1".to_string(), unit(2, 10)),
                    ("endpoint=h1,core=2".to_string(), unit(3, 10)),
                ]),
            );
            counters.insert(
                "mem&1".to_string(),
                BTreeMap::from([
                    ("endpoint=h1,core=0".to_string(), unit(4, 10)),
                    ("endpoint=h1,core=2".to_string(), unit(5, 60)),
                ]),
            );
            let sets = pair_counters(&counters);
            assert_eq!(sets.len(), 1);
            assert_eq!(sets[0]["cpu"], unit(1, 10));
            assert_eq!(sets[0]["mem"], unit(4, 10));
        }

        #[test]
        fn test_single_metric_keeps_every_counter() {
            let mut counters = BTreeMap::new();
            counters.insert(
                "cpu&0".to_string(),
                BTreeMap::from([
                    ("endpoint=h1,core=0".to_string(), CounterUnit { id: 1, granularity: 10 }),
                    ("endpoint=h1,core=1".to_string(), CounterUnit { id: 2, granularity: 10 }),
                ]),
            );
            assert_eq!(pair_counters(&counters).len(), 2);
        }
    }

    mod index_tests {
        use super::*;

        #[tokio::test]
        async fn test_resolves_judgements() {
            let (e, stg, _) = entity(happen_strategy("cpu.idle", ">", 90.0, 30, 2));
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1", 20), ("endpoint=h1,core=1", 10), ("endpoint=h1,bad", 0)]);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 2);
            assert_eq!(e.series_count(), 2);
            assert_eq!(e.interval(), 10);
        }

        #[tokio::test]
        async fn test_multi_metric_tuple() {
            let (e, stg, _) = entity(two_metric_strategy());
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1,core=0", 10), ("endpoint=h1,core=1", 10)]);
            stg.set_counters("h1", "mem.used", &[("endpoint=h1,core=0", 10)]);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 1);
            assert_eq!(e.series_count(), 2);
        }

        #[tokio::test]
        async fn test_empty_index_resets() {
            let (e, stg, _) = entity(happen_strategy("cpu.idle", ">", 90.0, 30, 2));
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1", 60)]);
            e.update_index().await;
            assert_eq!(e.interval(), 60);

            stg.set_counters("h1", "cpu.idle", &[]);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 0);
            assert_eq!(e.series_count(), 0);
            assert_eq!(e.interval(), DEFAULT_INTERVAL);
        }

        #[tokio::test]
        async fn test_retired_series_removed() {
            let (e, stg, _) = entity(happen_strategy("cpu.idle", ">", 90.0, 30, 2));
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1,core=0", 10), ("endpoint=h1,core=1", 10)]);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 2);
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1,core=1", 10)]);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 1);
        }

        #[tokio::test]
        async fn test_index_failure_before_first_resolve() {
            let (e, stg, _) = entity(happen_strategy("cpu.idle", ">", 90.0, 30, 2));
            stg.fail_queries(true);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 0);
            assert_eq!(e.interval(), DEFAULT_INTERVAL);
        }

        #[tokio::test]
        async fn test_index_failure_keeps_judgements() {
            let (e, stg, _) = entity(happen_strategy("cpu.idle", ">", 90.0, 30, 2));
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1,core=0", 60), ("endpoint=h1,core=1", 60)]);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 2);

            stg.fail_queries(true);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 2);
            assert_eq!(e.series_count(), 2);
            assert_eq!(e.interval(), 60);
        }
    }

    mod run_tests {
        use super::*;

        #[tokio::test]
        async fn test_pass_publishes_events() {
            let (e, stg, publisher) = entity(happen_strategy("cpu.idle", ">", 90.0, 30, 2));
            let id = stg.add_series("cpu.idle", "h1", 10);
            stg.set_points(id, vec![Point::new(1_700_000_000, 95.0), Point::new(1_700_000_010, 96.0)]);
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1", 10)]);
            e.update_index().await;
            assert_eq!(e.judgement_count(), 1);

            let now = Local.timestamp_opt(1_700_000_025, 0).unwrap();
            e.run_once(now).await;
            let events = publisher.events();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].sid, 7);
            assert_eq!(events[0].etime, 1_700_000_010);
            assert_eq!(e.status(), EntityStatus::Running);
        }

        #[tokio::test]
        async fn test_recovery_survives_index_failure() {
            let t = 1_700_000_000;
            let (e, stg, publisher) = entity(happen_strategy("cpu.idle", ">", 90.0, 10, 1));
            let id = stg.add_series("cpu.idle", "h1", 10);
            stg.set_points(id, vec![Point::new(t, 95.0), Point::new(t + 10, 10.0)]);
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1", 10)]);
            e.update_index().await;
            e.run_once(Local.timestamp_opt(t + 15, 0).unwrap()).await;

            stg.fail_queries(true);
            e.update_index().await;
            stg.fail_queries(false);
            e.update_index().await;

            e.run_once(Local.timestamp_opt(t + 25, 0).unwrap()).await;
            let kinds: Vec<_> = publisher.events().iter().map(|ev| ev.event_type).collect();
            assert_eq!(kinds, vec![crate::event::EventType::Alert, crate::event::EventType::Recovery]);
        }

        #[tokio::test]
        async fn test_no_effective_execution() {
            let mut s = happen_strategy("cpu.idle", ">", 90.0, 30, 2);
            s.judgements[0].execution.effective_day = vec![];
            let (e, stg, publisher) = entity(s);
            stg.set_counters("h1", "cpu.idle", &[("endpoint=h1", 10)]);
            e.update_index().await;
            e.run_once(Local::now()).await;
            assert!(publisher.events().is_empty());
            assert_eq!(stg.query_count(), 0);
        }
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_cache_only_while_running() {
            let (e, _, _) = entity(happen_strategy("cpu.idle", ">", 90.0, 30, 2));
            let mut newer = happen_strategy("cpu.idle", ">", 80.0, 30, 2);
            newer.updated = 5;

            e.set_cache(StrategyPlan::new(newer.clone()).unwrap());
            e.apply_cache();
            assert_eq!(e.plan().strategy.updated, 0);

            e.start(Duration::from_secs(60)).await;
            assert_eq!(e.status(), EntityStatus::Starting);
            e.set_cache(StrategyPlan::new(newer).unwrap());

            let mut older = happen_strategy("cpu.idle", ">", 70.0, 30, 2);
            older.updated = 3;
            e.set_cache(StrategyPlan::new(older).unwrap());

            e.apply_cache();
            assert_eq!(e.plan().strategy.updated, 5);
            e.stop();
        }

        #[tokio::test(start_paused = true)]
        async fn test_stop_reaches_stopped() {
            let (e, _, _) = entity(happen_strategy("cpu.idle", ">", 90.0, 30, 2));
            e.start(Duration::from_secs(60)).await;
            e.stop();
            assert_eq!(e.status(), EntityStatus::Stopping);
            for _ in 0..10 {
                if e.status() == EntityStatus::Stopped {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert_eq!(e.status(), EntityStatus::Stopped);
            assert_eq!(e.summary().status, "stopped");
        }
    }
}
