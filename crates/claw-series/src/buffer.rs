//! Storage buffer and query coalescer.
//!
//! [`StorageBuffer`] is the single storage entry point of the evaluation core:
//! - it issues series ids through a [`ShardSet`];
//! - it keeps one [`RingHistory`] per series and span;
//! - it answers range reads from the ring when the ring already covers the
//!   range, and otherwise queues the read for a background dispatcher.
//!
//! The dispatcher drains the queue in batches (up to `batch` reads or a
//! `dequeue_timeout` of silence), coalesces overlapping reads of the same
//! series, and runs each batch under a bounded concurrency limit. Responses are
//! written into the ring before waiters are woken, so a waiter that already
//! timed out still leaves the data behind for the next read.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::coalesce::{QueryRequest, RequestGroup, group_requests};
use crate::error::{Result, SeriesError};
use crate::history::{History, RingHistory};
use crate::query::{Counter, IndexRequest, QueryData, SeriesQuery};
use crate::series::Series;
use crate::shard::ShardSet;
use crate::types::Point;

/// Storage seen by triggers and entities.
pub trait Storage: Send + Sync {
    /// Returns the points of series `id` within `[start, end]` from the history of `span`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown ids, missing spans, malformed ranges and timeouts.
    fn query<'a>(&'a self, id: u32, start: i64, end: i64, span: i64)
    -> BoxFuture<'a, Result<Vec<Point>>>;

    /// Resolves tag filters to counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the index service fails.
    fn index<'a>(&'a self, request: &'a IndexRequest) -> BoxFuture<'a, Result<Vec<Counter>>>;

    /// Assigns (or looks up) the id of `series` and makes sure it has buffers of
    /// at least `size` points for every span in `spans`.
    fn generate_and_set(&self, series: Series, size: usize, spans: &[i64]) -> u32;

    /// Returns the series registered under `id`.
    fn get(&self, id: u32) -> Option<Arc<Series>>;

    /// Drops every series outside `live` that was last registered before
    /// `before`, together with its buffers and id. Returns how many went.
    fn retire(&self, live: &HashSet<u32>, before: Instant) -> usize;
}

/// Tuning of the storage buffer. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageBufferConfig {
    /// How long a queued read waits for the dispatcher.
    pub query_timeout_ms: u64,
    /// How long a read may wait for queue space.
    pub enqueue_timeout_ms: u64,
    /// Silence after which a partial batch is dispatched.
    pub dequeue_timeout_ms: u64,
    /// Overall deadline of one read.
    pub queued_query_timeout_ms: u64,
    /// Capacity of the read queue.
    pub queue_size: usize,
    /// Maximum batches in flight downstream.
    pub concurrency: usize,
    /// Maximum reads per batch.
    pub batch: usize,
    /// Merge window in multiples of the series granularity.
    pub merge_size: i64,
    /// Number of shards of the id map.
    pub shardset_size: usize,
    /// Minimum ring capacity.
    pub history_size: usize,
}

impl Default for StorageBufferConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 1500,
            enqueue_timeout_ms: 200,
            dequeue_timeout_ms: 500,
            queued_query_timeout_ms: 2200,
            queue_size: 10_000,
            concurrency: 10,
            batch: 10,
            merge_size: 30,
            shardset_size: 10,
            history_size: 5,
        }
    }
}

impl StorageBufferConfig {
    fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    fn queued_query_timeout(&self) -> Duration {
        Duration::from_millis(self.queued_query_timeout_ms)
    }
}

type SharedRing = Arc<RwLock<RingHistory>>;

/// Buffers of one series.
#[derive(Debug)]
struct SeriesBuffer {
    series: Arc<Series>,
    data: Vec<SharedRing>,
    touched: Instant,
}

impl SeriesBuffer {
    fn new(series: Series, size: usize, spans: &[i64]) -> Self {
        let data = spans
            .iter()
            .map(|span| Arc::new(RwLock::new(RingHistory::new(size, *span, series.granularity))))
            .collect();
        Self {
            series: Arc::new(series),
            data,
            touched: Instant::now(),
        }
    }

    fn history(&self, span: i64) -> Option<SharedRing> {
        self.data.iter().find(|h| h.read().span() == span).cloned()
    }
}

struct Inner {
    config: StorageBufferConfig,
    buffers: RwLock<HashMap<u32, SeriesBuffer>>,
    shards: ShardSet,
    downstream: Arc<dyn SeriesQuery>,
}

impl Inner {
    fn lookup(&self, id: u32, span: i64) -> Result<(Arc<Series>, SharedRing)> {
        let buffers = self.buffers.read();
        let buffer = buffers.get(&id).ok_or(SeriesError::IndexNotFound { id })?;
        if buffer.data.is_empty() {
            return Err(SeriesError::HistoryEmpty { id });
        }
        let history = buffer
            .history(span)
            .ok_or(SeriesError::SpanNotMatched { id, span })?;
        Ok((Arc::clone(&buffer.series), history))
    }

    /// Runs one drained batch against the downstream service.
    async fn execute(&self, requests: Vec<QueryRequest>) {
        let groups = group_requests(requests, self.config.merge_size);
        for group in groups {
            self.execute_group(group).await;
        }
    }

    async fn execute_group(&self, mut group: RequestGroup) {
        let queries = group.queries();
        if !queries.is_empty() {
            debug!(series = group.len(), "storage query downstream");
            match self.downstream.query(queries).await {
                Ok(responses) => {
                    for resp in responses {
                        let key = resp.key();
                        let Some(id) = group.id_of(&key) else {
                            error!(key = %key, "storage query response matches no request");
                            continue;
                        };
                        if let Some(mr) = group.take(id) {
                            self.finish(id, mr.into_requests(), resp.values);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "storage query downstream failed"),
            }
        }

        // Whatever was not answered still gets woken, with no data.
        for mr in group.drain() {
            for req in mr.into_requests() {
                req.finish(Vec::new());
            }
        }
    }

    fn finish(&self, id: u32, requests: Vec<QueryRequest>, points: Vec<Point>) {
        if !points.is_empty() {
            let spans: BTreeSet<i64> = requests.iter().map(|r| r.span).collect();
            for span in spans {
                match self.lookup(id, span) {
                    Ok((_, history)) => history.write().write(&points),
                    Err(e) => warn!(series = id, error = %e, "storage query write back skipped"),
                }
            }
        }
        for req in requests {
            req.finish(points.clone());
        }
    }
}

/// Cache of recent series data in front of the remote time-series service.
pub struct StorageBuffer {
    inner: Arc<Inner>,
    queue: mpsc::Sender<QueryRequest>,
}

impl std::fmt::Debug for StorageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBuffer")
            .field("config", &self.inner.config)
            .field("series", &self.len())
            .finish_non_exhaustive()
    }
}

impl StorageBuffer {
    /// Creates the buffer and spawns its dispatcher on the current tokio runtime.
    ///
    /// The dispatcher stops once the buffer is dropped.
    #[must_use]
    pub fn new(config: StorageBufferConfig, downstream: Arc<dyn SeriesQuery>) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_size.max(1));
        let inner = Arc::new(Inner {
            shards: ShardSet::new(config.shardset_size),
            buffers: RwLock::new(HashMap::new()),
            config,
            downstream,
        });
        tokio::spawn(dispatch(Arc::clone(&inner), rx));
        Self { inner, queue }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StorageBufferConfig {
        &self.inner.config
    }

    /// Returns the number of buffered series.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.buffers.read().len()
    }

    /// Returns true if no series is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers buffers for an id-assigned series.
    pub fn set(&self, series: Series, size: usize, spans: &[i64]) {
        if series.id == 0 || spans.is_empty() {
            return;
        }
        let size = size.max(self.inner.config.history_size);
        let mut buffers = self.inner.buffers.write();
        match buffers.get_mut(&series.id) {
            None => {
                buffers.insert(series.id, SeriesBuffer::new(series, size, spans));
            }
            Some(buffer) => {
                let granularity = series.granularity;
                buffer.series = Arc::new(series);
                buffer.touched = Instant::now();
                let mut known = BTreeSet::new();
                for history in &buffer.data {
                    let mut history = history.write();
                    history.set_size(size);
                    known.insert(history.span());
                }
                for span in spans.iter().filter(|s| !known.contains(s)) {
                    buffer
                        .data
                        .push(Arc::new(RwLock::new(RingHistory::new(size, *span, granularity))));
                }
            }
        }
    }

    async fn queued_query(&self, id: u32, start: i64, end: i64, span: i64) -> Result<Vec<Point>> {
        if start > end {
            return Err(SeriesError::InvalidRange { start, end });
        }
        let (series, history) = self.inner.lookup(id, span)?;

        let cached = history.read().read(start, end);
        if let (Some(first), Some(last)) = (cached.first(), cached.last()) {
            if first.timestamp == start && last.timestamp == end {
                return Ok(cached);
            }
        }
        // The ring starts after `start`: its content cannot be merged with the answer.
        let too_early = cached.first().is_none_or(|p| p.timestamp > start);

        let data = QueryData::for_series(&series, start, end)?;
        let (req, rx) = QueryRequest::new(id, span, series.granularity, data);
        self.queue
            .send_timeout(req, self.inner.config.enqueue_timeout())
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SeriesError::QueryTimeout,
                SendTimeoutError::Closed(_) => SeriesError::QueueClosed,
            })?;

        let points = tokio::time::timeout(self.inner.config.query_timeout(), rx)
            .await
            .map_err(|_| SeriesError::QueryTimeout)?
            .map_err(|_| SeriesError::Downstream {
                reason: "query abandoned by dispatcher".to_string(),
            })?;

        if points.is_empty() {
            return Ok(points);
        }
        if too_early {
            return Ok(points
                .into_iter()
                .filter(|p| p.timestamp >= start && p.timestamp <= end)
                .collect());
        }
        // The dispatcher already merged the answer into the ring.
        Ok(history.read().read(start, end))
    }
}

impl Storage for StorageBuffer {
    fn query<'a>(
        &'a self,
        id: u32,
        start: i64,
        end: i64,
        span: i64,
    ) -> BoxFuture<'a, Result<Vec<Point>>> {
        Box::pin(async move {
            tokio::time::timeout(
                self.inner.config.queued_query_timeout(),
                self.queued_query(id, start, end, span),
            )
            .await
            .map_err(|_| SeriesError::QueryTimeout)?
        })
    }

    fn index<'a>(&'a self, request: &'a IndexRequest) -> BoxFuture<'a, Result<Vec<Counter>>> {
        self.inner.downstream.index(request)
    }

    fn generate_and_set(&self, mut series: Series, size: usize, spans: &[i64]) -> u32 {
        let id = self.inner.shards.put(&mut series);
        self.set(series, size, spans);
        id
    }

    fn get(&self, id: u32) -> Option<Arc<Series>> {
        self.inner
            .buffers
            .read()
            .get(&id)
            .map(|b| Arc::clone(&b.series))
    }

    fn retire(&self, live: &HashSet<u32>, before: Instant) -> usize {
        let mut buffers = self.inner.buffers.write();
        let stale: Vec<u32> = buffers
            .iter()
            .filter(|(id, b)| !live.contains(id) && b.touched < before)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(buffer) = buffers.remove(id) {
                self.inner.shards.remove(&buffer.series);
            }
        }
        if !stale.is_empty() {
            debug!(retired = stale.len(), remaining = buffers.len(), "storage series retired");
        }
        stale.len()
    }
}

/// Renders a caught panic payload for logging.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn dispatch(inner: Arc<Inner>, mut rx: mpsc::Receiver<QueryRequest>) {
    let limiter = Arc::new(Semaphore::new(inner.config.concurrency.max(1)));
    let batch = inner.config.batch.max(1);
    loop {
        let mut requests = Vec::with_capacity(batch);
        let mut closed = false;
        while requests.len() < batch {
            match tokio::time::timeout(inner.config.dequeue_timeout(), rx.recv()).await {
                Ok(Some(req)) => requests.push(req),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if !requests.is_empty() {
            let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                break;
            };
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(payload) = AssertUnwindSafe(inner.execute(requests))
                    .catch_unwind()
                    .await
                {
                    error!(
                        panic = %panic_message(payload.as_ref()),
                        backtrace = %std::backtrace::Backtrace::force_capture(),
                        "storage query batch panicked"
                    );
                }
            });
        }

        if closed {
            break;
        }
    }
    debug!("storage query dispatcher stopped");
}
