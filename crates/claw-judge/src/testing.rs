//! In-memory doubles shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use claw_series::{Counter, IndexRequest, Point, Series, SeriesError, Storage};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::event::Event;
use crate::publish::EventPublisher;

/// Storage answering from fixed point lists.
#[derive(Default)]
pub(crate) struct MockStorage {
    series: Mutex<HashMap<u32, Arc<Series>>>,
    ids: Mutex<HashMap<String, u32>>,
    created: AtomicU32,
    touched: Mutex<HashMap<u32, Instant>>,
    points: Mutex<HashMap<u32, Vec<Point>>>,
    counters: Mutex<HashMap<(String, String), Vec<Counter>>>,
    fail: AtomicBool,
    queries: AtomicUsize,
}

impl MockStorage {
    /// Registers `metric` on `endpoint` without extra tags.
    pub fn add_series(&self, metric: &str, endpoint: &str, granularity: i64) -> u32 {
        let mut tags = BTreeMap::new();
        tags.insert("endpoint".to_string(), endpoint.to_string());
        let series = Series::new(metric, tags, granularity, "GAUGE").unwrap();
        self.generate_and_set(series, 10, &[0])
    }

    pub fn set_points(&self, id: u32, points: Vec<Point>) {
        self.points.lock().insert(id, points);
    }

    /// Makes `index` return `counters` for `(endpoint, metric)`.
    pub fn set_counters(&self, endpoint: &str, metric: &str, counters: &[(&str, i64)]) {
        let counters = counters
            .iter()
            .map(|(c, step)| Counter {
                counter: (*c).to_string(),
                step: *step,
                dstype: "GAUGE".to_string(),
            })
            .collect();
        self.counters
            .lock()
            .insert((endpoint.to_string(), metric.to_string()), counters);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Storage for MockStorage {
    fn query<'a>(
        &'a self,
        id: u32,
        start: i64,
        end: i64,
        _span: i64,
    ) -> BoxFuture<'a, claw_series::Result<Vec<Point>>> {
        Box::pin(async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SeriesError::Downstream {
                    reason: "mock failure".to_string(),
                });
            }
            if !self.series.lock().contains_key(&id) {
                return Err(SeriesError::IndexNotFound { id });
            }
            Ok(self
                .points
                .lock()
                .get(&id)
                .map(|ps| {
                    ps.iter()
                        .filter(|p| p.timestamp >= start && p.timestamp <= end)
                        .copied()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn index<'a>(&'a self, request: &'a IndexRequest) -> BoxFuture<'a, claw_series::Result<Vec<Counter>>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SeriesError::Downstream {
                    reason: "mock failure".to_string(),
                });
            }
            let endpoint = request.endpoints.first().cloned().unwrap_or_default();
            Ok(self
                .counters
                .lock()
                .get(&(endpoint, request.metric.clone()))
                .cloned()
                .unwrap_or_default())
        })
    }

    fn generate_and_set(&self, mut series: Series, _size: usize, _spans: &[i64]) -> u32 {
        let mut ids = self.ids.lock();
        let id = *ids
            .entry(series.key())
            .or_insert_with(|| self.created.fetch_add(1, Ordering::SeqCst) + 1);
        series.id = id;
        self.series.lock().insert(id, Arc::new(series));
        self.touched.lock().insert(id, Instant::now());
        id
    }

    fn get(&self, id: u32) -> Option<Arc<Series>> {
        self.series.lock().get(&id).cloned()
    }

    fn retire(&self, live: &HashSet<u32>, before: Instant) -> usize {
        let mut touched = self.touched.lock();
        let stale: Vec<u32> = touched
            .iter()
            .filter(|(id, at)| !live.contains(id) && **at < before)
            .map(|(id, _)| *id)
            .collect();
        let mut series = self.series.lock();
        for id in &stale {
            touched.remove(id);
            if let Some(s) = series.remove(id) {
                self.ids.lock().remove(&s.key());
            }
        }
        stale.len()
    }
}

/// Publisher collecting events in memory.
#[derive(Default)]
pub(crate) struct MockPublisher {
    events: Mutex<Vec<Event>>,
    closed: AtomicBool,
}

impl MockPublisher {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EventPublisher for MockPublisher {
    fn publish<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.events.lock().push(event.clone());
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
        })
    }
}
