//! Grouping of queued reads into coalesced downstream requests.
//!
//! A drained batch is split into [`RequestGroup`]s. Inside a group there is at
//! most one [`MergeRequest`] per series id, whose range is the union of every
//! read it absorbed. A read only joins a merge request when the combined range
//! stays within `merge_size` granularities; otherwise it moves on to the next
//! group. Each group becomes one downstream call.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::query::QueryData;
use crate::types::Point;

/// A single queued read waiting for downstream data.
#[derive(Debug)]
pub struct QueryRequest {
    /// Series id.
    pub id: u32,
    /// Span of the history the result is written to.
    pub span: i64,
    /// Series granularity, used to size the merge window.
    pub granularity: i64,
    /// The downstream query for this read alone.
    pub data: QueryData,
    done: oneshot::Sender<Vec<Point>>,
}

impl QueryRequest {
    /// Creates a request and the receiver its waiter listens on.
    #[must_use]
    pub fn new(
        id: u32,
        span: i64,
        granularity: i64,
        data: QueryData,
    ) -> (Self, oneshot::Receiver<Vec<Point>>) {
        let (done, rx) = oneshot::channel();
        (
            Self {
                id,
                span,
                granularity,
                data,
                done,
            },
            rx,
        )
    }

    /// Wakes the waiter. A waiter that already gave up is ignored.
    pub fn finish(self, points: Vec<Point>) {
        let _ = self.done.send(points);
    }
}

/// Reads of one series merged into a single downstream range.
#[derive(Debug)]
pub struct MergeRequest {
    requests: Vec<QueryRequest>,
    start: i64,
    end: i64,
    granularity: i64,
}

impl MergeRequest {
    fn new(req: QueryRequest) -> Self {
        Self {
            start: req.data.start,
            end: req.data.end,
            granularity: req.granularity,
            requests: vec![req],
        }
    }

    /// Absorbs `req` if the union stays inside the merge window, otherwise hands it back.
    fn merge(&mut self, req: QueryRequest, window_by_granularity: i64) -> Result<(), QueryRequest> {
        let window = window_by_granularity * self.granularity;
        let (start, end) = (req.data.start, req.data.end);
        if end - self.start <= window && self.end - start <= window && end - start <= window {
            self.start = self.start.min(start);
            self.end = self.end.max(end);
            self.requests.push(req);
            return Ok(());
        }
        Err(req)
    }

    /// Returns the merged `(start, end)` range.
    #[must_use]
    pub const fn range(&self) -> (i64, i64) {
        (self.start, self.end)
    }

    /// Returns the absorbed reads.
    #[must_use]
    pub fn requests(&self) -> &[QueryRequest] {
        &self.requests
    }

    /// Builds the downstream query covering every absorbed read.
    #[must_use]
    pub fn derive_query(&self) -> Option<QueryData> {
        let first = self.requests.first()?;
        Some(QueryData {
            start: self.start,
            end: self.end,
            ..first.data.clone()
        })
    }

    /// Consumes the merge request, yielding its reads.
    #[must_use]
    pub fn into_requests(self) -> Vec<QueryRequest> {
        self.requests
    }
}

/// One downstream call worth of merged reads.
#[derive(Debug, Default)]
pub struct RequestGroup {
    merged: HashMap<u32, MergeRequest>,
    lookup: HashMap<String, u32>,
}

impl RequestGroup {
    fn merge(&mut self, req: QueryRequest, window_by_granularity: i64) -> Result<(), QueryRequest> {
        match self.merged.get_mut(&req.id) {
            Some(mr) => mr.merge(req, window_by_granularity),
            None => {
                self.lookup.insert(req.data.key(), req.id);
                self.merged.insert(req.id, MergeRequest::new(req));
                Ok(())
            }
        }
    }

    /// Returns the number of merged series.
    #[must_use]
    pub fn len(&self) -> usize {
        self.merged.len()
    }

    /// Returns true if the group holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Returns the series id answered by a response key.
    #[must_use]
    pub fn id_of(&self, key: &str) -> Option<u32> {
        self.lookup.get(key).copied()
    }

    /// Returns the merge request of a series.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&MergeRequest> {
        self.merged.get(&id)
    }

    /// Removes and returns the merge request of a series.
    pub fn take(&mut self, id: u32) -> Option<MergeRequest> {
        self.merged.remove(&id)
    }

    /// Returns one downstream query per merged series.
    #[must_use]
    pub fn queries(&self) -> Vec<QueryData> {
        self.merged.values().filter_map(MergeRequest::derive_query).collect()
    }

    /// Drains every remaining merge request.
    pub fn drain(&mut self) -> impl Iterator<Item = MergeRequest> + '_ {
        self.merged.drain().map(|(_, mr)| mr)
    }
}

/// Splits a drained batch into groups of coalesced reads.
#[must_use]
pub fn group_requests(requests: Vec<QueryRequest>, window_by_granularity: i64) -> Vec<RequestGroup> {
    let mut groups = vec![RequestGroup::default()];
    'next: for req in requests {
        let mut req = req;
        for group in &mut groups {
            match group.merge(req, window_by_granularity) {
                Ok(()) => continue 'next,
                Err(back) => req = back,
            }
        }
        let mut group = RequestGroup::default();
        // A fresh group always accepts.
        let _ = group.merge(req, window_by_granularity);
        groups.push(group);
    }
    groups
}
