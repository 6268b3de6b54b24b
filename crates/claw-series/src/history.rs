//! Per-series point histories.
//!
//! Two shapes share the [`History`] contract:
//! - [`RingHistory`]: a fixed-capacity ring of the newest points of a series,
//!   used by the storage buffer to answer range reads without a downstream call.
//!   Points only ever append forward in time; the oldest slot is overwritten
//!   when the ring is full. Missing or non-finite values are never stored.
//! - [`ChainHistory`]: a bounded, sorted list of evidence points kept by a
//!   judgement. Every write is tagged with a new batch number so that
//!   [`History::cleanup`] can drop everything but the latest batch.

use crate::types::Point;

/// Common contract of point histories.
pub trait History: Send + Sync {
    /// Returns the span tag (retention class) of this history.
    fn span(&self) -> i64;

    /// Returns the capacity.
    fn size(&self) -> usize;

    /// Grows the capacity. Shrinking is ignored.
    fn set_size(&mut self, size: usize);

    /// Returns a copy of every stored point, oldest first.
    fn dump(&self) -> Vec<Point>;

    /// Drops points that are no longer relevant.
    fn cleanup(&mut self);

    /// Drops every point.
    fn reset(&mut self);

    /// Returns the newest point.
    fn last(&self) -> Option<Point>;

    /// Returns points with `start <= timestamp <= end`, oldest first.
    fn read(&self, start: i64, end: i64) -> Vec<Point>;

    /// Stores a batch of points.
    fn write(&mut self, points: &[Point]);
}

// ============ Ring ============

/// Fixed-capacity ring of the newest points of one series.
#[derive(Debug, Clone)]
pub struct RingHistory {
    span: i64,
    granularity: i64,
    data: Vec<Point>,
    /// Inclusive `(start, end)` slot indexes, `None` while empty.
    bounds: Option<(usize, usize)>,
}

impl RingHistory {
    /// Creates an empty ring with `size` slots (at least one).
    #[must_use]
    pub fn new(size: usize, span: i64, granularity: i64) -> Self {
        let size = size.max(1);
        Self {
            span,
            granularity,
            data: vec![Point::new(0, 0.0); size],
            bounds: None,
        }
    }

    /// Returns the granularity of the buffered series.
    #[must_use]
    pub const fn granularity(&self) -> i64 {
        self.granularity
    }

    /// Returns the number of stored points.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.bounds {
            None => 0,
            Some((start, end)) if end >= start => end - start + 1,
            Some((start, end)) => self.data.len() - start + end + 1,
        }
    }

    /// Returns true if the ring holds no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    fn iter(&self) -> impl Iterator<Item = &Point> {
        let size = self.data.len();
        let (start, len) = match self.bounds {
            None => (0, 0),
            Some((start, _)) => (start, self.len()),
        };
        (0..len).map(move |i| &self.data[(start + i) % size])
    }

    fn push(&mut self, point: Point) {
        let size = self.data.len();
        match self.bounds {
            None => {
                self.data[0] = point;
                self.bounds = Some((0, 0));
            }
            Some((start, end)) => {
                let next = (end + 1) % size;
                let start = if next == start { (start + 1) % size } else { start };
                self.data[next] = point;
                self.bounds = Some((start, next));
            }
        }
    }
}

impl History for RingHistory {
    fn span(&self) -> i64 {
        self.span
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn set_size(&mut self, size: usize) {
        if self.data.len() >= size {
            return;
        }
        self.data = vec![Point::new(0, 0.0); size];
        self.bounds = None;
    }

    fn dump(&self) -> Vec<Point> {
        self.iter().copied().collect()
    }

    fn cleanup(&mut self) {}

    fn reset(&mut self) {
        self.bounds = None;
    }

    fn last(&self) -> Option<Point> {
        self.bounds.map(|(_, end)| self.data[end])
    }

    fn read(&self, start: i64, end: i64) -> Vec<Point> {
        self.iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .copied()
            .collect()
    }

    fn write(&mut self, points: &[Point]) {
        let mut batch: Vec<Point> = points.iter().filter(|p| p.is_valid()).copied().collect();
        if batch.is_empty() {
            return;
        }
        batch.sort_by_key(|p| p.timestamp);

        // The newest point of the batch is already buffered: nothing new here.
        if let (Some(last), Some(newest)) = (self.last(), batch.last()) {
            if last.timestamp == newest.timestamp {
                return;
            }
        }

        for point in batch {
            if point.timestamp == 0 {
                continue;
            }
            match self.last() {
                Some(last) if point.timestamp <= last.timestamp => {}
                _ => self.push(point),
            }
        }
    }
}

// ============ Chain ============

#[derive(Debug, Clone, Copy)]
struct ChainNode {
    point: Point,
    batch: u32,
}

/// Bounded sorted evidence list with batch tagging.
///
/// Owned by exactly one judgement, so it carries no lock.
#[derive(Debug, Clone, Default)]
pub struct ChainHistory {
    nodes: Vec<ChainNode>,
    batch: u32,
    size: usize,
}

impl ChainHistory {
    /// Creates an empty chain holding at most `size` points.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            nodes: Vec::new(),
            batch: 0,
            size,
        }
    }

    /// Returns the number of stored points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the chain holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the current batch number.
    #[must_use]
    pub const fn batch(&self) -> u32 {
        self.batch
    }
}

impl History for ChainHistory {
    fn span(&self) -> i64 {
        0
    }

    fn size(&self) -> usize {
        self.size
    }

    fn set_size(&mut self, size: usize) {
        if self.size < size {
            self.size = size;
        }
    }

    fn dump(&self) -> Vec<Point> {
        self.nodes.iter().map(|n| n.point).collect()
    }

    fn cleanup(&mut self) {
        let batch = self.batch;
        self.nodes.retain(|n| n.batch == batch);
    }

    fn reset(&mut self) {
        self.nodes.clear();
    }

    fn last(&self) -> Option<Point> {
        self.nodes.last().map(|n| n.point)
    }

    fn read(&self, start: i64, end: i64) -> Vec<Point> {
        self.nodes
            .iter()
            .filter(|n| n.point.timestamp >= start && n.point.timestamp <= end)
            .map(|n| n.point)
            .collect()
    }

    fn write(&mut self, points: &[Point]) {
        if self.size == 0 || points.is_empty() {
            return;
        }

        self.batch = self.batch.wrapping_add(1);
        for point in points {
            match self
                .nodes
                .binary_search_by_key(&point.timestamp, |n| n.point.timestamp)
            {
                Ok(pos) => {
                    self.nodes[pos].point.value = point.value;
                    self.nodes[pos].batch = self.batch;
                }
                Err(pos) => {
                    self.nodes.insert(
                        pos,
                        ChainNode {
                            point: *point,
                            batch: self.batch,
                        },
                    );
                    if self.nodes.len() > self.size {
                        let excess = self.nodes.len() - self.size;
                        self.nodes.drain(..excess);
                    }
                }
            }
        }
    }
}
