//! Request/response contracts of the remote query and index services.
//!
//! The storage buffer never talks to the network directly; it goes through a
//! [`SeriesQuery`] implementation. [`crate::remote::HttpSeriesQuery`] is the
//! production one, tests plug in in-memory fakes.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeriesError};
use crate::series::Series;
use crate::types::{COUNTER_SEPARATOR, Point};

/// Consolidation function requested from the backend.
pub const CONSOL_AVERAGE: &str = "AVERAGE";

/// Resolves tag filters of one metric on one endpoint to concrete counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Endpoints to search.
    pub endpoints: Vec<String>,
    /// Metric name.
    pub metric: String,
    /// Tag values that must match (`tagk -> [tagv]`).
    pub include: BTreeMap<String, Vec<String>>,
    /// Tag values that must not match.
    pub exclude: BTreeMap<String, Vec<String>>,
}

impl IndexRequest {
    /// Creates an index request for a single endpoint.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        metric: impl Into<String>,
        include: BTreeMap<String, Vec<String>>,
        exclude: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            metric: metric.into(),
            include,
            exclude,
        }
    }
}

/// One counter found by the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Tag string including the `endpoint=` pair, e.g. `endpoint=h1,mount=/`.
    pub counter: String,
    /// Sample interval in seconds.
    pub step: i64,
    /// Value type.
    pub dstype: String,
}

/// One record of a batched data query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryData {
    /// Range start, unix seconds.
    pub start: i64,
    /// Range end, unix seconds.
    pub end: i64,
    /// Consolidation function.
    #[serde(rename = "consolFunc")]
    pub consol_func: String,
    /// Endpoints to read.
    pub endpoints: Vec<String>,
    /// Counters to read.
    pub counters: Vec<String>,
    /// Sample interval in seconds.
    pub step: i64,
    /// Value type.
    pub dstype: String,
}

impl QueryData {
    /// Builds the query record for one series.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::InvalidRange` unless `0 <= start < end`.
    pub fn for_series(series: &Series, start: i64, end: i64) -> Result<Self> {
        if end <= start || start < 0 {
            return Err(SeriesError::InvalidRange { start, end });
        }
        Ok(Self {
            start,
            end,
            consol_func: CONSOL_AVERAGE.to_string(),
            endpoints: vec![series.endpoint().to_string()],
            counters: vec![series.counter.clone()],
            step: series.granularity,
            dstype: series.dstype.clone(),
        })
    }

    /// Returns the key matching [`Series::key`] of the queried series.
    #[must_use]
    pub fn key(&self) -> String {
        series_key(
            self.counters.first().map_or("", String::as_str),
            self.endpoints.first().map_or("", String::as_str),
            self.step,
            &self.dstype,
        )
    }
}

/// Data returned for one queried series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Returned range start.
    #[serde(default)]
    pub start: i64,
    /// Returned range end.
    #[serde(default)]
    pub end: i64,
    /// Endpoint of the series.
    pub endpoint: String,
    /// Counter of the series.
    pub counter: String,
    /// Value type.
    #[serde(default)]
    pub dstype: String,
    /// Sample interval in seconds.
    #[serde(default)]
    pub step: i64,
    /// Samples, oldest first.
    #[serde(default)]
    pub values: Vec<Point>,
}

impl QueryResponse {
    /// Returns the key matching [`Series::key`] of the answered series.
    #[must_use]
    pub fn key(&self) -> String {
        series_key(&self.counter, &self.endpoint, self.step, &self.dstype)
    }
}

fn series_key(counter: &str, endpoint: &str, step: i64, dstype: &str) -> String {
    format!("{counter}{COUNTER_SEPARATOR}{endpoint}{COUNTER_SEPARATOR}{step}{COUNTER_SEPARATOR}{dstype}")
}

/// Remote query and index service.
pub trait SeriesQuery: Send + Sync {
    /// Reads a batch of series ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend call fails.
    fn query<'a>(&'a self, requests: Vec<QueryData>) -> BoxFuture<'a, Result<Vec<QueryResponse>>>;

    /// Resolves tag filters to counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the index call fails.
    fn index<'a>(&'a self, request: &'a IndexRequest) -> BoxFuture<'a, Result<Vec<Counter>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> Series {
        let mut tags = BTreeMap::new();
        tags.insert("endpoint".to_string(), "h1".to_string());
        tags.insert("mount".to_string(), "/".to_string());
        Series::new("disk.used", tags, 10, "GAUGE").unwrap()
    }

    #[test]
    fn test_query_data_for_series() {
        let q = QueryData::for_series(&series(), 100, 200).unwrap();
        assert_eq!(q.consol_func, "AVERAGE");
        assert_eq!(q.endpoints, vec!["h1".to_string()]);
        assert_eq!(q.counters, vec!["disk.used/mount=/".to_string()]);
        assert_eq!(q.step, 10);
    }

    #[test]
    fn test_query_data_rejects_bad_range() {
        assert!(QueryData::for_series(&series(), 200, 200).is_err());
        assert!(QueryData::for_series(&series(), 200, 100).is_err());
        assert!(QueryData::for_series(&series(), -1, 100).is_err());
    }

    #[test]
    fn test_keys_match_series_key() {
        let s = series();
        let q = QueryData::for_series(&s, 100, 200).unwrap();
        assert_eq!(q.key(), s.key());

        let resp = QueryResponse {
            start: 100,
            end: 200,
            endpoint: "h1".to_string(),
            counter: s.counter.clone(),
            dstype: "GAUGE".to_string(),
            step: 10,
            values: vec![],
        };
        assert_eq!(resp.key(), s.key());
    }

    #[test]
    fn test_query_data_wire_names() {
        let q = QueryData::for_series(&series(), 100, 200).unwrap();
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["consolFunc"], "AVERAGE");
        assert_eq!(json["dstype"], "GAUGE");
    }

    #[test]
    fn test_index_request_single_endpoint() {
        let req = IndexRequest::new("h1", "cpu.idle", BTreeMap::new(), BTreeMap::new());
        assert_eq!(req.endpoints, vec!["h1".to_string()]);
        assert_eq!(req.metric, "cpu.idle");
    }
}
