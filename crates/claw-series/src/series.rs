//! Series identity.
//!
//! A [`Series`] is one concrete metric time line: a metric name, its tag set
//! (always including `endpoint`), the sample granularity and the value type.
//! The canonical identity is the counter string built from the metric and the
//! sorted non-endpoint tags.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeriesError};
use crate::types::{COUNTER_SEPARATOR, ENDPOINT_KEY};

/// One metric time line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    /// Dense id assigned by the shard set, `0` until assigned.
    pub id: u32,
    /// Metric name.
    pub metric: String,
    /// All tags, including `endpoint`.
    pub tags: BTreeMap<String, String>,
    /// `metric` or `metric/k=v,k=v` with sorted keys, endpoint excluded.
    pub counter: String,
    /// Sample interval in seconds.
    pub granularity: i64,
    /// Value type reported by the index.
    pub dstype: String,
}

impl Series {
    /// Creates a new series with an unassigned id.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::InvalidSeries` if the tag set is empty or has no
    /// `endpoint` entry.
    pub fn new(
        metric: impl Into<String>,
        tags: BTreeMap<String, String>,
        granularity: i64,
        dstype: impl Into<String>,
    ) -> Result<Self> {
        if tags.is_empty() {
            return Err(SeriesError::InvalidSeries {
                reason: "empty tags".to_string(),
            });
        }
        if !tags.contains_key(ENDPOINT_KEY) {
            return Err(SeriesError::InvalidSeries {
                reason: "empty endpoint".to_string(),
            });
        }

        let metric = metric.into();
        let sorted = sorted_tag_string(&tags);
        let counter = if sorted.is_empty() {
            metric.clone()
        } else {
            format!("{metric}{COUNTER_SEPARATOR}{sorted}")
        };

        Ok(Self {
            id: 0,
            metric,
            tags,
            counter,
            granularity,
            dstype: dstype.into(),
        })
    }

    /// Returns the endpoint tag value.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.tags.get(ENDPOINT_KEY).map_or("", String::as_str)
    }

    /// Returns the stable key `counter/endpoint/granularity/dstype`.
    ///
    /// The key never contains the id, which may change across restarts.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.counter,
            self.endpoint(),
            self.granularity,
            self.dstype,
            sep = COUNTER_SEPARATOR
        )
    }

    /// Returns true if both describe the same time line, ignoring the id.
    #[must_use]
    pub fn same_line(&self, other: &Self) -> bool {
        self.metric == other.metric
            && self.granularity == other.granularity
            && self.dstype == other.dstype
            && self.tags.len() == other.tags.len()
            && self.counter == other.counter
            && self.endpoint() == other.endpoint()
    }
}

/// Joins the non-endpoint tags as `k=v` pairs sorted by key.
#[must_use]
pub fn sorted_tag_string(tags: &BTreeMap<String, String>) -> String {
    tags.iter()
        .filter(|(k, _)| k.as_str() != ENDPOINT_KEY)
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses an index counter string such as `endpoint=host,dir=/home` into a tag map.
///
/// Spaces are stripped; fragments without `=` are ignored.
#[must_use]
pub fn counter_to_tags(counter: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    if counter.is_empty() {
        return tags;
    }
    let counter: String = counter.chars().filter(|c| *c != ' ').collect();
    for pair in counter.split(',') {
        if let Some((k, v)) = pair.split_once('=') {
            tags.insert(k.to_string(), v.to_string());
        }
    }
    tags
}
