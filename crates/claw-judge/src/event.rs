//! Alert and recovery events.
//!
//! An [`Event`] is assembled by a judgement once its driver decides to emit:
//! the evidence of every member series is attached with [`Event::set_points`]
//! in series-key order, then [`Event::finalize`] derives the hash id, the JSON
//! detail and the display value. The event is not modified afterwards.

use std::collections::BTreeMap;

use claw_series::{ENDPOINT_KEY, Point};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::types::EventCode;

/// Kind of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// The condition started to hold.
    #[serde(rename = "alert")]
    Alert,
    /// The condition stopped holding.
    #[serde(rename = "recovery")]
    Recovery,
}

impl EventType {
    /// Maps a driver decision to an event type. `Null` emits nothing.
    #[must_use]
    pub const fn from_code(code: EventCode) -> Option<Self> {
        match code {
            EventCode::Alert => Some(Self::Alert),
            EventCode::Recover => Some(Self::Recovery),
            EventCode::Null => None,
        }
    }

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Evidence of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHistory {
    /// Stable series key; feeds the hash id.
    #[serde(skip)]
    pub key: String,
    /// Metric name.
    pub metric: String,
    /// Tags without the endpoint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Series granularity in seconds.
    #[serde(skip)]
    pub granularity: i64,
    /// Judged points.
    pub points: Vec<Point>,
}

/// One state transition of one series (or series tuple) of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Strategy id.
    pub sid: i64,
    /// Alert or recovery.
    pub event_type: EventType,
    /// Stable id of the series tuple, 60 bits.
    pub hashid: u64,
    /// Latest evidence timestamp.
    pub etime: i64,
    /// Endpoint of the series.
    pub endpoint: String,
    /// Evidence, one entry per member series.
    #[serde(skip)]
    pub history: Vec<EventHistory>,
    /// JSON encoding of `history`.
    pub detail: String,
    /// Human readable trigger description.
    pub info: String,
    /// Latest evidence value(s) for display.
    pub value: String,
    /// Queue this event is routed to.
    #[serde(skip)]
    pub partition: String,
}

impl Event {
    /// Creates an empty event.
    #[must_use]
    pub fn new(sid: i64, partition: impl Into<String>, event_type: EventType) -> Self {
        Self {
            sid,
            event_type,
            hashid: 0,
            etime: 0,
            endpoint: String::new(),
            history: Vec::new(),
            detail: String::new(),
            info: String::new(),
            value: String::new(),
            partition: partition.into(),
        }
    }

    /// Sets the description.
    pub fn set_info(&mut self, info: impl Into<String>) {
        self.info = info.into();
    }

    /// Attaches the evidence of one series. `etime` follows the latest last point.
    pub fn set_points(
        &mut self,
        key: impl Into<String>,
        metric: impl Into<String>,
        tags: &BTreeMap<String, String>,
        granularity: i64,
        points: Vec<Point>,
    ) {
        let mut endpoint = String::new();
        let mut rest = BTreeMap::new();
        for (k, v) in tags {
            if k == ENDPOINT_KEY {
                endpoint.clone_from(v);
            } else {
                rest.insert(k.clone(), v.clone());
            }
        }

        if let Some(last) = points.last() {
            if self.history.is_empty() || last.timestamp > self.etime {
                self.etime = last.timestamp;
            }
        }
        self.endpoint = endpoint;
        self.history.push(EventHistory {
            key: key.into(),
            metric: metric.into(),
            tags: rest,
            granularity,
            points,
        });
    }

    /// Computes `hashid`, `detail` and `value`. Returns false if no evidence is attached.
    pub fn finalize(&mut self) -> bool {
        if self.history.is_empty() {
            return false;
        }

        let mut pk = format!("{:x}/", self.sid);
        for h in &self.history {
            pk.push_str(&h.key);
        }
        let hash = xxh3_64(pk.as_bytes());
        // Folded to 60 bits for consumers that store ids as signed integers.
        self.hashid = (hash >> 60) ^ (hash & 0x0FFF_FFFF_FFFF_FFFF);

        self.detail = serde_json::to_string(&self.history).unwrap_or_default();

        self.value = match self.history.as_slice() {
            [only] if !only.points.is_empty() => only.points.last().map(|p| format_value(p.value)).unwrap_or_default(),
            all => all
                .iter()
                .map(|h| {
                    h.points
                        .last()
                        .map(|p| format!("{}:{}", h.metric, format_value(p.value)))
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join(","),
        };
        true
    }
}

fn format_value(v: f64) -> String {
    if v.is_nan() { "null".to_string() } else { format!("{v:.2}") }
}
