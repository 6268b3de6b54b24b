//! HTTP client for the remote query and index services.

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SeriesError};
use crate::query::{Counter, IndexRequest, QueryData, QueryResponse, SeriesQuery};
use crate::types::ENDPOINT_KEY;

/// Addresses and timeouts of the remote services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpQueryConfig {
    /// Data query URLs; one is picked at random per call.
    pub addrs: Vec<String>,
    /// Index URLs; tried in random order until one answers.
    pub index_addrs: Vec<String>,
    /// Timeout of one data query call.
    pub call_timeout_ms: u64,
    /// Timeout of one index call.
    pub index_call_timeout_ms: u64,
}

impl Default for HttpQueryConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            index_addrs: Vec::new(),
            call_timeout_ms: 2000,
            index_call_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    #[serde(default)]
    dat: Vec<QueryResponse>,
    #[serde(default)]
    err: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Xclude {
    tagk: String,
    tagv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct IndexBody {
    endpoints: Vec<String>,
    metric: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    include: Vec<Xclude>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    exclude: Vec<Xclude>,
}

impl From<&IndexRequest> for IndexBody {
    fn from(req: &IndexRequest) -> Self {
        let xclude = |m: &std::collections::BTreeMap<String, Vec<String>>| {
            m.iter()
                .map(|(k, v)| Xclude {
                    tagk: k.clone(),
                    tagv: v.clone(),
                })
                .collect()
        };
        Self {
            endpoints: req.endpoints.clone(),
            metric: req.metric.clone(),
            include: xclude(&req.include),
            exclude: xclude(&req.exclude),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IndexRecord {
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    step: i64,
    #[serde(default)]
    dstype: String,
}

#[derive(Debug, Deserialize)]
struct IndexEnvelope {
    #[serde(default)]
    dat: Vec<IndexRecord>,
}

/// Converts an index answer into counters carrying the `endpoint=` pair.
///
/// Only single-record, single-endpoint answers with a positive step are usable;
/// anything else yields no counters.
fn index_counters(mut records: Vec<IndexRecord>) -> Vec<Counter> {
    if records.len() != 1 {
        return Vec::new();
    }
    let Some(record) = records.pop() else {
        return Vec::new();
    };
    if record.endpoints.len() != 1 || record.step <= 0 {
        return Vec::new();
    }
    let prefix = format!("{ENDPOINT_KEY}={}", record.endpoints[0]);
    if record.tags.is_empty() {
        return vec![Counter {
            counter: prefix,
            step: record.step,
            dstype: record.dstype,
        }];
    }
    record
        .tags
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| Counter {
            counter: format!("{prefix},{t}"),
            step: record.step,
            dstype: record.dstype.clone(),
        })
        .collect()
}

/// [`SeriesQuery`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpSeriesQuery {
    config: HttpQueryConfig,
    client: reqwest::Client,
}

impl HttpSeriesQuery {
    /// Creates the client.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::Downstream` if either address list is empty or the
    /// HTTP client cannot be built.
    pub fn new(config: HttpQueryConfig) -> Result<Self> {
        if config.addrs.is_empty() {
            return Err(SeriesError::Downstream {
                reason: "empty query addr".to_string(),
            });
        }
        if config.index_addrs.is_empty() {
            return Err(SeriesError::Downstream {
                reason: "empty index addr".to_string(),
            });
        }
        let client = reqwest::Client::builder().build()?;
        Ok(Self { config, client })
    }

    async fn do_query(&self, requests: Vec<QueryData>) -> Result<Vec<QueryResponse>> {
        let i = rand::thread_rng().gen_range(0..self.config.addrs.len());
        let addr = &self.config.addrs[i];
        let envelope: QueryEnvelope = self
            .client
            .post(addr)
            .timeout(Duration::from_millis(self.config.call_timeout_ms))
            .json(&requests)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !envelope.err.is_empty() {
            return Err(SeriesError::Downstream {
                reason: envelope.err,
            });
        }
        Ok(envelope.dat)
    }

    async fn do_index(&self, request: &IndexRequest) -> Result<Vec<Counter>> {
        let body = [IndexBody::from(request)];
        let mut addrs: Vec<&String> = self.config.index_addrs.iter().collect();
        addrs.shuffle(&mut rand::thread_rng());

        for addr in addrs {
            let resp = self
                .client
                .post(addr.as_str())
                .timeout(Duration::from_millis(self.config.index_call_timeout_ms))
                .json(&body)
                .send()
                .await;
            let resp = match resp.and_then(reqwest::Response::error_for_status) {
                Ok(r) => r,
                Err(e) => {
                    debug!(addr = %addr, error = %e, metric = %request.metric, "index call failed");
                    continue;
                }
            };
            match resp.json::<IndexEnvelope>().await {
                Ok(envelope) => return Ok(index_counters(envelope.dat)),
                Err(e) => debug!(addr = %addr, error = %e, "index response undecodable"),
            }
        }
        Err(SeriesError::Downstream {
            reason: "index xclude failed".to_string(),
        })
    }
}

impl SeriesQuery for HttpSeriesQuery {
    fn query<'a>(&'a self, requests: Vec<QueryData>) -> BoxFuture<'a, Result<Vec<QueryResponse>>> {
        Box::pin(self.do_query(requests))
    }

    fn index<'a>(&'a self, request: &'a IndexRequest) -> BoxFuture<'a, Result<Vec<Counter>>> {
        Box::pin(self.do_index(request))
    }
}
