//! Strategy catalog: the remote partition API and local strategy files.
//!
//! The remote catalog serves rules in its own format ([`RemoteStrategy`]); they
//! are converted into [`Strategy`] values here. Records are converted one by
//! one and a rejected record never fails the whole pull.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{JudgeError, Result};
use crate::schema::{
    Strategy, StrategyAlert, StrategyExecution, StrategyExpression, StrategyJudgement, StrategyTagFilter,
    StrategyThreshold,
};
use crate::types::{LogicOperator, MathOperator, TRIGGER_DURATION_HAPPEN, TRIGGER_DURATION_STAT, TRIGGER_NODATA};

/// Slots a judgement waits for late data before giving up on a slot.
const REMOTE_WINDOW_SIZE: i64 = 180;
/// End of the active minutes of remote rules.
const REMOTE_EFFECTIVE_END: i64 = 1439;
/// Alerts allowed per limit window.
const REMOTE_LIMIT_COUNT: i64 = 1;
/// Length of the limit window in seconds.
const REMOTE_LIMIT_DURATION: i64 = 300;

/// The `[strategy]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyCatalogConfig {
    /// Catalog hosts (`host:port`, or full base URLs).
    pub addrs: Vec<String>,
    /// Path of the partition API; `{}` is replaced by the node identity.
    pub partition_api: String,
    /// Timeout of one catalog call.
    pub timeout_ms: u64,
    /// How often the catalog is pulled.
    pub update_interval_ms: u64,
    /// How often every strategy re-resolves its series.
    pub index_interval_ms: u64,
    /// Local JSON catalog used instead of the remote one.
    pub file: Option<String>,
}

impl Default for StrategyCatalogConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            partition_api: "/api/stra/effective?ip={}".to_string(),
            timeout_ms: 5000,
            update_interval_ms: 60_000,
            index_interval_ms: 60_000,
            file: None,
        }
    }
}

/// A tag filter as served by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTag {
    /// Tag key.
    pub tkey: String,
    /// `=` or `!=`.
    pub topt: String,
    /// Tag values.
    pub tval: Vec<String>,
}

/// An expression as served by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteExpression {
    /// Comparison symbol.
    pub eopt: String,
    /// `all`, `max`, `min`, `sum`, `avg`, `happen` or `nodata`.
    pub func: String,
    /// Metric name.
    pub metric: String,
    /// Function parameters; `happen` takes the count.
    pub params: Vec<i64>,
    /// Threshold value.
    pub threshold: f64,
}

/// A rule as served by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStrategy {
    /// Strategy id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Model kind.
    pub category: i64,
    /// Alert priority; selects the event partition.
    pub priority: i64,
    /// Period every expression looks back over, seconds.
    pub alert_dur: i64,
    /// Recovery duration, seconds.
    pub recovery_dur: i64,
    /// Expressions, one judgement each.
    pub exprs: Vec<RemoteExpression>,
    /// Tag filters shared by every judgement.
    pub tags: Vec<RemoteTag>,
    /// Leaf nodes the rule is bound to.
    pub leaf_nids: Vec<i64>,
    /// Endpoints of the leaf nodes; may repeat.
    pub endpoints: Vec<String>,
    /// Last modification.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Maps a catalog function to a trigger and its parameters.
fn expression_trigger(expr: &RemoteExpression, alert_dur: i64) -> Result<(&'static str, Vec<String>)> {
    let duration = alert_dur.to_string();
    match expr.func.as_str() {
        "happen" => match expr.params.as_slice() {
            [count] => Ok((TRIGGER_DURATION_HAPPEN, vec![duration, count.to_string()])),
            _ => Err(JudgeError::InvalidStrategy {
                reason: "func happen param illegal".to_string(),
            }),
        },
        "nodata" => Ok((TRIGGER_NODATA, vec![duration])),
        func => match MathOperator::parse(func) {
            Some(op) => Ok((TRIGGER_DURATION_STAT, vec![duration, op.as_str().to_string()])),
            None => Err(JudgeError::InvalidStrategy {
                reason: format!("func {func} not supported"),
            }),
        },
    }
}

impl TryFrom<&RemoteStrategy> for Strategy {
    type Error = JudgeError;

    fn try_from(s: &RemoteStrategy) -> Result<Self> {
        if s.leaf_nids.is_empty() {
            return Err(JudgeError::InvalidStrategy {
                reason: "empty leaf nid".to_string(),
            });
        }
        if s.exprs.is_empty() {
            return Err(JudgeError::InvalidStrategy {
                reason: "empty expression".to_string(),
            });
        }
        if s.alert_dur <= 0 {
            return Err(JudgeError::InvalidStrategy {
                reason: "alert duration empty".to_string(),
            });
        }

        let filters: Vec<StrategyTagFilter> = s
            .tags
            .iter()
            .map(|t| StrategyTagFilter {
                tagk: t.tkey.clone(),
                operator: t.topt.clone(),
                tagv: t.tval.clone(),
            })
            .collect();

        let and = LogicOperator::And.as_str().to_string();
        let judgements = s
            .exprs
            .iter()
            .map(|expr| {
                let (func, params) = expression_trigger(expr, s.alert_dur)?;
                Ok(StrategyJudgement {
                    metric: expr.metric.clone(),
                    tags: filters.clone(),
                    execution: StrategyExecution {
                        effective_day: (0..7).collect(),
                        effective_start: 0,
                        effective_end: REMOTE_EFFECTIVE_END,
                        operator: and.clone(),
                        expressions: vec![StrategyExpression {
                            func: func.to_string(),
                            params,
                            operator: and.clone(),
                            thresholds: vec![StrategyThreshold {
                                threshold: expr.threshold,
                                operator: expr.eopt.clone(),
                            }],
                        }],
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let endpoints: BTreeSet<&String> = s.endpoints.iter().collect();

        Ok(Self {
            id: s.id,
            name: s.name.clone(),
            priority: s.priority,
            category: s.category,
            operator: and,
            judgements,
            alert: StrategyAlert {
                alert_count_threshold: 1,
                recover_duration_threshold: s.recovery_dur,
                limit_count_threshold: REMOTE_LIMIT_COUNT,
                limit_duration_threshold: REMOTE_LIMIT_DURATION,
                ..StrategyAlert::default()
            },
            partition: format!("/event/p{}", s.priority),
            window_size: REMOTE_WINDOW_SIZE,
            endpoints: endpoints.into_iter().cloned().collect(),
            updated: s.last_updated.map_or(0, |t| t.timestamp()),
            ..Self::default()
        })
    }
}

#[derive(Debug, Deserialize)]
struct CatalogEnvelope {
    #[serde(default)]
    dat: Vec<serde_json::Value>,
    #[serde(default)]
    err: String,
}

/// Converts raw catalog records, logging and skipping the unusable ones.
fn parse_remote_records(records: Vec<serde_json::Value>) -> Vec<Strategy> {
    records
        .into_iter()
        .filter_map(|raw| {
            let parsed = serde_json::from_value::<RemoteStrategy>(raw.clone())
                .map_err(JudgeError::from)
                .and_then(|r| Strategy::try_from(&r));
            match parsed {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, strategy = %raw, "parse strategy failed");
                    None
                }
            }
        })
        .collect()
}

fn catalog_url(addr: &str, api: &str, identity: &str) -> String {
    let path = api.replacen("{}", identity, 1);
    if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{addr}{path}")
    } else {
        format!("http://{addr}{path}")
    }
}

/// Pulls the strategies of `identity` from the remote catalog.
///
/// Addresses are tried in random order; the first one answering with a
/// non-empty list wins. An empty list is returned if every reachable address
/// answered with an empty list.
///
/// # Errors
///
/// Returns `JudgeError::Remote` if no address is configured or none answered.
pub async fn fetch_strategies(
    client: &reqwest::Client,
    config: &StrategyCatalogConfig,
    identity: &str,
) -> Result<Vec<Strategy>> {
    if config.addrs.is_empty() {
        return Err(JudgeError::Remote {
            reason: "empty config addr".to_string(),
        });
    }
    let mut addrs: Vec<&String> = config.addrs.iter().collect();
    addrs.shuffle(&mut rand::thread_rng());

    let mut answered = false;
    for addr in addrs {
        let url = catalog_url(addr, &config.partition_api, identity);
        let resp = client
            .get(&url)
            .timeout(Duration::from_millis(config.timeout_ms))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        let envelope: CatalogEnvelope = match resp {
            Ok(r) => match r.json().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(url = %url, error = %e, "strategy catalog answer unreadable");
                    continue;
                }
            },
            Err(e) => {
                debug!(url = %url, error = %e, "get strategy from remote failed");
                continue;
            }
        };
        if !envelope.err.is_empty() {
            debug!(url = %url, error = %envelope.err, "strategy catalog returned an error");
            continue;
        }
        answered = true;
        if !envelope.dat.is_empty() {
            return Ok(parse_remote_records(envelope.dat));
        }
    }

    if answered {
        Ok(Vec::new())
    } else {
        Err(JudgeError::Remote {
            reason: "no strategy catalog answered".to_string(),
        })
    }
}

/// Loads a local catalog: a JSON array of strategies. Unusable records are
/// logged and skipped.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a JSON array.
pub async fn load_strategy_file(path: impl AsRef<Path>) -> Result<Vec<Strategy>> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path).await?;
    let records: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
    Ok(records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<Strategy>(record) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "strategy record skipped");
                None
            }
        })
        .collect())
}

/// Source of strategies: the local file when configured, the remote catalog otherwise.
#[derive(Debug, Clone)]
pub struct StrategyCatalog {
    config: StrategyCatalogConfig,
    identity: String,
    client: reqwest::Client,
}

impl StrategyCatalog {
    /// Creates the catalog for node `identity`.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::Remote` if neither addresses nor a file are
    /// configured, or the HTTP client cannot be built.
    pub fn new(config: StrategyCatalogConfig, identity: impl Into<String>) -> Result<Self> {
        if config.addrs.is_empty() && config.file.is_none() {
            return Err(JudgeError::Remote {
                reason: "neither strategy.addrs nor strategy.file is set".to_string(),
            });
        }
        Ok(Self {
            config,
            identity: identity.into(),
            client: reqwest::Client::builder().build()?,
        })
    }

    /// Returns the catalog settings.
    #[must_use]
    pub const fn config(&self) -> &StrategyCatalogConfig {
        &self.config
    }

    /// Loads the current strategies.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying source.
    pub async fn load(&self) -> Result<Vec<Strategy>> {
        match &self.config.file {
            Some(file) => load_strategy_file(file).await,
            None => fetch_strategies(&self.client, &self.config, &self.identity).await,
        }
    }
}
