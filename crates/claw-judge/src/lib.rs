//! Strategy evaluation engine of the clawjudge alert evaluator.
//!
//! `claw-judge` turns alerting rules into running entities that read series
//! through `claw-series`, decide per time slot whether a condition holds and
//! publish alert and recovery events.
//!
//! # Features
//!
//! - **Triggers**: `duration_happen`, `duration_stat` and `nodata` over a
//!   trailing window, combined per judgement with `and`/`or`
//! - **Hysteresis**: [`AlertPointDriver`] applies count and duration thresholds
//!   and rate-limits repeated alerts
//! - **Catch-up**: judgements keep a cursor and re-judge slots whose data
//!   arrived late, within a bounded window
//! - **Hot reload**: strategies are reconciled with the catalog on every pull
//!   and new versions are swapped in between passes
//! - **Publishers**: JSON-lines file, HTTP queue gateway, or the log
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use claw_judge::{LogPublisher, Registry, StrategyCatalog, StrategyCatalogConfig};
//! use claw_series::{HttpQueryConfig, HttpSeriesQuery, StorageBuffer, StorageBufferConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = HttpSeriesQuery::new(HttpQueryConfig {
//!     addrs: vec!["http://127.0.0.1:7900/api/query".to_string()],
//!     index_addrs: vec!["http://127.0.0.1:7901/api/xclude".to_string()],
//!     ..HttpQueryConfig::default()
//! })?;
//! let storage = Arc::new(StorageBuffer::new(StorageBufferConfig::default(), Arc::new(remote)));
//! let registry = Registry::new(storage, Arc::new(LogPublisher::default()), Duration::from_secs(60));
//!
//! let catalog = StrategyCatalog::new(
//!     StrategyCatalogConfig {
//!         file: Some("strategies.json".to_string()),
//!         ..StrategyCatalogConfig::default()
//!     },
//!     "node-1",
//! )?;
//! let report = registry.bootstrap(&catalog).await?;
//! println!("started {} strategies", report.added);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![doc(html_root_url = "https://docs.rs/claw-judge/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bitmap;
pub mod driver;
pub mod error;
pub mod event;
pub mod execution;
pub mod judgement;
pub mod nodata;
pub mod publish;
pub mod remote;
pub mod schema;
pub mod strategy;
pub mod trigger;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use driver::AlertPointDriver;
pub use error::{JudgeError, Result};
pub use event::{Event, EventHistory, EventType};
pub use execution::{ExecutionEntity, ExecutionOutcome};
pub use judgement::{JudgementEntity, MetricEntity};
pub use nodata::NodataHandler;
pub use publish::{
    EventPublisher, FilePublisher, FilePublisherConfig, HttpPublisher, HttpPublisherConfig, LogPublisher,
    PublisherConfig, PublisherKind, build_publisher,
};
pub use remote::{RemoteStrategy, StrategyCatalog, StrategyCatalogConfig, fetch_strategies, load_strategy_file};
pub use schema::{Strategy, StrategyAlert, StrategyExecution, StrategyExpression, StrategyJudgement};
pub use strategy::{EntityStatus, StrategyEntity, StrategyPlan, StrategySummary};
pub use trigger::Trigger;
pub use types::{EventCode, LogicOperator, Status};
pub use worker::{ManageReport, Registry, WorkerSummary};
