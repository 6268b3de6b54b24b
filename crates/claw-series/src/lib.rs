//! Series storage layer of the clawjudge alert evaluator.
//!
//! `claw-series` keeps the recent data of every series a strategy watches and
//! hides the remote time-series service behind a small read API.
//!
//! # Features
//!
//! - **Series identity**: a [`Series`] is a metric plus its tag set; a sharded
//!   [`ShardSet`] assigns each distinct series a dense id
//! - **Bounded histories**: [`RingHistory`] for cached raw data,
//!   [`ChainHistory`] for judged results
//! - **Coalesced reads**: [`StorageBuffer`] batches concurrent reads of the same
//!   series into one downstream call and writes the answer back into the ring
//! - **Pluggable backend**: anything implementing [`SeriesQuery`];
//!   [`HttpSeriesQuery`] talks JSON over HTTP
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use claw_series::{HttpQueryConfig, HttpSeriesQuery, Series, Storage, StorageBuffer, StorageBufferConfig};
//!
//! # async fn run() -> claw_series::Result<()> {
//! let remote = HttpSeriesQuery::new(HttpQueryConfig {
//!     addrs: vec!["http://127.0.0.1:7900/api/query".to_string()],
//!     index_addrs: vec!["http://127.0.0.1:7901/api/xclude".to_string()],
//!     ..HttpQueryConfig::default()
//! })?;
//! let storage = StorageBuffer::new(StorageBufferConfig::default(), Arc::new(remote));
//!
//! let mut tags = BTreeMap::new();
//! tags.insert("endpoint".to_string(), "host-1".to_string());
//! let series = Series::new("cpu.idle", tags, 10, "GAUGE")?;
//! let id = storage.generate_and_set(series, 6, &[0]);
//!
//! let points = storage.query(id, 1_700_000_000, 1_700_000_060, 0).await?;
//! # let _ = points;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![doc(html_root_url = "https://docs.rs/claw-series/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod buffer;
pub mod coalesce;
pub mod error;
pub mod history;
pub mod query;
pub mod remote;
pub mod series;
pub mod shard;
pub mod types;

// Re-export main types at crate root
pub use buffer::{Storage, StorageBuffer, StorageBufferConfig, panic_message};
pub use error::{Result, SeriesError};
pub use history::{ChainHistory, History, RingHistory};
pub use query::{Counter, IndexRequest, QueryData, QueryResponse, SeriesQuery};
pub use remote::{HttpQueryConfig, HttpSeriesQuery};
pub use series::Series;
pub use shard::ShardSet;
pub use types::{COUNTER_SEPARATOR, ENDPOINT_KEY, Point};
