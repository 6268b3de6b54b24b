//! Strategy registry.
//!
//! The [`Registry`] owns one [`StrategyEntity`] per strategy of the catalog and
//! reconciles them with every pull: new strategies are started, known ones get
//! the newest version staged, and strategies gone from the catalog are stopped
//! and dropped once their loop has exited.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use claw_series::Storage;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::nodata::NodataHandler;
use crate::publish::EventPublisher;
use crate::remote::StrategyCatalog;
use crate::schema::Strategy;
use crate::strategy::{EntityStatus, StrategyEntity, StrategyPlan, StrategySummary};

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManageReport {
    /// Strategies in the catalog.
    pub total: usize,
    /// Strategies started.
    pub added: usize,
    /// Strategies given a newer version.
    pub updated: usize,
    /// Strategies being stopped or dropped.
    pub deleted: usize,
}

/// Size of the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    /// Number of strategies.
    pub strategy_count: usize,
    /// Number of matched series over all strategies.
    pub series_count: usize,
}

/// All strategy entities of this node.
pub struct Registry {
    strategies: RwLock<HashMap<i64, StrategyEntity>>,
    storage: Arc<dyn Storage>,
    publisher: Arc<dyn EventPublisher>,
    nodata: NodataHandler,
    index_interval: Duration,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("strategies", &self.strategies.read().len())
            .field("index_interval", &self.index_interval)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates an empty registry. Started entities refresh their index every `index_interval`.
    pub fn new(storage: Arc<dyn Storage>, publisher: Arc<dyn EventPublisher>, index_interval: Duration) -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            nodata: NodataHandler::new(storage.clone(), publisher.clone()),
            storage,
            publisher,
            index_interval,
        }
    }

    /// Returns the entity of strategy `sid`.
    #[must_use]
    pub fn get(&self, sid: i64) -> Option<StrategyEntity> {
        self.strategies.read().get(&sid).cloned()
    }

    /// Reconciles the registry with `strategies`.
    ///
    /// Unless `first`, the nodata pre-handler runs on the catalog before the
    /// reconciliation.
    pub async fn manage(&self, strategies: Vec<Strategy>, first: bool) -> ManageReport {
        if !first {
            self.nodata.handle(&strategies, Local::now()).await;
        }

        let mut report = ManageReport {
            total: strategies.len(),
            ..ManageReport::default()
        };
        let mut newest = HashSet::new();
        let mut adds = Vec::new();
        {
            let current = self.strategies.read();
            for strategy in strategies {
                let sid = strategy.id;
                newest.insert(sid);
                let plan = match StrategyPlan::new(strategy) {
                    Ok(plan) => plan,
                    Err(e) => {
                        warn!(sid, error = %e, "generate strategy entity failed");
                        continue;
                    }
                };
                if let Some(old) = current.get(&sid) {
                    old.set_cache(plan);
                    report.updated += 1;
                } else {
                    adds.push(StrategyEntity::new(plan, self.storage.clone(), self.publisher.clone()));
                }
            }
        }

        for entity in &adds {
            entity.start(self.index_interval).await;
        }
        report.added = adds.len();

        let mut current = self.strategies.write();
        for entity in adds {
            current.insert(entity.id(), entity);
        }
        let gone: Vec<i64> = current.keys().filter(|sid| !newest.contains(*sid)).copied().collect();
        report.deleted = gone.len();
        for sid in gone {
            let Some(entity) = current.get(&sid) else {
                continue;
            };
            match entity.status() {
                EntityStatus::Stopped => {
                    current.remove(&sid);
                }
                EntityStatus::Stopping => {}
                _ => entity.stop(),
            }
        }
        drop(current);
        self.retire_series();

        info!(
            total = report.total,
            add = report.added,
            update = report.updated,
            delete = report.deleted,
            "strategy manage finished"
        );
        report
    }

    /// Drops the storage buffers of series no strategy matches any more.
    ///
    /// Skipped while any strategy is refreshing its index, since its newly
    /// matched series are not recorded yet.
    pub fn retire_series(&self) -> usize {
        let mark = Instant::now();
        let live = {
            let current = self.strategies.read();
            if current.values().any(StrategyEntity::is_indexing) {
                debug!("series retirement deferred, index refresh running");
                return 0;
            }
            current.values().flat_map(StrategyEntity::series_ids).collect::<HashSet<u32>>()
        };
        self.storage.retire(&live, mark)
    }

    /// Loads the catalog once and reconciles without the nodata pre-handler.
    ///
    /// # Errors
    ///
    /// Returns the catalog error.
    pub async fn bootstrap(&self, catalog: &StrategyCatalog) -> Result<ManageReport> {
        let strategies = catalog.load().await?;
        Ok(self.manage(strategies, true).await)
    }

    /// Pulls the catalog every `update_interval_ms` until `shutdown` turns true.
    /// A failed pull keeps the current strategies.
    pub async fn run_manage_loop(&self, catalog: &StrategyCatalog, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(catalog.config().update_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("strategy manage loop stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    match catalog.load().await {
                        Ok(strategies) => {
                            self.manage(strategies, false).await;
                        }
                        Err(e) => warn!(error = %e, "strategy manage failed"),
                    }
                }
            }
        }
    }

    /// Returns the number of strategies and matched series.
    #[must_use]
    pub fn summary(&self) -> WorkerSummary {
        let current = self.strategies.read();
        WorkerSummary {
            strategy_count: current.len(),
            series_count: current.values().map(StrategyEntity::series_count).sum(),
        }
    }

    /// Returns the summary of strategy `sid`.
    #[must_use]
    pub fn strategy_summary(&self, sid: i64) -> Option<StrategySummary> {
        self.get(sid).map(|e| e.summary())
    }

    /// Asks every strategy to stop.
    pub fn stop_all(&self) {
        for entity in self.strategies.read().values() {
            entity.stop();
        }
    }

    /// Stops every strategy, then drains the publisher.
    pub async fn shutdown(&self) {
        self.stop_all();
        self.publisher.close().await;
        info!("strategy registry shut down");
    }
}
