//! Execution entities: the triggers of one judgement and when they apply.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use claw_series::{Point, Storage};
use tracing::warn;

use crate::bitmap::{BitMap, EFFECTIVE_DAY_SIZE, EFFECTIVE_MINUTE_SIZE};
use crate::error::{JudgeError, Result};
use crate::schema::StrategyExecution;
use crate::trigger::{Trigger, TriggerInfo, Verdict};
use crate::types::{LogicOperator, Status};

/// Combined result of all triggers of an execution for one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// Combined verdict.
    pub status: Status,
    /// Evidence of all triggers, one point per timestamp, sorted.
    pub points: Vec<Point>,
    /// Descriptions in trigger order.
    pub infos: Vec<TriggerInfo>,
    /// Operator that combined the triggers.
    pub operator: LogicOperator,
}

/// Triggers of one judgement with their effective time mask.
#[derive(Debug, Clone)]
pub struct ExecutionEntity {
    sid: i64,
    key: String,
    effective_day: BitMap,
    effective_minute: BitMap,
    operator: LogicOperator,
    triggers: Vec<Trigger>,
}

impl ExecutionEntity {
    /// Builds the entity for judgement `key` of strategy `sid`.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no expressions, the operator is unknown, or
    /// any expression is not a valid trigger.
    pub fn new(sid: i64, execution: &StrategyExecution, key: impl Into<String>) -> Result<Self> {
        if execution.expressions.is_empty() {
            return Err(JudgeError::InvalidExecution {
                reason: "empty expression".to_string(),
            });
        }
        let operator =
            LogicOperator::parse(&execution.operator).ok_or_else(|| JudgeError::InvalidExecution {
                reason: "illegal execution operator".to_string(),
            })?;

        let mut effective_day = BitMap::new(EFFECTIVE_DAY_SIZE);
        effective_day.set(&execution.effective_day);
        let mut effective_minute = BitMap::new(EFFECTIVE_MINUTE_SIZE);
        effective_minute.set_range(execution.effective_start, execution.effective_end);

        let triggers = execution
            .expressions
            .iter()
            .map(Trigger::from_expression)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sid,
            key: key.into(),
            effective_day,
            effective_minute,
            operator,
            triggers,
        })
    }

    /// Returns the metric this execution judges.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the combinator over the triggers.
    #[must_use]
    pub const fn operator(&self) -> LogicOperator {
        self.operator
    }

    /// Returns the triggers.
    #[must_use]
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Returns true if the execution applies on weekday `day` (0 is Sunday)
    /// at `minute` of the day.
    #[must_use]
    pub fn effective(&self, day: i64, minute: i64) -> bool {
        self.effective_day.is_set(day) && self.effective_minute.is_set(minute)
    }

    /// Runs every trigger on series `id` at slot `current`.
    ///
    /// `Null` and `Empty` outcomes carry no evidence. Trigger failures are
    /// logged and count as `Null` for storage errors and `Empty` otherwise.
    pub async fn run(&self, stg: &dyn Storage, id: u32, current: i64, granularity: i64) -> ExecutionOutcome {
        let mut status = Status::Init;
        let mut points = BTreeMap::new();
        let mut infos = Vec::new();

        if id == 0 || self.triggers.is_empty() {
            return ExecutionOutcome {
                status: Status::Empty,
                points: Vec::new(),
                infos,
                operator: self.operator,
            };
        }
        for trigger in &self.triggers {
            let verdict = match trigger.run(stg, id, current, granularity).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(sid = self.sid, ts = current, series = id, error = %e, "trigger run failed");
                    Verdict::bare(match e {
                        JudgeError::Storage(_) => Status::Null,
                        _ => Status::Empty,
                    })
                }
            };
            status = self.operator.combine(status, verdict.status);
            // A missing-data marker never hides a real point of the same slot.
            for p in verdict.points {
                match points.entry(p.timestamp) {
                    Entry::Vacant(slot) => {
                        slot.insert(p);
                    }
                    Entry::Occupied(mut slot) => {
                        if !p.value.is_nan() {
                            slot.insert(p);
                        }
                    }
                }
            }
            infos.extend(verdict.info);
        }

        if matches!(status, Status::Null | Status::Empty) {
            return ExecutionOutcome {
                status,
                points: Vec::new(),
                infos: Vec::new(),
                operator: self.operator,
            };
        }
        ExecutionOutcome {
            status,
            points: points.into_values().collect(),
            infos,
            operator: self.operator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::execution;
    use crate::schema::{StrategyExpression, StrategyThreshold};
    use crate::testing::MockStorage;
    use claw_series::{Counter, IndexRequest, Series};
    use futures::future::BoxFuture;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn happen(op: &str, threshold: f64, duration: i64, count: i64) -> StrategyExpression {
        StrategyExpression {
            func: "duration_happen".to_string(),
            params: vec![duration.to_string(), count.to_string()],
            operator: "and".to_string(),
            thresholds: vec![StrategyThreshold {
                threshold,
                operator: op.to_string(),
            }],
        }
    }

    fn nodata(duration: i64) -> StrategyExpression {
        StrategyExpression {
            func: "nodata".to_string(),
            params: vec![duration.to_string()],
            ..StrategyExpression::default()
        }
    }

    mod construction_tests {
        use super::*;

        #[test]
        fn test_rejects_empty_expressions() {
            assert!(ExecutionEntity::new(1, &execution(vec![]), "cpu").is_err());
        }

        #[test]
        fn test_rejects_bad_operator() {
            let mut e = execution(vec![nodata(60)]);
            e.operator = "nand".to_string();
            assert!(ExecutionEntity::new(1, &e, "cpu").is_err());
        }

        #[test]
        fn test_rejects_bad_trigger() {
            let e = execution(vec![nodata(60), StrategyExpression::default()]);
            assert!(ExecutionEntity::new(1, &e, "cpu").is_err());
        }

        #[test]
        fn test_effective_mask() {
            let mut e = execution(vec![nodata(60)]);
            e.effective_day = vec![1, 2, 3, 4, 5];
            e.effective_start = 540;
            e.effective_end = 1080;
            let entity = ExecutionEntity::new(1, &e, "cpu").unwrap();
            assert!(entity.effective(1, 540));
            assert!(!entity.effective(1, 1080));
            assert!(!entity.effective(0, 600));
            assert!(!entity.effective(6, 600));
        }
    }

    mod run_tests {
        use super::*;

        #[tokio::test]
        async fn test_and_of_two_triggers() {
            let stg = MockStorage::default();
            let id = stg.add_series("cpu", "h1", 10);
            stg.set_points(id, vec![Point::new(10, 91.0), Point::new(20, 92.0)]);
            let e = execution(vec![happen(">", 90.0, 20, 2), happen(">", 91.5, 20, 1)]);
            let entity = ExecutionEntity::new(1, &e, "cpu").unwrap();

            let out = entity.run(&stg, id, 20, 10).await;
            assert_eq!(out.status, Status::Alert);
            assert_eq!(out.points, vec![Point::new(10, 91.0), Point::new(20, 92.0)]);
            assert_eq!(out.infos.len(), 2);
            assert_eq!(out.operator, LogicOperator::And);
        }

        #[tokio::test]
        async fn test_null_drops_evidence() {
            let stg = MockStorage::default();
            let id = stg.add_series("cpu", "h1", 10);
            stg.set_points(id, vec![Point::new(10, 91.0)]);
            let e = execution(vec![happen(">", 90.0, 20, 1)]);
            let entity = ExecutionEntity::new(1, &e, "cpu").unwrap();

            let out = entity.run(&stg, id, 20, 10).await;
            assert_eq!(out.status, Status::Null);
            assert!(out.points.is_empty());
            assert!(out.infos.is_empty());
        }

        #[tokio::test]
        async fn test_storage_failure_is_null() {
            let stg = MockStorage::default();
            let id = stg.add_series("cpu", "h1", 10);
            stg.fail_queries(true);
            let entity = ExecutionEntity::new(1, &execution(vec![nodata(20)]), "cpu").unwrap();
            assert_eq!(entity.run(&stg, id, 20, 10).await.status, Status::Null);
        }

        #[tokio::test]
        async fn test_unassigned_id_is_empty() {
            let stg = MockStorage::default();
            let entity = ExecutionEntity::new(1, &execution(vec![nodata(20)]), "cpu").unwrap();
            let out = entity.run(&stg, 0, 20, 10).await;
            assert_eq!(out.status, Status::Empty);
            assert_eq!(stg.query_count(), 0);
        }

        #[tokio::test]
        async fn test_or_rescues_alert_from_null() {
            let stg = MockStorage::default();
            let id = stg.add_series("cpu", "h1", 10);
            stg.set_points(id, vec![Point::new(10, 91.0)]);
            let mut e = execution(vec![nodata(10), happen(">", 90.0, 20, 1)]);
            e.operator = "or".to_string();
            let entity = ExecutionEntity::new(1, &e, "cpu").unwrap();

            // nodata alerts (nothing in (11, 20]); happen is Null (nothing at 20).
            let out = entity.run(&stg, id, 20, 10).await;
            assert_eq!(out.status, Status::Alert);
            assert_eq!(out.points.len(), 1);
            assert!(out.points[0].value.is_nan());
        }

        /// Storage that hides its points from the first read only.
        struct LateStorage {
            inner: MockStorage,
            reads: AtomicUsize,
        }

        impl Storage for LateStorage {
            fn query<'a>(
                &'a self,
                id: u32,
                start: i64,
                end: i64,
                span: i64,
            ) -> BoxFuture<'a, claw_series::Result<Vec<Point>>> {
                Box::pin(async move {
                    if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Ok(Vec::new());
                    }
                    self.inner.query(id, start, end, span).await
                })
            }

            fn index<'a>(&'a self, request: &'a IndexRequest) -> BoxFuture<'a, claw_series::Result<Vec<Counter>>> {
                self.inner.index(request)
            }

            fn generate_and_set(&self, series: Series, size: usize, spans: &[i64]) -> u32 {
                self.inner.generate_and_set(series, size, spans)
            }

            fn get(&self, id: u32) -> Option<Arc<Series>> {
                self.inner.get(id)
            }

            fn retire(&self, live: &HashSet<u32>, before: Instant) -> usize {
                self.inner.retire(live, before)
            }
        }

        #[tokio::test]
        async fn test_real_point_beats_missing_marker() {
            let stg = LateStorage {
                inner: MockStorage::default(),
                reads: AtomicUsize::new(0),
            };
            let id = stg.inner.add_series("cpu", "h1", 10);
            stg.inner.set_points(id, vec![Point::new(10, 91.0), Point::new(20, 95.0)]);
            let mut e = execution(vec![nodata(10), happen(">", 90.0, 20, 2)]);
            e.operator = "or".to_string();
            let entity = ExecutionEntity::new(1, &e, "cpu").unwrap();

            // nodata saw nothing and marks slot 10; happen then read both points.
            let out = entity.run(&stg, id, 20, 10).await;
            assert_eq!(out.status, Status::Alert);
            assert_eq!(out.points, vec![Point::new(10, 91.0), Point::new(20, 95.0)]);
        }
    }
}
