//! Per-series alert state machine.
//!
//! [`AlertPointDriver`] turns a stream of per-slot verdicts into at most one
//! event per state transition. It only records alerting and recovered slots;
//! slots without a verdict leave it untouched.
//!
//! Alert and recover timestamps are kept in two lists of which at most one is
//! non-empty: a polarity flip clears the opposite list. The last emitted event
//! is tracked separately from the last verdict, so an alerted series does not
//! alert again before a recovery was emitted, and recoveries are only counted
//! while an alert is outstanding. The rate limit only ever suppresses.

use serde::Serialize;
use tracing::debug;

use crate::error::{JudgeError, Result};
use crate::schema::StrategyAlert;
use crate::types::{EventCode, Status};

/// Result of [`AlertPointDriver::happen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Happened {
    /// The verdict was accepted; its evidence may be kept.
    pub valid: bool,
    /// Evidence gathered so far belongs to a stale polarity and must be dropped.
    pub changed: bool,
}

/// Result of [`AlertPointDriver::dump_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dumped {
    /// Event to emit.
    pub code: EventCode,
    /// An alert was suppressed by the rate limit; its evidence must be dropped.
    pub clean: bool,
}

/// Hysteresis and rate limiting of one series (or one series tuple).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertPointDriver {
    alert_timestamps: Vec<i64>,
    last_alert: i64,
    recover_timestamps: Vec<i64>,
    last_recover: i64,
    last_status: Status,
    event_alert_timestamps: Vec<i64>,
    last_event: EventCode,
    thresholds: StrategyAlert,
}

fn validate(alert: &StrategyAlert) -> Result<()> {
    if alert.alert_count_threshold <= 0 && alert.alert_duration_threshold <= 0 {
        return Err(JudgeError::InvalidAlert {
            reason: "alert threshold illegal".to_string(),
        });
    }
    // A zero recover duration is allowed: any recovery clears.
    if alert.recover_count_threshold <= 0 && alert.recover_duration_threshold < 0 {
        return Err(JudgeError::InvalidAlert {
            reason: "recover threshold illegal".to_string(),
        });
    }
    Ok(())
}

impl AlertPointDriver {
    /// Creates a driver in the recovered state.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::InvalidAlert` if the thresholds can never alert or never recover.
    pub fn new(alert: &StrategyAlert) -> Result<Self> {
        validate(alert)?;
        Ok(Self {
            alert_timestamps: Vec::new(),
            last_alert: 0,
            recover_timestamps: Vec::new(),
            last_recover: 0,
            last_status: Status::Recover,
            event_alert_timestamps: Vec::new(),
            last_event: EventCode::Recover,
            thresholds: *alert,
        })
    }

    /// Replaces the thresholds, keeping the recorded state.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::InvalidAlert` and keeps the old thresholds if the new ones are unusable.
    pub fn set_threshold(&mut self, alert: &StrategyAlert) -> Result<()> {
        validate(alert)?;
        self.thresholds = *alert;
        Ok(())
    }

    /// Returns the thresholds in use.
    #[must_use]
    pub const fn thresholds(&self) -> &StrategyAlert {
        &self.thresholds
    }

    /// Returns the last emitted event.
    #[must_use]
    pub const fn last_event(&self) -> EventCode {
        self.last_event
    }

    /// Returns the number of pending alert and recover slots.
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        (self.alert_timestamps.len(), self.recover_timestamps.len())
    }

    /// Records the verdict of slot `ts`.
    ///
    /// Only `Alert` and `Recover` are recorded. A timestamp not newer than the
    /// last accepted one of the same polarity is rejected without touching state.
    pub fn happen(&mut self, ts: i64, status: Status) -> Happened {
        match status {
            Status::Recover => {
                if ts <= self.last_recover {
                    debug!(last = self.last_recover, ts, "driver rejected recover");
                    return Happened::default();
                }
                let mut changed = false;
                if self.last_status != Status::Recover {
                    self.last_status = Status::Recover;
                    self.alert_timestamps.clear();
                    changed = true;
                }
                self.last_recover = ts;
                // Already recovered: nothing to count, but the evidence is stale.
                if self.last_event == EventCode::Recover {
                    return Happened {
                        valid: true,
                        changed: true,
                    };
                }
                self.recover_timestamps.push(ts);
                Happened { valid: true, changed }
            }
            Status::Alert => {
                if ts <= self.last_alert {
                    debug!(last = self.last_alert, ts, "driver rejected alert");
                    return Happened::default();
                }
                let mut changed = false;
                if self.last_status != Status::Alert {
                    self.last_status = Status::Alert;
                    self.recover_timestamps.clear();
                    changed = true;
                }
                self.alert_timestamps.push(ts);
                self.last_alert = ts;
                Happened { valid: true, changed }
            }
            Status::Empty | Status::Null | Status::Init => Happened::default(),
        }
    }

    /// Decides whether an event is due at `now`.
    ///
    /// `now` is the slot being judged, not wall-clock time. Duration thresholds
    /// are shortened by `interval` because slots are aligned to window starts.
    pub fn dump_event(&mut self, now: i64, interval: i64) -> Dumped {
        let shift = interval.max(0);
        let t = self.thresholds;
        let mut code = EventCode::Null;
        let mut clean = false;

        if let Some(&first) = self.alert_timestamps.first() {
            let by_count =
                t.alert_count_threshold > 0 && self.alert_timestamps.len() as i64 >= t.alert_count_threshold;
            let by_duration =
                t.alert_duration_threshold > 0 && now - first >= t.alert_duration_threshold - shift;
            if by_count || by_duration {
                // Slots that raised this alert are used up.
                self.alert_timestamps.clear();

                let limited = t.limit_count_threshold > 0 && t.limit_duration_threshold > 0;
                if limited {
                    let horizon = now - (t.limit_duration_threshold - shift);
                    self.event_alert_timestamps.retain(|ts| *ts > horizon);
                }
                let capped = limited && self.event_alert_timestamps.len() as i64 >= t.limit_count_threshold;
                if self.last_event == EventCode::Alert || capped {
                    // Already alerted, or over the rate limit: the evidence is dropped.
                    clean = true;
                } else {
                    if limited {
                        self.event_alert_timestamps.push(self.last_alert);
                    }
                    code = EventCode::Alert;
                    self.last_event = EventCode::Alert;
                }
            }
        }

        let recover_first = self.recover_timestamps.first().copied();
        if let (EventCode::Alert, Some(first)) = (self.last_event, recover_first) {
            let by_count = t.recover_count_threshold > 0
                && self.recover_timestamps.len() as i64 >= t.recover_count_threshold;
            let by_duration =
                t.recover_duration_threshold > 0 && now - first >= t.recover_duration_threshold - shift;
            let immediate = t.recover_count_threshold == 0 && t.recover_duration_threshold == 0;
            if by_count || by_duration || immediate {
                self.recover_timestamps.clear();
                // A recovery restarts the rate limit.
                self.event_alert_timestamps.clear();
                code = EventCode::Recover;
                self.last_event = EventCode::Recover;
            }
        }

        if self.last_event == EventCode::Recover {
            self.recover_timestamps.clear();
        }

        Dumped { code, clean }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn alert(count: i64, recover_count: i64) -> StrategyAlert {
        StrategyAlert {
            alert_count_threshold: count,
            recover_count_threshold: recover_count,
            ..StrategyAlert::default()
        }
    }

    mod construction_tests {
        use super::*;

        #[test]
        fn test_rejects_unreachable_alert() {
            assert!(AlertPointDriver::new(&StrategyAlert::default()).is_err());
        }

        #[test]
        fn test_rejects_unreachable_recover() {
            let a = StrategyAlert {
                alert_count_threshold: 1,
                recover_duration_threshold: -1,
                ..StrategyAlert::default()
            };
            assert!(AlertPointDriver::new(&a).is_err());
        }

        #[test]
        fn test_set_threshold_keeps_old_on_error() {
            let mut d = AlertPointDriver::new(&alert(2, 1)).unwrap();
            assert!(d.set_threshold(&StrategyAlert::default()).is_err());
            assert_eq!(d.thresholds().alert_count_threshold, 2);
            d.set_threshold(&alert(3, 1)).unwrap();
            assert_eq!(d.thresholds().alert_count_threshold, 3);
        }
    }

    mod happen_tests {
        use super::*;

        #[test]
        fn test_rejects_stale_timestamps() {
            let mut d = AlertPointDriver::new(&alert(3, 1)).unwrap();
            assert!(d.happen(20, Status::Alert).valid);
            let before = d.clone();
            assert_eq!(d.happen(20, Status::Alert), Happened::default());
            assert_eq!(d.happen(10, Status::Alert), Happened::default());
            assert_eq!(d, before);
        }

        #[test]
        fn test_flip_clears_opposite() {
            let mut d = AlertPointDriver::new(&alert(1, 5)).unwrap();
            d.happen(10, Status::Alert);
            assert_eq!(d.dump_event(10, 10).code, EventCode::Alert);
            d.happen(20, Status::Recover);
            d.happen(30, Status::Recover);
            assert_eq!(d.pending(), (0, 2));
            let h = d.happen(40, Status::Alert);
            assert!(h.valid && h.changed);
            assert_eq!(d.pending(), (1, 0));
        }

        #[test]
        fn test_recover_while_recovered_is_not_counted() {
            let mut d = AlertPointDriver::new(&alert(1, 1)).unwrap();
            let h = d.happen(10, Status::Recover);
            assert!(h.valid && h.changed);
            assert_eq!(d.pending(), (0, 0));
        }

        #[test]
        fn test_unsettled_status_ignored() {
            let mut d = AlertPointDriver::new(&alert(1, 1)).unwrap();
            assert_eq!(d.happen(10, Status::Null), Happened::default());
            assert_eq!(d.happen(10, Status::Empty), Happened::default());
            assert_eq!(d.pending(), (0, 0));
        }
    }

    mod dump_tests {
        use super::*;

        #[test]
        fn test_alert_by_count_then_recover() {
            let mut d = AlertPointDriver::new(&alert(2, 1)).unwrap();
            d.happen(10, Status::Alert);
            assert_eq!(d.dump_event(10, 10).code, EventCode::Null);
            d.happen(20, Status::Alert);
            assert_eq!(d.dump_event(20, 10).code, EventCode::Alert);
            assert_eq!(d.pending(), (0, 0));

            d.happen(30, Status::Recover);
            assert_eq!(d.dump_event(30, 10).code, EventCode::Recover);
            assert_eq!(d.last_event(), EventCode::Recover);
        }

        #[test]
        fn test_alert_by_duration() {
            let a = StrategyAlert {
                alert_duration_threshold: 30,
                recover_count_threshold: 1,
                ..StrategyAlert::default()
            };
            let mut d = AlertPointDriver::new(&a).unwrap();
            d.happen(10, Status::Alert);
            d.happen(20, Status::Alert);
            assert_eq!(d.dump_event(20, 10).code, EventCode::Null);
            d.happen(30, Status::Alert);
            // 30 - 10 >= 30 - 10
            assert_eq!(d.dump_event(30, 10).code, EventCode::Alert);
        }

        #[test]
        fn test_zero_recover_thresholds_clear_immediately() {
            let mut d = AlertPointDriver::new(&alert(1, 0)).unwrap();
            d.happen(10, Status::Alert);
            assert_eq!(d.dump_event(10, 10).code, EventCode::Alert);
            d.happen(20, Status::Recover);
            assert_eq!(d.dump_event(20, 10).code, EventCode::Recover);
        }

        #[test]
        fn test_recover_by_duration() {
            let a = StrategyAlert {
                alert_count_threshold: 1,
                recover_duration_threshold: 60,
                ..StrategyAlert::default()
            };
            let mut d = AlertPointDriver::new(&a).unwrap();
            d.happen(10, Status::Alert);
            d.dump_event(10, 10);
            for ts in [20, 30, 40, 50, 60] {
                d.happen(ts, Status::Recover);
                assert_eq!(d.dump_event(ts, 10).code, EventCode::Null, "ts {ts}");
            }
            d.happen(70, Status::Recover);
            assert_eq!(d.dump_event(70, 10).code, EventCode::Recover);
        }

        #[test]
        fn test_no_realert_without_limit() {
            let mut d = AlertPointDriver::new(&alert(1, 1)).unwrap();
            d.happen(10, Status::Alert);
            assert_eq!(d.dump_event(10, 10).code, EventCode::Alert);
            d.happen(20, Status::Alert);
            let dumped = d.dump_event(20, 10);
            assert_eq!(dumped.code, EventCode::Null);
            assert!(dumped.clean);
            assert_eq!(d.pending(), (0, 0));

            // Only a recovery re-arms the alert.
            d.happen(30, Status::Recover);
            assert_eq!(d.dump_event(30, 10).code, EventCode::Recover);
            d.happen(40, Status::Alert);
            assert_eq!(d.dump_event(40, 10).code, EventCode::Alert);
        }

        #[test]
        fn test_rate_limit_suppresses_second_alert() {
            let a = StrategyAlert {
                alert_count_threshold: 1,
                recover_count_threshold: 1,
                limit_count_threshold: 1,
                limit_duration_threshold: 300,
                ..StrategyAlert::default()
            };
            let mut d = AlertPointDriver::new(&a).unwrap();
            d.happen(1000, Status::Alert);
            assert_eq!(d.dump_event(1000, 10).code, EventCode::Alert);
            d.happen(1060, Status::Alert);
            let dumped = d.dump_event(1060, 10);
            assert_eq!(dumped.code, EventCode::Null);
            assert!(dumped.clean);

            // Past the window the series is still alerted.
            d.happen(1400, Status::Alert);
            assert_eq!(d.dump_event(1400, 10).code, EventCode::Null);
        }

        #[test]
        fn test_recovery_resets_rate_limit() {
            let a = StrategyAlert {
                alert_count_threshold: 1,
                recover_count_threshold: 1,
                limit_count_threshold: 1,
                limit_duration_threshold: 300,
                ..StrategyAlert::default()
            };
            let mut d = AlertPointDriver::new(&a).unwrap();
            d.happen(1000, Status::Alert);
            d.dump_event(1000, 10);
            d.happen(1010, Status::Recover);
            assert_eq!(d.dump_event(1010, 10).code, EventCode::Recover);
            d.happen(1020, Status::Alert);
            assert_eq!(d.dump_event(1020, 10).code, EventCode::Alert);
        }
    }

    mod property_tests {
        use super::*;

        fn verdict() -> impl Strategy<Value = Status> {
            prop_oneof![
                Just(Status::Alert),
                Just(Status::Recover),
                Just(Status::Null),
                Just(Status::Empty),
            ]
        }

        proptest! {
            #[test]
            fn stale_timestamps_never_change_state(
                steps in proptest::collection::vec((0i64..50, verdict()), 1..60),
            ) {
                let mut d = AlertPointDriver::new(&alert(2, 2)).unwrap();
                for (ts, status) in steps {
                    let before = d.clone();
                    let last = match status {
                        Status::Alert => before.last_alert,
                        Status::Recover => before.last_recover,
                        _ => i64::MAX,
                    };
                    let h = d.happen(ts * 10, status);
                    if ts * 10 <= last {
                        prop_assert!(!h.valid);
                        prop_assert_eq!(&d, &before);
                    }
                    d.dump_event(ts * 10, 10);
                }
            }

            #[test]
            fn lists_are_mutually_exclusive(
                steps in proptest::collection::vec((1i64..100, verdict()), 1..80),
                count in 1i64..4,
                recover in 0i64..4,
            ) {
                let mut d = AlertPointDriver::new(&alert(count, recover)).unwrap();
                for (ts, status) in steps {
                    d.happen(ts * 10, status);
                    let (a, r) = d.pending();
                    prop_assert!(a == 0 || r == 0);
                    d.dump_event(ts * 10, 10);
                    let (a, r) = d.pending();
                    prop_assert!(a == 0 || r == 0);
                }
            }

            #[test]
            fn alerts_never_exceed_flips(
                statuses in proptest::collection::vec(verdict(), 1..80),
                count in 1i64..3,
                recover in 0i64..3,
                limit_count in 0i64..3,
                limit_duration in prop_oneof![Just(0i64), 10i64..600],
            ) {
                let a = StrategyAlert {
                    alert_count_threshold: count,
                    recover_count_threshold: recover,
                    limit_count_threshold: limit_count,
                    limit_duration_threshold: limit_duration,
                    ..StrategyAlert::default()
                };
                let mut d = AlertPointDriver::new(&a).unwrap();
                let mut flips = 0;
                let mut alerts = 0;
                let mut polarity = Status::Recover;
                for (i, status) in statuses.into_iter().enumerate() {
                    let ts = (i as i64 + 1) * 10;
                    if status == Status::Alert && polarity != Status::Alert {
                        flips += 1;
                    }
                    if status.is_settled() && status != Status::Empty {
                        polarity = status;
                    }
                    d.happen(ts, status);
                    if d.dump_event(ts, 10).code == EventCode::Alert {
                        alerts += 1;
                    }
                }
                prop_assert!(alerts <= flips);
            }
        }
    }
}
