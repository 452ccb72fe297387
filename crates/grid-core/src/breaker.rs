//! Dispatch circuit breaker.
//!
//! Counters are atomics so the hot dispatch path never takes a lock to record an outcome. The
//! `Open -> HalfOpen` transition is a compare-and-swap, which admits exactly one trial dispatch
//! per cool-down.
//!
//! Every admitted dispatch carries an [`Admission`] naming the breaker epoch it was admitted in.
//! The epoch advances each time the breaker opens or is reset, so outcomes of executions started
//! before that point are ignored: only dispatches of the current closed period count toward a
//! trip, and only the trial decides the half-open state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Ticket for one admitted dispatch; hand it back with the execution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    epoch: u64,
    trial: bool,
}

impl Admission {
    pub fn is_trial(self) -> bool {
        self.trial
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown_ms: i64,
    state: AtomicU8,
    epoch: AtomicU64,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown_ms: i64::try_from(cooldown.as_millis()).unwrap_or(i64::MAX),
            state: AtomicU8::new(CLOSED),
            epoch: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let opened_at = match state {
            CircuitState::Closed => None,
            _ => DateTime::from_timestamp_millis(self.opened_at_ms.load(Ordering::Acquire)),
        };
        CircuitSnapshot {
            state,
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            opened_at,
        }
    }

    /// Whether a dispatch would be admitted at `now`, without claiming the half-open trial.
    pub fn would_admit(&self, now: DateTime<Utc>) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED => true,
            OPEN => self.cooldown_elapsed(now),
            _ => false,
        }
    }

    /// Admit a dispatch attempt. In `Open`, the first caller after the cool-down moves the
    /// breaker to `HalfOpen` and becomes the single trial; everyone else is deferred.
    pub fn try_admit(&self, now: DateTime<Utc>) -> Option<Admission> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Some(Admission {
                epoch: self.epoch.load(Ordering::Acquire),
                trial: false,
            }),
            OPEN if self.cooldown_elapsed(now) => {
                self.state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .ok()?;
                tracing::info!(
                    event = "grid.breaker.half_open",
                    "circuit breaker cool-down elapsed; admitting trial dispatch"
                );
                Some(Admission {
                    epoch: self.epoch.load(Ordering::Acquire),
                    trial: true,
                })
            }
            _ => None,
        }
    }

    /// The dispatch reached a healthy downstream. Closes a half-open breaker when it was the
    /// trial; clears the failure streak when it belongs to the current closed period. Outcomes
    /// of dispatches admitted before the breaker last opened change nothing.
    pub fn record_success(&self, admission: Admission) {
        if !self.is_current(admission) {
            return;
        }
        if admission.trial {
            if self
                .state
                .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.consecutive_failures.store(0, Ordering::Release);
                tracing::info!(event = "grid.breaker.closed", "circuit breaker closed");
            }
        } else if self.state.load(Ordering::Acquire) == CLOSED {
            self.consecutive_failures.store(0, Ordering::Release);
        }
    }

    /// The dispatch failed because the downstream is unhealthy.
    pub fn record_failure(&self, admission: Admission, now: DateTime<Utc>) {
        if !self.is_current(admission) {
            return;
        }
        let expected = if admission.trial { HALF_OPEN } else { CLOSED };
        if self.state.load(Ordering::Acquire) != expected {
            return;
        }

        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        if !admission.trial && failures < self.failure_threshold {
            return;
        }

        if self
            .state
            .compare_exchange(expected, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            self.opened_at_ms
                .store(now.timestamp_millis(), Ordering::Release);
            tracing::warn!(
                event = "grid.breaker.opened",
                consecutive_failures = failures,
                cooldown_ms = self.cooldown_ms,
                "circuit breaker opened"
            );
        }
    }

    /// The dispatch ended without saying anything about downstream health (abandoned, or a
    /// failure caused by the task itself). A half-open trial slot is given back; the cool-down
    /// has already elapsed, so the next dispatch becomes the new trial.
    pub fn release(&self, admission: Admission) {
        if admission.trial && self.is_current(admission) {
            let _ = self
                .state
                .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Operator override: close the breaker and clear the failure streak. Executions admitted
    /// before the reset no longer affect the breaker.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.consecutive_failures.store(0, Ordering::Release);
        let prev = self.state.swap(CLOSED, Ordering::AcqRel);
        if prev != CLOSED {
            tracing::info!(event = "grid.breaker.closed", "circuit breaker reset");
        }
    }

    fn is_current(&self, admission: Admission) -> bool {
        admission.epoch == self.epoch.load(Ordering::Acquire)
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        now.timestamp_millis().saturating_sub(opened) >= self.cooldown_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    fn fail(b: &CircuitBreaker, now: DateTime<Utc>) {
        let admission = b.try_admit(now).expect("closed breaker admits");
        b.record_failure(admission, now);
    }

    #[test]
    fn opens_after_threshold_and_blocks_until_cooldown() {
        let b = CircuitBreaker::new(3, Duration::from_millis(1_000));
        fail(&b, at(0));
        fail(&b, at(1));
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_admit(at(2)).is_some());

        fail(&b, at(2));
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.would_admit(at(500)));
        assert!(b.try_admit(at(1_001)).is_none());

        assert!(b.would_admit(at(1_002)));
        assert!(b.try_admit(at(1_002)).is_some_and(Admission::is_trial));
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let b = CircuitBreaker::new(1, Duration::from_millis(10));
        fail(&b, at(0));
        assert!(b.try_admit(at(10)).is_some());
        assert!(b.try_admit(at(11)).is_none());
        assert!(!b.would_admit(at(11)));
    }

    #[test]
    fn trial_success_closes_and_resets() {
        let b = CircuitBreaker::new(2, Duration::from_millis(10));
        fail(&b, at(0));
        fail(&b, at(0));
        let trial = b.try_admit(at(10)).unwrap();
        b.record_success(trial);
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.opened_at.is_none());
    }

    #[test]
    fn trial_failure_reopens_and_restarts_cooldown() {
        let b = CircuitBreaker::new(2, Duration::from_millis(100));
        fail(&b, at(0));
        fail(&b, at(0));
        let trial = b.try_admit(at(100)).unwrap();
        b.record_failure(trial, at(150));
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.would_admit(at(200)));
        assert!(b.would_admit(at(250)));
    }

    #[test]
    fn released_trial_is_readmitted() {
        let b = CircuitBreaker::new(1, Duration::from_millis(10));
        fail(&b, at(0));
        let trial = b.try_admit(at(10)).unwrap();
        b.release(trial);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_admit(at(11)).is_some_and(Admission::is_trial));
    }

    #[test]
    fn late_success_from_before_the_trip_does_not_close() {
        let b = CircuitBreaker::new(1, Duration::from_millis(100));
        let slow = b.try_admit(at(0)).unwrap();
        fail(&b, at(1));
        assert_eq!(b.state(), CircuitState::Open);

        b.record_success(slow);
        assert_eq!(b.state(), CircuitState::Open);

        let trial = b.try_admit(at(101)).unwrap();
        b.record_success(slow);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success(trial);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn late_failure_does_not_preempt_the_running_trial() {
        let b = CircuitBreaker::new(1, Duration::from_millis(100));
        let slow = b.try_admit(at(0)).unwrap();
        fail(&b, at(1));
        let trial = b.try_admit(at(101)).unwrap();

        b.record_failure(slow, at(120));
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::HalfOpen);
        assert_eq!(snap.opened_at, Some(at(1)));

        b.record_failure(trial, at(130));
        assert_eq!(b.snapshot().opened_at, Some(at(130)));
    }

    #[test]
    fn reset_discards_outcomes_of_earlier_dispatches() {
        let b = CircuitBreaker::new(2, Duration::from_secs(60));
        let before = b.try_admit(at(0)).unwrap();
        fail(&b, at(0));
        b.reset();
        b.record_failure(before, at(1));
        assert_eq!(b.snapshot().consecutive_failures, 0);

        fail(&b, at(2));
        fail(&b, at(3));
        assert_eq!(b.state(), CircuitState::Open);
    }
}
