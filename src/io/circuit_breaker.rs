//! Per-carrier circuit breaker
//!
//! Three states (Closed/Open/HalfOpen) driven by the failure ratio over a
//! rolling time window:
//! - Closed -> Open: at least `minimum_calls` outcomes in the window and the
//!   failure ratio reaches `failure_ratio`
//! - Open -> HalfOpen: `cooldown` elapsed; exactly one probe is let through
//! - HalfOpen -> Closed: probe succeeded
//! - HalfOpen -> Open: probe failed (cooldown restarts)
//!
//! One breaker is owned by each carrier client and shared by all of that
//! client's concurrent calls. Uses `tokio::time::Instant` so tests can drive
//! the cooldown with a paused clock.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure ratio in the window that opens the circuit (0.0..=1.0)
    pub failure_ratio: f64,
    pub window_secs: u64,
    /// Fewer outcomes than this in the window never open the circuit
    pub minimum_calls: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_ratio: 0.5, window_secs: 60, minimum_calls: 5, cooldown_secs: 60 }
    }
}

struct Inner {
    state: CircuitState,
    /// (recorded_at, failed) for calls made while closed
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    failure_ratio: f64,
    window: Duration,
    minimum_calls: usize,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_ratio: config.failure_ratio,
            window: Duration::from_secs(config.window_secs),
            minimum_calls: config.minimum_calls.max(1) as usize,
            cooldown: Duration::from_secs(config.cooldown_secs),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to make one call.
    ///
    /// Returns `None` when the call must be rejected locally. The returned
    /// permit must be resolved with `success` or `failure`; dropping it
    /// unresolved counts as a failure.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(CallPermit::new(self, false)),
            CircuitState::Open => {
                let cooled = inner.opened_at.is_none_or(|at| at.elapsed() >= self.cooldown);
                if !cooled {
                    debug!(carrier = %self.name, "circuit_rejected");
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(carrier = %self.name, "circuit_half_open");
                Some(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    debug!(carrier = %self.name, "circuit_rejected_probe_in_flight");
                    return None;
                }
                inner.probe_in_flight = true;
                Some(CallPermit::new(self, true))
            }
        }
    }

    fn record(&self, probe: bool, failed: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if probe {
            inner.probe_in_flight = false;
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            if failed {
                self.open(&mut inner, now);
                warn!(carrier = %self.name, "circuit_probe_failed");
            } else {
                inner.state = CircuitState::Closed;
                inner.outcomes.clear();
                inner.opened_at = None;
                info!(carrier = %self.name, "circuit_closed");
            }
            return;
        }

        // Late outcomes of calls admitted before the circuit opened are ignored
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.outcomes.push_back((now, failed));
        while inner.outcomes.front().is_some_and(|(at, _)| now.duration_since(*at) > self.window) {
            inner.outcomes.pop_front();
        }

        let total = inner.outcomes.len();
        let failures = inner.outcomes.iter().filter(|(_, f)| *f).count();
        if total >= self.minimum_calls && failures as f64 / total as f64 >= self.failure_ratio {
            self.open(&mut inner, now);
            warn!(carrier = %self.name, failures = %failures, calls = %total, "circuit_opened");
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.outcomes.clear();
    }
}

/// Admission ticket for one call through the breaker
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self { breaker, probe, resolved: false }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record(self.probe, false);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record(self.probe, true);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.record(self.probe, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("Acme", &CircuitBreakerConfig::default())
    }

    fn fail(cb: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            cb.try_acquire().expect("closed circuit admits calls").failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failure_ratio_reached() {
        let cb = breaker();
        fail(&cb, 4);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_closed_below_ratio() {
        let cb = breaker();
        for i in 0..10 {
            let permit = cb.try_acquire().unwrap();
            if i % 3 == 0 {
                permit.failure();
            } else {
                permit.success();
            }
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_outcomes_leave_the_window() {
        let cb = breaker();
        fail(&cb, 4);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cooldown() {
        let cb = breaker();
        fail(&cb, 5);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cb.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = cb.try_acquire().expect("probe allowed after cooldown");
        assert!(probe.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_none(), "only one probe in flight");

        probe.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breaker();
        fail(&cb, 5);
        tokio::time::advance(Duration::from_secs(60)).await;

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_counts_as_failure() {
        let cb = breaker();
        fail(&cb, 5);
        tokio::time::advance(Duration::from_secs(60)).await;

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcome_while_open_is_ignored() {
        let cb = breaker();
        let straggler = cb.try_acquire().unwrap();
        fail(&cb, 5);
        assert_eq!(cb.state(), CircuitState::Open);

        straggler.success();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
