//! Per-route circuit breakers.
//!
//! ```text
//! Closed   → Open      failures reach the threshold inside the failure window
//! Open     → HalfOpen  `open_until` has elapsed (checked lazily on the next acquire)
//! HalfOpen → Closed    the single probe succeeds (counters reset)
//! HalfOpen → Open      the single probe fails (`open_until` pushed forward)
//! ```
//!
//! Each breaker owns its own mutex; breakers of unrelated routes never contend. The
//! mutex is never held across an `.await`.
//!
//! Callers obtain a [`BreakerPermit`] and settle it with `record_success` or
//! `record_failure`. A permit dropped unsettled (the request was cancelled or failed
//! before reaching the backend for a reason that says nothing about its health) is not
//! counted; a dropped probe releases the half-open probe slot.
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use scc::{HashMap, hash_map::Entry};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::{config::CircuitBreakerSettings, metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// How failures are counted towards the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureWindow {
    /// Consecutive failures; any success resets the count.
    Consecutive,
    /// Failures observed within the trailing duration.
    Sliding(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub window: FailureWindow,
    pub open_duration: Duration,
}

impl BreakerPolicy {
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Result<Self, String> {
        if settings.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }
        let open_duration = humantime::parse_duration(&settings.open_duration)
            .map_err(|e| format!("Invalid open_duration '{}': {e}", settings.open_duration))?;
        let window = match &settings.sliding_window {
            Some(window) => FailureWindow::Sliding(
                humantime::parse_duration(window)
                    .map_err(|e| format!("Invalid sliding_window '{window}': {e}"))?,
            ),
            None => FailureWindow::Consecutive,
        };
        Ok(Self {
            failure_threshold: settings.failure_threshold,
            window,
            open_duration,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker '{name}' is {state:?}")]
pub struct CircuitOpenError {
    pub name: String,
    pub state: CircuitState,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    failure_times: VecDeque<Instant>,
    success_count: u64,
    last_transition: Instant,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_times: VecDeque::new(),
            success_count: 0,
            last_transition: now,
            open_until: None,
            probe_in_flight: false,
        }
    }

    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.failure_times.clear();
        self.success_count = 0;
    }

    fn failure_count(&self, window: FailureWindow) -> u32 {
        match window {
            FailureWindow::Consecutive => self.consecutive_failures,
            FailureWindow::Sliding(_) => self.failure_times.len() as u32,
        }
    }
}

/// Point-in-time view of a breaker for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub since_transition_ms: u128,
    pub open_remaining_ms: Option<u128>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: BreakerPolicy,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: BreakerPolicy) -> Self {
        let name = name.into();
        metrics::set_circuit_breaker_state(&name, CircuitState::Closed.as_gauge());
        Self {
            name,
            policy,
            inner: Mutex::new(BreakerState::new(Instant::now())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask permission to call the backend.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = inner.open_until.is_some_and(|until| now >= until);
                if !cooled_down {
                    return Err(self.rejection(CircuitState::Open));
                }
                self.transition(&mut inner, CircuitState::HalfOpen, now);
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.rejection(CircuitState::HalfOpen));
                }
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    fn rejection(&self, state: CircuitState) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            state,
        }
    }

    fn on_success(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                inner.open_until = None;
                inner.reset_counters();
                self.transition(&mut inner, CircuitState::Closed, now);
            }
            CircuitState::Closed => {
                inner.success_count += 1;
                if self.policy.window == FailureWindow::Consecutive {
                    inner.consecutive_failures = 0;
                }
            }
            // Late completions of calls admitted before the breaker tripped.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                inner.open_until = Some(now + self.policy.open_duration);
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Closed => {
                match self.policy.window {
                    FailureWindow::Consecutive => inner.consecutive_failures += 1,
                    FailureWindow::Sliding(window) => {
                        inner.failure_times.push_back(now);
                        while inner
                            .failure_times
                            .front()
                            .is_some_and(|t| now.duration_since(*t) > window)
                        {
                            inner.failure_times.pop_front();
                        }
                    }
                }
                let failures = inner.failure_count(self.policy.window);
                tracing::debug!(
                    breaker = %self.name,
                    failures,
                    threshold = self.policy.failure_threshold,
                    "Recorded backend failure"
                );
                if failures >= self.policy.failure_threshold {
                    inner.open_until = Some(now + self.policy.open_duration);
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_transition = now;
        metrics::set_circuit_breaker_state(&self.name, to.as_gauge());
        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                ?from,
                open_for = ?self.policy.open_duration,
                "Circuit breaker opened"
            ),
            _ => tracing::info!(breaker = %self.name, ?from, ?to, "Circuit breaker transition"),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count(self.policy.window),
            success_count: inner.success_count,
            since_transition_ms: now.duration_since(inner.last_transition).as_millis(),
            open_remaining_ms: inner
                .open_until
                .filter(|_| inner.state == CircuitState::Open)
                .map(|until| until.saturating_duration_since(now).as_millis()),
        }
    }
}

/// Permission to perform one backend call through a breaker.
#[must_use = "a permit must be settled with record_success or record_failure"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            tracing::debug!(breaker = %self.breaker.name, "Probe cancelled before completion");
            self.breaker.release_probe();
        }
    }
}

/// Breakers by name. Survives configuration reloads; a breaker is replaced only when
/// its policy changes.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, name: &str, policy: &BreakerPolicy) -> Arc<CircuitBreaker> {
        match self.breakers.entry_async(name.to_string()).await {
            Entry::Occupied(mut entry) => {
                if entry.get().policy() != policy {
                    tracing::info!(breaker = name, "Circuit breaker policy changed, resetting state");
                    *entry.get_mut() = Arc::new(CircuitBreaker::new(name, policy.clone()));
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let breaker = Arc::new(CircuitBreaker::new(name, policy.clone()));
                entry.insert_entry(breaker.clone());
                breaker
            }
        }
    }

    /// Drop breakers no longer referenced by any route. Returns the removed names.
    pub async fn retain_names(&self, names: &HashSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        self.breakers
            .retain_async(|name, _| {
                let keep = names.contains(name);
                if !keep {
                    removed.push(name.clone());
                }
                keep
            })
            .await;
        removed
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get_async(name)
            .await
            .map(|entry| entry.get().clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker, sorted by name.
    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots = Vec::new();
        let out = &mut snapshots;
        self.breakers
            .retain_async(|_, breaker| {
                out.push(breaker.snapshot());
                true
            })
            .await;
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(threshold: u32) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: threshold,
            window: FailureWindow::Consecutive,
            open_duration: Duration::from_secs(10),
        }
    }

    fn trip(breaker: &Arc<CircuitBreaker>, failures: u32) {
        for _ in 0..failures {
            breaker.try_acquire().unwrap().record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_consecutive_failures() {
        let breaker = Arc::new(CircuitBreaker::new("cb", policy(3)));

        trip(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        trip(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.try_acquire().err().unwrap();
        assert_eq!(err.state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = Arc::new(CircuitBreaker::new("cb", policy(3)));

        trip(&breaker, 2);
        breaker.try_acquire().unwrap().record_success();
        trip(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cool_down() {
        let breaker = Arc::new(CircuitBreaker::new("cb", policy(1)));
        trip(&breaker, 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one probe at a time
        let second = breaker.try_acquire().err().unwrap();
        assert_eq!(second.state, CircuitState::HalfOpen);

        probe.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = Arc::new(CircuitBreaker::new("cb", policy(1)));
        trip(&breaker, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // open_until was pushed forward from the probe failure
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.try_acquire().is_err());
        let remaining = breaker.snapshot().open_remaining_ms.unwrap();
        assert_eq!(remaining, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_closes_directly_from_open() {
        let breaker = Arc::new(CircuitBreaker::new("cb", policy(1)));
        let in_flight = breaker.try_acquire().unwrap();
        trip(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        // A call admitted before the trip completes successfully afterwards
        in_flight.record_success();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_is_not_counted() {
        let breaker = Arc::new(CircuitBreaker::new("cb", policy(1)));
        trip(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // The probe slot is free again
        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        probe.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_counts_recent_failures() {
        let breaker = Arc::new(CircuitBreaker::new(
            "cb",
            BreakerPolicy {
                failure_threshold: 2,
                window: FailureWindow::Sliding(Duration::from_secs(5)),
                open_duration: Duration::from_secs(10),
            },
        ));

        trip(&breaker, 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        // The first failure has left the window
        trip(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // A success does not erase failures inside the window
        breaker.try_acquire().unwrap().record_success();
        trip(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = CircuitBreakerSettings {
            failure_threshold: 3,
            sliding_window: Some("10s".to_string()),
            open_duration: "1m".to_string(),
        };
        let policy = BreakerPolicy::from_settings(&settings).unwrap();
        assert_eq!(policy.window, FailureWindow::Sliding(Duration::from_secs(10)));
        assert_eq!(policy.open_duration, Duration::from_secs(60));

        let invalid = CircuitBreakerSettings {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(BreakerPolicy::from_settings(&invalid).is_err());
    }

    #[tokio::test]
    async fn test_registry_keeps_state_until_policy_changes() {
        let registry = CircuitBreakerRegistry::new();
        let first = registry.get_or_create("productServiceCB", &policy(1)).await;
        trip(&first, 1);

        let same = registry.get_or_create("productServiceCB", &policy(1)).await;
        assert!(Arc::ptr_eq(&first, &same));
        assert_eq!(same.state(), CircuitState::Open);

        let replaced = registry.get_or_create("productServiceCB", &policy(5)).await;
        assert_eq!(replaced.state(), CircuitState::Closed);
        assert_eq!(registry.len(), 1);

        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "productServiceCB");
    }

    #[tokio::test]
    async fn test_retain_names_drops_unreferenced_breakers() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("productServiceCB", &policy(1)).await;
        registry.get_or_create("orderServiceCB", &policy(1)).await;

        let removed = registry
            .retain_names(&HashSet::from(["productServiceCB".to_string()]))
            .await;
        assert_eq!(removed, vec!["orderServiceCB".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("orderServiceCB").await.is_none());
        assert!(registry.get("productServiceCB").await.is_some());
    }
}
