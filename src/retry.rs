//! RetryPolicy / CircuitBreaker (spec §4.7): shared backoff math and a
//! keyed circuit-breaker registry. The spec explicitly unifies what the
//! source treated as two separate circuit breakers into one registry
//! (spec §9) — every caller looks an operation name up in the same map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, initial_delay_ms: 500, max_delay_ms: 30_000, multiplier: 2.0, jitter: true }
    }
}

const MIN_DELAY_MS: u64 = 100;

impl RetryPolicy {
    /// `attempt` is 0-indexed. Delay = `min(initialDelay * multiplier^attempt, maxDelay)`,
    /// floored at 100 ms, then jittered ±20% if enabled (spec §4.7).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let bounded = raw.min(self.max_delay_ms as f64).max(MIN_DELAY_MS as f64);

        let millis = if self.jitter {
            let spread = bounded * 0.2;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (bounded + offset).max(MIN_DELAY_MS as f64)
        } else {
            bounded
        };

        Duration::from_millis(millis.round() as u64)
    }

    /// Backoff delay for DLQReplayer (spec §4.11): `min(60_000 * 2^retryCount, 300_000)` ms.
    pub fn dlq_replay_delay_ms(retry_count: u32) -> u64 {
        let raw = 60_000u64.saturating_mul(1u64 << retry_count.min(32));
        raw.min(300_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self { state: CircuitState::Closed, failure_count: 0, opened_at: None }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout: Duration::from_secs(30) }
    }
}

/// Keyed circuit-breaker registry (spec §9: one object, not two). Each
/// logical operation name maps to an independent `CLOSED/OPEN/HALF_OPEN`
/// state machine guarded by a single mutex, mirroring the "protected by a
/// mutex; reads and writes serialized" rule in spec §5.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Admit,
    Rejected,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    /// Call before attempting `operation`. `Rejected` means short-circuit
    /// with `PipelineError::CircuitOpen` without attempting the call.
    ///
    /// HALF_OPEN admits exactly one trial call (spec §4.7): the admit that
    /// transitions OPEN -> HALF_OPEN is that trial, so a `HalfOpen` entry
    /// rejects every further `try_admit` until `record_success` or
    /// `record_failure` resolves it.
    pub fn try_admit(&self, operation: &str) -> AdmitDecision {
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        let entry = breakers.entry(operation.to_string()).or_insert_with(BreakerState::new);

        match entry.state {
            CircuitState::Closed => AdmitDecision::Admit,
            CircuitState::HalfOpen => AdmitDecision::Rejected,
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|t| Utc::now() - t).unwrap_or_default();
                if elapsed.to_std().unwrap_or(Duration::ZERO) >= self.config.open_timeout {
                    entry.state = CircuitState::HalfOpen;
                    AdmitDecision::Admit
                } else {
                    AdmitDecision::Rejected
                }
            }
        }
    }

    pub fn record_success(&self, operation: &str) {
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        let entry = breakers.entry(operation.to_string()).or_insert_with(BreakerState::new);
        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.opened_at = None;
    }

    pub fn record_failure(&self, operation: &str) {
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        let entry = breakers.entry(operation.to_string()).or_insert_with(BreakerState::new);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Utc::now());
                entry.failure_count = 0;
            }
            CircuitState::Closed => {
                entry.failure_count += 1;
                if entry.failure_count >= self.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Utc::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state_of(&self, operation: &str) -> CircuitState {
        self.breakers.lock().expect("circuit breaker lock poisoned").get(operation).map(|b| b.state).unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_bounded_above_by_max_delay() {
        let policy = RetryPolicy { jitter: false, ..RetryPolicy::default() };
        for attempt in 0..20 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay.as_millis() as u64 <= policy.max_delay_ms);
        }
    }

    #[test]
    fn delay_is_non_decreasing_without_jitter() {
        let policy = RetryPolicy { jitter: false, ..RetryPolicy::default() };
        let mut previous = 0;
        for attempt in 0..10 {
            let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn delay_is_floored_at_100ms() {
        let policy = RetryPolicy { initial_delay_ms: 1, multiplier: 1.0, jitter: false, ..RetryPolicy::default() };
        assert!(policy.delay_for_attempt(0).as_millis() >= 100);
    }

    #[test]
    fn dlq_replay_delay_for_retry_count_two() {
        // spec §8 scenario 7: retryCount=2 -> 60_000 * 2^2 = 240_000ms.
        assert_eq!(RetryPolicy::dlq_replay_delay_ms(2), 240_000);
    }

    #[test]
    fn dlq_replay_delay_caps_at_300_000() {
        assert_eq!(RetryPolicy::dlq_replay_delay_ms(10), 300_000);
    }

    #[test]
    fn breaker_trips_after_threshold_failures_and_rejects() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig { failure_threshold: 2, open_timeout: Duration::from_secs(60) });
        assert_eq!(registry.try_admit("op"), AdmitDecision::Admit);
        registry.record_failure("op");
        assert_eq!(registry.try_admit("op"), AdmitDecision::Admit);
        registry.record_failure("op");
        assert_eq!(registry.try_admit("op"), AdmitDecision::Rejected);
        assert_eq!(registry.state_of("op"), CircuitState::Open);
    }

    #[test]
    fn breaker_resets_to_closed_on_success() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig { failure_threshold: 1, open_timeout: Duration::from_secs(60) });
        registry.record_failure("op");
        assert_eq!(registry.state_of("op"), CircuitState::Open);
        // half-open requires timeout elapsed; simulate via record_success directly after a trial admit in half-open
        registry.record_success("op");
        assert_eq!(registry.state_of("op"), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_the_circuit() {
        let registry =
            CircuitBreakerRegistry::new(CircuitBreakerConfig { failure_threshold: 1, open_timeout: Duration::from_millis(0) });
        registry.record_failure("op");
        assert_eq!(registry.try_admit("op"), AdmitDecision::Admit); // timeout elapsed instantly -> half-open
        assert_eq!(registry.state_of("op"), CircuitState::HalfOpen);
        registry.record_failure("op");
        assert_eq!(registry.state_of("op"), CircuitState::Open);
    }

    #[test]
    fn half_open_admits_exactly_one_trial_call_concurrently() {
        let registry =
            CircuitBreakerRegistry::new(CircuitBreakerConfig { failure_threshold: 1, open_timeout: Duration::from_millis(0) });
        registry.record_failure("op");
        // First caller after the timeout gets the trial slot...
        assert_eq!(registry.try_admit("op"), AdmitDecision::Admit);
        assert_eq!(registry.state_of("op"), CircuitState::HalfOpen);
        // ...every other concurrent caller is rejected until the trial resolves.
        assert_eq!(registry.try_admit("op"), AdmitDecision::Rejected);
        assert_eq!(registry.try_admit("op"), AdmitDecision::Rejected);
        registry.record_success("op");
        assert_eq!(registry.try_admit("op"), AdmitDecision::Admit);
    }

    #[test]
    fn independent_operations_have_independent_breaker_state() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig { failure_threshold: 1, open_timeout: Duration::from_secs(60) });
        registry.record_failure("store.put");
        assert_eq!(registry.state_of("store.put"), CircuitState::Open);
        assert_eq!(registry.state_of("repo.insert"), CircuitState::Closed);
    }
}
