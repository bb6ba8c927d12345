//! ShutdownCoordinator (spec §4.12, §5): cancel intake, drain in-flight
//! work within a grace period, then close broker/store handles. Mirrors
//! the cancellable-sleep / `CancellationToken` pattern the ecosystem uses
//! for cooperative shutdown rather than hard-aborting tasks.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tracks in-flight worker count with an atomic integer (spec §5's
/// "Consumer in-flight counter ↔ ShutdownCoordinator" shared resource).
#[derive(Clone)]
pub struct InFlightGuard {
    counter: Arc<AtomicI64>,
}

impl InFlightGuard {
    fn new(counter: Arc<AtomicI64>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    in_flight: Arc<AtomicI64>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self { token: CancellationToken::new(), in_flight: Arc::new(AtomicI64::new(0)), grace_period }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Called by a worker right before it starts processing a delivery;
    /// the returned guard decrements the in-flight counter on drop,
    /// whether the worker finished normally or was cancelled.
    pub fn enter(&self) -> InFlightGuard {
        InFlightGuard::new(self.in_flight.clone())
    }

    pub fn in_flight_count(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// (1) cancels intake, (2) waits up to `grace_period` for in-flight
    /// workers to drain, (3) returns whether the drain completed cleanly
    /// or timed out (callers nack-requeue anything still in flight).
    pub async fn shutdown(&self) -> ShutdownOutcome {
        info!("shutdown signal received, cancelling intake");
        self.token.cancel();

        let drained = timeout(self.grace_period, self.wait_for_drain()).await.is_ok();
        if drained {
            info!("all in-flight work drained cleanly");
            ShutdownOutcome::DrainedCleanly
        } else {
            let remaining = self.in_flight_count();
            warn!(remaining, "grace period elapsed with work still in flight, abandoning");
            ShutdownOutcome::GracePeriodExceeded { remaining: remaining.max(0) as usize }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            if self.in_flight_count() <= 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    DrainedCleanly,
    GracePeriodExceeded { remaining: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_with_no_in_flight_work_drains_immediately() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(200));
        let outcome = coordinator.shutdown().await;
        assert_eq!(outcome, ShutdownOutcome::DrainedCleanly);
        assert!(coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_guard_to_drop() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(500));
        let guard = coordinator.enter();
        assert_eq!(coordinator.in_flight_count(), 1);

        let coordinator_clone_token = coordinator.token();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
            coordinator_clone_token
        });

        let outcome = coordinator.shutdown().await;
        handle.await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::DrainedCleanly);
    }

    #[tokio::test]
    async fn shutdown_exceeding_grace_period_reports_remaining_count() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let _guard = coordinator.enter(); // never dropped before the grace period elapses
        let outcome = coordinator.shutdown().await;
        assert_eq!(outcome, ShutdownOutcome::GracePeriodExceeded { remaining: 1 });
    }

    #[tokio::test]
    async fn token_cancellation_is_observable_by_a_cloned_token() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let child_token = coordinator.token();
        assert!(!child_token.is_cancelled());
        coordinator.shutdown().await;
        assert!(child_token.is_cancelled());
    }
}
