//! Structured pipeline counters, same idiom as the ingestion server's own
//! `Metrics` struct: one `AtomicU64` per observable event, exposed as a
//! flat JSON object for the `/metrics` endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub struct PipelineMetrics {
    received: AtomicU64,
    auth_failed: AtomicU64,
    nonce_replayed: AtomicU64,
    validation_failed: AtomicU64,
    duplicate_idempotency_key: AtomicU64,
    processed_ok: AtomicU64,
    retried: AtomicU64,
    dlq_terminal: AtomicU64,
    dlq_replayed: AtomicU64,
    dlq_parked: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            auth_failed: AtomicU64::new(0),
            nonce_replayed: AtomicU64::new(0),
            validation_failed: AtomicU64::new(0),
            duplicate_idempotency_key: AtomicU64::new(0),
            processed_ok: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dlq_terminal: AtomicU64::new(0),
            dlq_replayed: AtomicU64::new(0),
            dlq_parked: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_auth_failed(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_nonce_replayed(&self) {
        self.nonce_replayed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_validation_failed(&self) {
        self.validation_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_duplicate_idempotency_key(&self) {
        self.duplicate_idempotency_key.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_processed_ok(&self) {
        self.processed_ok.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_dlq_terminal(&self) {
        self.dlq_terminal.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_dlq_replayed(&self) {
        self.dlq_replayed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_dlq_parked(&self) {
        self.dlq_parked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            nonce_replayed: self.nonce_replayed.load(Ordering::Relaxed),
            validation_failed: self.validation_failed.load(Ordering::Relaxed),
            duplicate_idempotency_key: self.duplicate_idempotency_key.load(Ordering::Relaxed),
            processed_ok: self.processed_ok.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dlq_terminal: self.dlq_terminal.load(Ordering::Relaxed),
            dlq_replayed: self.dlq_replayed.load(Ordering::Relaxed),
            dlq_parked: self.dlq_parked.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub auth_failed: u64,
    pub nonce_replayed: u64,
    pub validation_failed: u64,
    pub duplicate_idempotency_key: u64,
    pub processed_ok: u64,
    pub retried: u64,
    pub dlq_terminal: u64,
    pub dlq_replayed: u64,
    pub dlq_parked: u64,
}
