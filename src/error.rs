//! Error taxonomy shared across the pipeline (spec §7).
//!
//! Every failure a consumer can observe collapses into one of these kinds.
//! `is_retryable` is the single switch that decides whether a failure is
//! routed to the retry exchange or straight to the DLQ/process exit.

use thiserror::Error;

/// A single structural or range issue found by [`crate::codec::MessageCodec::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    EmptyData,
    InvalidDeviceId(String),
    TimeOutOfRange(i64),
    NonFinite { field: &'static str, index: Option<usize> },
    CoordinateOutOfRange { field: &'static str, index: usize, value: f64 },
    SpeedOutOfRange { index: usize, value: f64 },
    HeaderBodyDeviceMismatch,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyData => write!(f, "data must contain at least one point"),
            Self::InvalidDeviceId(d) => write!(f, "deviceId {d:?} is not 1..100 chars of [A-Za-z0-9_-]"),
            Self::TimeOutOfRange(t) => write!(f, "time {t} is outside [0, now+1y]"),
            Self::NonFinite { field, index: Some(i) } => write!(f, "{field}[{i}] is not finite"),
            Self::NonFinite { field, index: None } => write!(f, "{field} is not finite"),
            Self::CoordinateOutOfRange { field, index, value } => {
                write!(f, "data[{index}].{field} = {value} is out of range")
            }
            Self::SpeedOutOfRange { index, value } => {
                write!(f, "data[{index}].speed = {value} is out of range [0, 1000]")
            }
            Self::HeaderBodyDeviceMismatch => write!(f, "envelope header deviceId does not match body deviceId"),
        }
    }
}

/// Reasons an HMAC verification can fail (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("algorithm_mismatch")]
    AlgorithmMismatch,
    #[error("timestamp_skew")]
    TimestampSkew,
    #[error("nonce_format")]
    NonceFormat,
    #[error("signature_mismatch")]
    SignatureMismatch,
}

/// Top-level pipeline error taxonomy (spec §7). Only `retryable()` decides routing.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<ValidationIssue>),

    #[error("auth failed: {0}")]
    Auth(AuthFailure),

    /// Not actually an error outcome — ack, no further work. Kept as a
    /// variant so callers can pattern-match it alongside real errors.
    #[error("nonce already claimed")]
    NonceReplay,

    /// Not actually an error outcome — ack, no further work.
    #[error("idempotency key already present")]
    DuplicateIdempotencyKey,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("circuit open for operation {0}")]
    CircuitOpen(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Whether the consumer should route this failure through the retry
    /// exchange (true) or straight to the DLQ / treat as non-error (false).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transport(_) | PipelineError::Timeout(_) | PipelineError::CircuitOpen(_)
        )
    }

    /// Whether the failure should be surfaced to the DLQ with `x-error` set
    /// (validation/auth) as opposed to silently acked (dedup outcomes) or
    /// fatal at startup (configuration).
    pub fn is_dlq_terminal(&self) -> bool {
        matches!(self, PipelineError::Validation(_) | PipelineError::Auth(_))
    }
}
