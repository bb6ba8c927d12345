//! Config (spec §6 configuration-keys table). Loaded once at startup from
//! environment variables with the same `env::var(...).ok().and_then(...)
//! .unwrap_or(default)` idiom the ingestion server already uses for `PORT`
//! and `RUST_LOG`, generalized into one struct so the rest of the crate
//! never touches `std::env` directly.

use std::time::Duration;

use crate::error::PipelineError;
use crate::model::HmacAlgorithm;

/// Which backend to construct for a store that can run either in-memory
/// (spec §4.3/§4.4 both call their in-memory default "acceptable only for
/// tests") or on disk.
///
/// Spec §6 lists `store.backend` as `gridfs` | `s3-compatible` — both
/// require a database/object-store driver absent from the teacher's and
/// the rest of the retrieved pack's dependency stack. Rather than
/// fabricate a dependency on one, this implementation exposes the two
/// backends it can actually satisfy behind the same [`crate::raw_store::RawStore`]
/// / [`crate::nonce::NonceStore`] trait boundaries; swapping in a real
/// gridfs/s3/redis client later is a new implementation of those traits,
/// not a consumer-facing change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_uri: String,
    pub broker_prefetch: u16,
    pub broker_heartbeat_sec: u16,
    pub broker_retry_max: u32,

    pub nonce_ttl_sec: i64,
    pub nonce_length_bytes: usize,

    pub hmac_algorithm: HmacAlgorithm,
    pub hmac_timestamp_tolerance_sec: i64,
    pub hmac_secret: Vec<u8>,

    pub log_level: String,

    pub store_backend: StoreBackend,
    pub store_dir: String,

    pub nonce_backend: StoreBackend,
    pub nonce_dir: String,

    pub http_port: u16,
    pub shutdown_grace_period: Duration,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, PipelineError> {
    match env_var(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| PipelineError::Configuration(format!("{key}={raw:?} is not valid"))),
    }
}

impl Config {
    /// Reads every key in spec §6's configuration table, applying the same
    /// defaults a local/dev run would use. Fails fast with
    /// [`PipelineError::Configuration`] on a malformed (not missing) value.
    pub fn from_env() -> Result<Self, PipelineError> {
        let hmac_secret = env_var("HMAC_SECRET")
            .ok_or_else(|| PipelineError::Configuration("HMAC_SECRET must be set".into()))?
            .into_bytes();

        let hmac_algorithm = match env_var("HMAC_ALGORITHM") {
            None => HmacAlgorithm::Sha256,
            Some(raw) => HmacAlgorithm::parse(&raw)
                .ok_or_else(|| PipelineError::Configuration(format!("hmac.algorithm={raw:?} must be sha256 or sha512")))?,
        };

        let store_backend = match env_var("STORE_BACKEND").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("file") => StoreBackend::File,
            Some(other) => {
                return Err(PipelineError::Configuration(format!("store.backend={other:?} must be memory or file")))
            }
        };

        let nonce_backend = match env_var("NONCE_BACKEND").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("file") => StoreBackend::File,
            Some(other) => {
                return Err(PipelineError::Configuration(format!("nonce.backend={other:?} must be memory or file")))
            }
        };

        let config = Self {
            broker_uri: env_var("BROKER_URI").unwrap_or_else(|| "amqp://127.0.0.1:5672/%2f".to_string()),
            broker_prefetch: env_parse("BROKER_PREFETCH", 32)?,
            broker_heartbeat_sec: env_parse("BROKER_HEARTBEAT_SEC", 30)?,
            broker_retry_max: env_parse("BROKER_RETRY_MAX", 5)?,

            nonce_ttl_sec: env_parse("NONCE_TTL_SEC", 300)?,
            nonce_length_bytes: env_parse("NONCE_LENGTH", 16)?,

            hmac_algorithm,
            hmac_timestamp_tolerance_sec: env_parse("HMAC_TIMESTAMP_TOLERANCE_SEC", 30)?,
            hmac_secret,

            log_level: env_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),

            store_backend,
            store_dir: env_var("STORE_DIR").unwrap_or_else(|| "./data/raw".to_string()),

            nonce_backend,
            nonce_dir: env_var("NONCE_DIR").unwrap_or_else(|| "./data/nonce".to_string()),

            http_port: env_parse("PORT", 8080)?,
            shutdown_grace_period: Duration::from_secs(env_parse("SHUTDOWN_GRACE_PERIOD_SEC", 30)?),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.hmac_secret.is_empty() {
            return Err(PipelineError::Configuration("hmac.secret must not be empty".into()));
        }
        if self.broker_prefetch == 0 {
            return Err(PipelineError::Configuration("broker.prefetch must be > 0".into()));
        }
        if self.nonce_length_bytes == 0 {
            return Err(PipelineError::Configuration("nonce.length must be > 0".into()));
        }
        if self.store_backend == StoreBackend::File && self.store_dir.is_empty() {
            return Err(PipelineError::Configuration("store.dir must not be empty when store.backend=file".into()));
        }
        if self.nonce_backend == StoreBackend::File && self.nonce_dir.is_empty() {
            return Err(PipelineError::Configuration("nonce.dir must not be empty when nonce.backend=file".into()));
        }
        Ok(())
    }
}
