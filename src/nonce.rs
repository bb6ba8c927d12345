//! NonceStore (spec §4.3): replay prevention, keyed by `(deviceId, nonce)`.
//!
//! Claiming is atomic: `claim` either records a brand-new nonce and
//! returns `true`, or observes an existing unexpired entry and returns
//! `false` without racing a concurrent claimer (P5 in spec §8).

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::model::NonceRecord;

/// Spec §4.3: "if the backing store is unreachable, the verifier returns
/// `nonce_check_unavailable`". The consumer maps this straight to
/// `PipelineError::Transport` and treats it as retryable (spec §7), the
/// same way it already treats `raw_store.put`/`repository.insert` failures.
#[derive(Debug, thiserror::Error)]
pub enum NonceStoreError {
    #[error("nonce_check_unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait NonceStore: Send + Sync {
    /// Atomically claims `(device_id, nonce)`. Returns `Ok(true)` if this
    /// call is the first to claim it before `ttl` expiry, `Ok(false))`
    /// otherwise, `Err(NonceStoreError::Unavailable)` if the backing store
    /// could not be reached (spec §4.3).
    async fn claim(&self, device_id: &str, nonce: &str, ttl: Duration) -> Result<bool, NonceStoreError>;

    /// Evicts all entries whose `expires_at` has passed. Returns the count removed.
    async fn evict_expired(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn key(device_id: &str, nonce: &str) -> String {
    format!("{device_id}\0{nonce}")
}

/// In-memory implementation backed by a [`DashMap`], the same concurrent
/// map the teacher reaches for everywhere it needs shared mutable state
/// without a surrounding mutex.
pub struct InMemoryNonceStore {
    entries: DashMap<String, NonceRecord>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }
}

impl Default for InMemoryNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn claim(&self, device_id: &str, nonce: &str, ttl: Duration) -> Result<bool, NonceStoreError> {
        let k = key(device_id, nonce);
        let now = Utc::now();

        let fresh = match self.entries.entry(k) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(NonceRecord {
                    device_id: device_id.to_string(),
                    nonce: nonce.to_string(),
                    expires_at: now + ttl,
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().expires_at <= now {
                    slot.insert(NonceRecord {
                        device_id: device_id.to_string(),
                        nonce: nonce.to_string(),
                        expires_at: now + ttl,
                    });
                    true
                } else {
                    false
                }
            }
        };
        Ok(fresh)
    }

    async fn evict_expired(&self) -> usize {
        let now: DateTime<Utc> = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, record| record.expires_at > now);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Disk-backed, restart-surviving nonce store (spec §4.3: "in-memory is
/// acceptable only for tests"). One JSON record per `(device_id, nonce)`
/// key under `base_dir`, named by a sha256 digest of the key so a claim is
/// a single file read. A process-local `tokio::sync::Mutex` sequences the
/// check-then-write so two concurrent claimers can't both observe a
/// vacant/expired slot and both insert, mirroring the exclusivity
/// `InMemoryNonceStore` gets for free from `DashMap::entry`.
pub struct FileNonceStore {
    base_dir: std::path::PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileNonceStore {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { base_dir: base_dir.into(), lock: tokio::sync::Mutex::new(()) }
    }

    fn path_for(&self, device_id: &str, nonce: &str) -> std::path::PathBuf {
        let digest = Sha256::digest(key(device_id, nonce).as_bytes());
        self.base_dir.join(hex::encode(digest))
    }
}

#[async_trait::async_trait]
impl NonceStore for FileNonceStore {
    async fn claim(&self, device_id: &str, nonce: &str, ttl: Duration) -> Result<bool, NonceStoreError> {
        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.base_dir).await.map_err(|e| NonceStoreError::Unavailable(e.to_string()))?;

        let path = self.path_for(device_id, nonce);
        let now = Utc::now();

        let vacant_or_expired = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record: NonceRecord =
                    serde_json::from_slice(&bytes).map_err(|e| NonceStoreError::Unavailable(e.to_string()))?;
                record.expires_at <= now
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(NonceStoreError::Unavailable(e.to_string())),
        };

        if !vacant_or_expired {
            return Ok(false);
        }

        let record = NonceRecord { device_id: device_id.to_string(), nonce: nonce.to_string(), expires_at: now + ttl };
        let bytes = serde_json::to_vec(&record).map_err(|e| NonceStoreError::Unavailable(e.to_string()))?;
        tokio::fs::write(&path, bytes).await.map_err(|e| NonceStoreError::Unavailable(e.to_string()))?;
        Ok(true)
    }

    async fn evict_expired(&self) -> usize {
        let _guard = self.lock.lock().await;
        let Ok(mut entries) = tokio::fs::read_dir(&self.base_dir).await else {
            return 0;
        };
        let now = Utc::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(bytes) = tokio::fs::read(&path).await else { continue };
            let Ok(record) = serde_json::from_slice::<NonceRecord>(&bytes) else { continue };
            if record.expires_at <= now {
                let _ = tokio::fs::remove_file(&path).await;
                removed += 1;
            }
        }
        removed
    }

    fn len(&self) -> usize {
        std::fs::read_dir(&self.base_dir).map(|d| d.count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_claim_succeeds_second_is_rejected() {
        let store = InMemoryNonceStore::new();
        assert!(store.claim("d-01", "abc123", Duration::seconds(30)).await.unwrap());
        assert!(!store.claim("d-01", "abc123", Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn different_devices_can_share_a_nonce_value() {
        let store = InMemoryNonceStore::new();
        assert!(store.claim("d-01", "abc123", Duration::seconds(30)).await.unwrap());
        assert!(store.claim("d-02", "abc123", Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_nonce_can_be_reclaimed() {
        let store = InMemoryNonceStore::new();
        assert!(store.claim("d-01", "abc123", Duration::seconds(-1)).await.unwrap());
        assert!(store.claim("d-01", "abc123", Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn evict_expired_removes_only_stale_entries() {
        let store = InMemoryNonceStore::new();
        store.claim("d-01", "stale", Duration::seconds(-1)).await.unwrap();
        store.claim("d-01", "fresh", Duration::seconds(300)).await.unwrap();
        let removed = store.evict_expired().await;
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn file_store_first_claim_succeeds_second_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNonceStore::new(dir.path());
        assert!(store.claim("d-01", "abc123", Duration::seconds(30)).await.unwrap());
        assert!(!store.claim("d-01", "abc123", Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_survives_being_reopened_against_the_same_directory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileNonceStore::new(dir.path());
            assert!(store.claim("d-01", "abc123", Duration::seconds(300)).await.unwrap());
        }
        let reopened = FileNonceStore::new(dir.path());
        assert!(!reopened.claim("d-01", "abc123", Duration::seconds(300)).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_expired_nonce_can_be_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNonceStore::new(dir.path());
        assert!(store.claim("d-01", "abc123", Duration::seconds(-1)).await.unwrap());
        assert!(store.claim("d-01", "abc123", Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_evict_expired_removes_only_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNonceStore::new(dir.path());
        store.claim("d-01", "stale", Duration::seconds(-1)).await.unwrap();
        store.claim("d-01", "fresh", Duration::seconds(300)).await.unwrap();
        let removed = store.evict_expired().await;
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }
}
