//! RawStore (spec §4.4): content-addressed blob storage for the original
//! signal bytes. Payloads are gzip-compressed before hashing+storage so
//! `hash` is stable across `put` calls for byte-identical input (P2 in
//! spec §8) while the on-disk/in-memory footprint stays small.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::RwLock;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::model::{RawBlob, RawRef};

#[async_trait::async_trait]
pub trait RawStore: Send + Sync {
    /// Stores `payload`, returning the ref it was (or already had been)
    /// stored under. Storing byte-identical payloads twice is a no-op
    /// dedup, not a duplicate blob.
    async fn put(&self, payload: &[u8]) -> std::io::Result<RawRef>;

    /// Decompresses and returns the original bytes for `reference`, or
    /// `None` if no such blob exists.
    async fn open_read(&self, reference: RawRef) -> std::io::Result<Option<Vec<u8>>>;

    async fn metadata(&self, reference: RawRef) -> Option<RawBlob>;

    async fn delete(&self, reference: RawRef) -> bool;

    async fn exists(&self, reference: RawRef) -> bool;

    /// `(blob_count, total_compressed_bytes)`.
    async fn stats(&self) -> (usize, usize);
}

struct StoredBlob {
    compressed: Vec<u8>,
    meta: RawBlob,
}

/// In-memory store keyed by sha256 of the *compressed* bytes. Good enough
/// for a single-process deployment; a disk- or object-store-backed
/// implementation would satisfy the same trait.
pub struct InMemoryRawStore {
    blobs: RwLock<HashMap<RawRef, StoredBlob>>,
}

impl InMemoryRawStore {
    pub fn new() -> Self {
        Self { blobs: RwLock::new(HashMap::new()) }
    }
}

impl Default for InMemoryRawStore {
    fn default() -> Self {
        Self::new()
    }
}

fn gzip(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

fn gunzip(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[async_trait::async_trait]
impl RawStore for InMemoryRawStore {
    async fn put(&self, payload: &[u8]) -> std::io::Result<RawRef> {
        let compressed = gzip(payload)?;
        let digest = Sha256::digest(&compressed);
        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&digest);
        let reference = RawRef(id_bytes);

        let mut blobs = self.blobs.write().expect("raw store lock poisoned");
        blobs.entry(reference).or_insert_with(|| StoredBlob {
            meta: RawBlob {
                id: reference,
                hash: reference.to_hex(),
                uploaded_at: Utc::now(),
                original_size: payload.len(),
                compressed_size: compressed.len(),
                content_type: "application/gzip",
            },
            compressed,
        });
        Ok(reference)
    }

    async fn open_read(&self, reference: RawRef) -> std::io::Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().expect("raw store lock poisoned");
        match blobs.get(&reference) {
            Some(stored) => Ok(Some(gunzip(&stored.compressed)?)),
            None => Ok(None),
        }
    }

    async fn metadata(&self, reference: RawRef) -> Option<RawBlob> {
        self.blobs.read().expect("raw store lock poisoned").get(&reference).map(|s| s.meta.clone())
    }

    async fn delete(&self, reference: RawRef) -> bool {
        self.blobs.write().expect("raw store lock poisoned").remove(&reference).is_some()
    }

    async fn exists(&self, reference: RawRef) -> bool {
        self.blobs.read().expect("raw store lock poisoned").contains_key(&reference)
    }

    async fn stats(&self) -> (usize, usize) {
        let blobs = self.blobs.read().expect("raw store lock poisoned");
        let total: usize = blobs.values().map(|s| s.compressed.len()).sum();
        (blobs.len(), total)
    }
}

/// Disk-backed store keyed the same way as [`InMemoryRawStore`], one file
/// per blob under `base_dir`, named by hex(sha256(compressed)). Mirrors the
/// teacher's `persist_worker`'s `OpenOptions::create(true).append(true)`
/// idiom for a log that survives process restarts, generalized from "one
/// append-only NDJSON log" to "one file per content hash" since spec §4.4
/// requires hash-keyed dedup rather than a flat log.
pub struct FileRawStore {
    base_dir: std::path::PathBuf,
}

impl FileRawStore {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn blob_path(&self, reference: RawRef) -> std::path::PathBuf {
        self.base_dir.join(reference.to_hex())
    }

    fn meta_path(&self, reference: RawRef) -> std::path::PathBuf {
        self.base_dir.join(format!("{}.meta.json", reference.to_hex()))
    }
}

#[async_trait::async_trait]
impl RawStore for FileRawStore {
    async fn put(&self, payload: &[u8]) -> std::io::Result<RawRef> {
        let compressed = gzip(payload)?;
        let digest = Sha256::digest(&compressed);
        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&digest);
        let reference = RawRef(id_bytes);

        tokio::fs::create_dir_all(&self.base_dir).await?;
        let blob_path = self.blob_path(reference);
        if tokio::fs::metadata(&blob_path).await.is_err() {
            tokio::fs::write(&blob_path, &compressed).await?;
            let meta = RawBlob {
                id: reference,
                hash: reference.to_hex(),
                uploaded_at: Utc::now(),
                original_size: payload.len(),
                compressed_size: compressed.len(),
                content_type: "application/gzip",
            };
            let meta_json = serde_json::to_vec(&meta)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            tokio::fs::write(self.meta_path(reference), meta_json).await?;
        }
        Ok(reference)
    }

    async fn open_read(&self, reference: RawRef) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.blob_path(reference)).await {
            Ok(compressed) => Ok(Some(gunzip(&compressed)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn metadata(&self, reference: RawRef) -> Option<RawBlob> {
        let bytes = tokio::fs::read(self.meta_path(reference)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn delete(&self, reference: RawRef) -> bool {
        let blob_removed = tokio::fs::remove_file(self.blob_path(reference)).await.is_ok();
        let _ = tokio::fs::remove_file(self.meta_path(reference)).await;
        blob_removed
    }

    async fn exists(&self, reference: RawRef) -> bool {
        tokio::fs::metadata(self.blob_path(reference)).await.is_ok()
    }

    async fn stats(&self) -> (usize, usize) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.base_dir).await else {
            return (0, 0);
        };
        let (mut count, mut total) = (0usize, 0usize);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".meta.json") {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                count += 1;
                total += meta.len() as usize;
            }
        }
        (count, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_open_read_round_trips_exact_bytes() {
        let store = InMemoryRawStore::new();
        let payload = br#"{"deviceId":"d-01","time":1,"data":[]}"#;
        let reference = store.put(payload).await.unwrap();
        let read_back = store.open_read(reference).await.unwrap().unwrap();
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn identical_payloads_dedup_to_the_same_ref() {
        let store = InMemoryRawStore::new();
        let payload = b"identical bytes";
        let a = store.put(payload).await.unwrap();
        let b = store.put(payload).await.unwrap();
        assert_eq!(a, b);
        let (count, _) = store.stats().await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn different_payloads_get_different_refs() {
        let store = InMemoryRawStore::new();
        let a = store.put(b"one").await.unwrap();
        let b = store.put(b"two").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn metadata_reports_both_sizes() {
        let store = InMemoryRawStore::new();
        let payload = vec![b'x'; 10_000];
        let reference = store.put(&payload).await.unwrap();
        let meta = store.metadata(reference).await.unwrap();
        assert_eq!(meta.original_size, 10_000);
        assert!(meta.compressed_size < meta.original_size);
    }

    #[tokio::test]
    async fn delete_removes_blob_and_exists_reflects_it() {
        let store = InMemoryRawStore::new();
        let reference = store.put(b"gone soon").await.unwrap();
        assert!(store.exists(reference).await);
        assert!(store.delete(reference).await);
        assert!(!store.exists(reference).await);
        assert!(!store.delete(reference).await);
    }

    #[tokio::test]
    async fn open_read_on_missing_ref_returns_none() {
        let store = InMemoryRawStore::new();
        let bogus = RawRef([7u8; 32]);
        assert!(store.open_read(bogus).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_put_then_open_read_round_trips_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRawStore::new(dir.path());
        let payload = br#"{"deviceId":"d-01","time":1,"data":[]}"#;
        let reference = store.put(payload).await.unwrap();
        let read_back = store.open_read(reference).await.unwrap().unwrap();
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn file_store_identical_payloads_dedup_to_the_same_ref_and_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRawStore::new(dir.path());
        let payload = b"identical bytes";
        let a = store.put(payload).await.unwrap();
        let b = store.put(payload).await.unwrap();
        assert_eq!(a, b);
        let (count, _) = store.stats().await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn file_store_survives_being_reopened_against_the_same_directory() {
        let dir = tempfile::tempdir().unwrap();
        let reference = {
            let store = FileRawStore::new(dir.path());
            store.put(b"persisted across restarts").await.unwrap()
        };
        let reopened = FileRawStore::new(dir.path());
        let read_back = reopened.open_read(reference).await.unwrap().unwrap();
        assert_eq!(read_back, b"persisted across restarts");
    }

    #[tokio::test]
    async fn file_store_metadata_and_delete_behave_like_the_in_memory_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRawStore::new(dir.path());
        let payload = vec![b'x'; 10_000];
        let reference = store.put(&payload).await.unwrap();
        let meta = store.metadata(reference).await.unwrap();
        assert_eq!(meta.original_size, 10_000);
        assert!(meta.compressed_size < meta.original_size);
        assert_eq!(meta.content_type, "application/gzip");

        assert!(store.exists(reference).await);
        assert!(store.delete(reference).await);
        assert!(!store.exists(reference).await);
        assert!(store.open_read(reference).await.unwrap().is_none());
    }
}
