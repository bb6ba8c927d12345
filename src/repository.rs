//! SignalRepository (spec §4.5): the persisted, queryable processed-record
//! store. Secondary indexes are logical (spec §4.5) — the in-memory
//! implementation below walks a `BTreeMap` ordered by id, which already
//! gives default `id desc` sort for free, and filters the rest in place.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::ProcessedSignal;

#[derive(Debug, Clone, Default)]
pub struct SignalFilter {
    pub device_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub min_lat: Option<f64>,
    pub max_lat: Option<f64>,
    pub min_lon: Option<f64>,
    pub max_lon: Option<f64>,
    pub min_data_length: Option<usize>,
    pub max_data_length: Option<usize>,
    pub min_data_volume: Option<usize>,
    pub max_data_volume: Option<usize>,
}

impl SignalFilter {
    fn matches(&self, record: &ProcessedSignal) -> bool {
        if let Some(d) = &self.device_id {
            if &record.device_id != d {
                return false;
            }
        }
        let created = record.created_at;
        if let Some(from) = self.from {
            if created < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if created > to {
                return false;
            }
        }
        let (lon, lat) = (record.location.lon(), record.location.lat());
        if let Some(v) = self.min_lat {
            if lat < v {
                return false;
            }
        }
        if let Some(v) = self.max_lat {
            if lat > v {
                return false;
            }
        }
        if let Some(v) = self.min_lon {
            if lon < v {
                return false;
            }
        }
        if let Some(v) = self.max_lon {
            if lon > v {
                return false;
            }
        }
        if let Some(v) = self.min_data_length {
            if record.data_length < v {
                return false;
            }
        }
        if let Some(v) = self.max_data_length {
            if record.data_length > v {
                return false;
            }
        }
        if let Some(v) = self.min_data_volume {
            if record.data_volume < v {
                return false;
            }
        }
        if let Some(v) = self.max_data_volume {
            if record.data_volume > v {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Id,
    Time,
    MaxSpeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct Page {
    /// Either an offset/limit pair or an opaque cursor (the id of the last
    /// record in the previous page) — never both.
    pub skip: Option<usize>,
    pub cursor: Option<Uuid>,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { skip: None, cursor: None, limit: 20 }
    }
}

#[derive(Debug, Clone)]
pub struct PageResult {
    pub items: Vec<ProcessedSignal>,
    pub total: usize,
}

/// A sparse set of fields to overwrite on an existing record; `None` means
/// "leave unchanged". `stats`/`location` are recomputed together since
/// they are derived from the same `data`, never patched independently.
#[derive(Debug, Clone, Default)]
pub struct SignalPatch {
    pub stats: Option<crate::model::SignalStats>,
    pub location: Option<crate::model::GeoPoint>,
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("idempotencyKey already present")]
    DuplicateKey,
}

#[async_trait::async_trait]
pub trait SignalRepository: Send + Sync {
    async fn find_by_idempotency_key(&self, key: [u8; 32]) -> Option<ProcessedSignal>;

    /// Fails with [`RepositoryError::DuplicateKey`] if another record with
    /// the same `idempotencyKey` already exists (spec §4.5) — the consumer
    /// treats that as a successful duplicate, not an error.
    async fn insert(&self, record: ProcessedSignal) -> Result<Uuid, RepositoryError>;

    async fn find_by_id(&self, id: Uuid) -> Option<ProcessedSignal>;

    async fn find_many(&self, filter: SignalFilter, sort_by: SortBy, sort_order: SortOrder, page: Page) -> PageResult;

    async fn update(&self, id: Uuid, patch: SignalPatch) -> Option<ProcessedSignal>;

    async fn delete(&self, id: Uuid) -> bool;
}

pub struct InMemorySignalRepository {
    records: RwLock<BTreeMap<Uuid, ProcessedSignal>>,
    by_idempotency_key: RwLock<std::collections::HashMap<[u8; 32], Uuid>>,
}

impl InMemorySignalRepository {
    pub fn new() -> Self {
        Self { records: RwLock::new(BTreeMap::new()), by_idempotency_key: RwLock::new(std::collections::HashMap::new()) }
    }
}

impl Default for InMemorySignalRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_key(record: &ProcessedSignal, sort_by: SortBy) -> f64 {
    match sort_by {
        SortBy::Id => 0.0, // BTreeMap iteration already gives id order; handled separately
        SortBy::Time => record.time as f64,
        SortBy::MaxSpeed => record.stats.max_speed,
    }
}

#[async_trait::async_trait]
impl SignalRepository for InMemorySignalRepository {
    async fn find_by_idempotency_key(&self, key: [u8; 32]) -> Option<ProcessedSignal> {
        let index = self.by_idempotency_key.read().expect("repository lock poisoned");
        let id = *index.get(&key)?;
        drop(index);
        self.find_by_id(id).await
    }

    async fn insert(&self, record: ProcessedSignal) -> Result<Uuid, RepositoryError> {
        let mut index = self.by_idempotency_key.write().expect("repository lock poisoned");
        if index.contains_key(&record.idempotency_key) {
            return Err(RepositoryError::DuplicateKey);
        }
        let id = record.id;
        index.insert(record.idempotency_key, id);
        drop(index);

        let mut records = self.records.write().expect("repository lock poisoned");
        records.insert(id, record);
        Ok(id)
    }

    async fn find_by_id(&self, id: Uuid) -> Option<ProcessedSignal> {
        self.records.read().expect("repository lock poisoned").get(&id).cloned()
    }

    async fn find_many(&self, filter: SignalFilter, sort_by: SortBy, sort_order: SortOrder, page: Page) -> PageResult {
        let records = self.records.read().expect("repository lock poisoned");

        let mut matched: Vec<ProcessedSignal> =
            records.values().rev().filter(|record| filter.matches(record)).cloned().collect();
        drop(records);

        match sort_by {
            SortBy::Id => {} // already id-descending from the BTreeMap walk above
            _ => matched.sort_by(|a, b| {
                sort_key(a, sort_by).partial_cmp(&sort_key(b, sort_by)).unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
        if sort_order == SortOrder::Descending && sort_by != SortBy::Id {
            matched.reverse();
        }
        if sort_order == SortOrder::Ascending && sort_by == SortBy::Id {
            matched.reverse();
        }

        let total = matched.len();

        let start = if let Some(cursor) = page.cursor {
            matched.iter().position(|r| r.id == cursor).map(|i| i + 1).unwrap_or(total)
        } else {
            page.skip.unwrap_or(0)
        };

        let items = matched.into_iter().skip(start).take(page.limit).collect();
        PageResult { items, total }
    }

    async fn update(&self, id: Uuid, patch: SignalPatch) -> Option<ProcessedSignal> {
        let mut records = self.records.write().expect("repository lock poisoned");
        let record = records.get_mut(&id)?;
        if let Some(stats) = patch.stats {
            record.stats = stats;
        }
        if let Some(location) = patch.location {
            record.location = location;
        }
        record.updated_at = Utc::now();
        Some(record.clone())
    }

    async fn delete(&self, id: Uuid) -> bool {
        let Some(record) = self.records.write().expect("repository lock poisoned").remove(&id) else {
            return false;
        };
        self.by_idempotency_key.write().expect("repository lock poisoned").remove(&record.idempotency_key);
        true
    }
}
