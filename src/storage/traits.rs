// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage contracts.
//!
//! - [`StorageBackend`]: what event sources and the read API depend on.
//!   Implemented by [`DirectStore`](super::direct::DirectStore) and
//!   [`BufferedStore`](super::buffered::BufferedStore).
//! - [`DurableStore`]: the relational source of truth (SQL or in-memory).
//! - [`BufferQueue`]: named FIFO lists in the fast shared store.
//! - [`EntryIndex`]: standalone secondary indexes kept beside the buffer.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::entry::{CanonicalEntry, EntryType, NewEntry};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Entry not found: {0}")]
    NotFound(String),
    #[error("Malformed entry: {0}")]
    Malformed(String),
    /// An entry with this id is already stored.
    #[error("Duplicate entry: {0}")]
    Duplicate(String),
    /// The backend refused the statement itself (constraint, size, syntax).
    /// Sending it again fails the same way.
    #[error("Rejected by storage backend: {0}")]
    Rejected(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Connectivity-class failures worth retrying with a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Listing filters. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub entry_type: Option<EntryType>,
    pub tag: Option<String>,
    pub batch_id: Option<String>,
    pub family_hash: Option<String>,
}

impl EntryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    #[must_use]
    pub fn family_hash(mut self, family_hash: impl Into<String>) -> Self {
        self.family_hash = Some(family_hash.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entry_type.is_none()
            && self.tag.is_none()
            && self.batch_id.is_none()
            && self.family_hash.is_none()
    }

    /// In-process evaluation, used by the memory store.
    pub fn matches(&self, entry: &CanonicalEntry) -> bool {
        if let Some(ref ty) = self.entry_type {
            if &entry.entry_type != ty {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !entry.has_tag(tag) {
                return false;
            }
        }
        if let Some(ref batch_id) = self.batch_id {
            if entry.batch_id.as_deref() != Some(batch_id.as_str()) {
                return false;
            }
        }
        if let Some(ref family_hash) = self.family_hash {
            if entry.family_hash.as_deref() != Some(family_hash.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Result of deleting one bounded batch of expired entries.
#[derive(Debug, Default)]
pub struct ExpiredBatch {
    /// Rows actually removed from the durable store.
    pub removed: u64,
    /// The entries selected for removal (used to clean secondary indexes).
    pub entries: Vec<CanonicalEntry>,
}

/// Common contract over both capture backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name for logs and metrics ("direct", "buffered").
    fn name(&self) -> &'static str;

    /// Validate and record an entry.
    async fn write(&self, attrs: NewEntry) -> Result<CanonicalEntry, StorageError>;

    /// Merge later-arriving data into the newest `(batch_id, entry_type)` entry.
    ///
    /// A missing target is not an error; the update is dropped.
    async fn update_by_batch(
        &self,
        batch_id: &str,
        entry_type: &EntryType,
        payload_updates: Map<String, Value>,
    ) -> Result<(), StorageError>;

    /// `Ok(None)` when the id does not exist.
    async fn find(&self, id: &str) -> Result<Option<CanonicalEntry>, StorageError>;

    /// Like [`find`](Self::find) but a missing id is [`StorageError::NotFound`].
    async fn find_required(&self, id: &str) -> Result<CanonicalEntry, StorageError> {
        self.find(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Newest first. `page` is 1-indexed.
    async fn list(
        &self,
        filter: &EntryFilter,
        page: usize,
        per_page: usize,
        visible_only: bool,
    ) -> Result<Vec<CanonicalEntry>, StorageError>;

    async fn count(&self, filter: &EntryFilter, visible_only: bool) -> Result<u64, StorageError>;

    /// Every entry of the batch, oldest first.
    async fn entries_for_batch(&self, batch_id: &str) -> Result<Vec<CanonicalEntry>, StorageError>;

    /// Entries of the family, newest first.
    async fn entries_for_family(
        &self,
        family_hash: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<CanonicalEntry>, StorageError>;

    async fn family_count(&self, family_hash: &str) -> Result<u64, StorageError>;

    /// Full reset. Returns the number of durable entries removed.
    async fn delete_all(&self) -> Result<u64, StorageError>;

    /// Remove entries whose `occurred_at` is older than `now - horizon`.
    async fn delete_expired(&self, horizon: Duration) -> Result<u64, StorageError>;

    async fn is_ready(&self) -> bool;
}

/// The durable relational store: long-term source of truth for reads.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert all entries in one transaction (all-or-nothing).
    async fn insert_batch(&self, entries: &[CanonicalEntry]) -> Result<usize, StorageError>;

    /// Merge `updates` into the most recently created entry matching
    /// `(batch_id, entry_type)`. Returns the updated entry, or `None` when
    /// there is no such entry.
    async fn merge_into_latest(
        &self,
        batch_id: &str,
        entry_type: &EntryType,
        updates: &Map<String, Value>,
    ) -> Result<Option<CanonicalEntry>, StorageError>;

    async fn get(&self, id: &str) -> Result<Option<CanonicalEntry>, StorageError>;

    /// Filtered query ordered by `occurred_at` descending.
    async fn query(
        &self,
        filter: &EntryFilter,
        visible_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CanonicalEntry>, StorageError>;

    async fn count(&self, filter: &EntryFilter, visible_only: bool) -> Result<u64, StorageError>;

    /// All entries of a batch ordered by `occurred_at` ascending.
    async fn batch_entries(&self, batch_id: &str) -> Result<Vec<CanonicalEntry>, StorageError>;

    async fn delete_all(&self) -> Result<u64, StorageError>;

    /// Delete at most `limit` entries with `occurred_at < cutoff`.
    async fn delete_expired_batch(&self, cutoff: i64, limit: usize) -> Result<ExpiredBatch, StorageError>;

    /// Drop pooled connections so the next call starts fresh.
    async fn reconnect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn is_ready(&self) -> bool;
}

/// Named FIFO lists in the shared in-memory store.
///
/// `pop_batch` must be atomic so concurrent flush workers never see the same
/// record twice.
#[async_trait]
pub trait BufferQueue: Send + Sync {
    /// Append to the tail.
    async fn push(&self, key: &str, record: String) -> Result<(), StorageError>;

    /// Atomically remove up to `max` records from the head.
    async fn pop_batch(&self, key: &str, max: usize) -> Result<Vec<String>, StorageError>;

    /// Put records back at the head, preserving their order.
    async fn requeue_front(&self, key: &str, records: &[String]) -> Result<(), StorageError>;

    async fn len(&self, key: &str) -> Result<u64, StorageError>;

    /// Remove the given lists entirely.
    async fn clear(&self, keys: &[&str]) -> Result<(), StorageError>;

    async fn reconnect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn is_ready(&self) -> bool;
}

/// Standalone secondary indexes over durable entries.
///
/// Maintained by the flush path after durable writes and by retention after
/// deletes, so ids never outlive the entries they point at. Maintenance is
/// best effort; reads never depend on it and go to the durable store.
#[async_trait]
pub trait EntryIndex: Send + Sync {
    /// Add entries to the global, visible, type, batch, family and tag indexes.
    async fn index_entries(&self, entries: &[CanonicalEntry]) -> Result<(), StorageError>;

    /// Re-store a single entry after a payload merge.
    async fn refresh_entry(&self, entry: &CanonicalEntry) -> Result<(), StorageError>;

    /// Remove entries from every index that references them.
    async fn remove_entries(&self, entries: &[CanonicalEntry]) -> Result<(), StorageError>;

    /// Drop every index. Returns the number of ids that were indexed.
    async fn clear(&self) -> Result<u64, StorageError>;
}
