// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Buffered backend: writes are enqueued, durability happens in the flush.
//!
//! `write` validates the entry, serializes it and appends it to the
//! `buffer:entries` list; `update_by_batch` appends a [`PendingUpdate`] to
//! `buffer:updates`. Neither touches the durable store. The
//! [`FlushService`](crate::flush::FlushService) drains both lists and
//! maintains the secondary indexes.
//!
//! Every read goes through the same durable read path as [`DirectStore`],
//! so an entry is readable once it has been flushed, whether or not the
//! attached [`EntryIndex`] caught up. A freshly written entry is not
//! readable before that.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::direct::DirectStore;
use super::keys::KeySpace;
use super::traits::{BufferQueue, DurableStore, EntryFilter, EntryIndex, StorageBackend, StorageError};
use crate::entry::{CanonicalEntry, EntryType, NewEntry, PendingUpdate};
use crate::retention::{self, DEFAULT_SWEEP_BATCH_SIZE};

pub struct BufferedStore {
    queue: Arc<dyn BufferQueue>,
    durable: Arc<dyn DurableStore>,
    index: Option<Arc<dyn EntryIndex>>,
    keys: KeySpace,
    reads: DirectStore,
    sweep_batch_size: usize,
}

impl BufferedStore {
    pub fn new(queue: Arc<dyn BufferQueue>, durable: Arc<dyn DurableStore>, keys: KeySpace) -> Self {
        Self {
            reads: DirectStore::new(durable.clone()),
            queue,
            durable,
            index: None,
            keys,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn EntryIndex>) -> Self {
        self.index = Some(index);
        self
    }

    #[must_use]
    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size.max(1);
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn queue(&self) -> &Arc<dyn BufferQueue> {
        &self.queue
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn index(&self) -> Option<&Arc<dyn EntryIndex>> {
        self.index.as_ref()
    }

    /// Entries waiting in the buffer (not yet durable).
    pub async fn pending(&self) -> Result<u64, StorageError> {
        self.queue.len(&self.keys.buffer_entries()).await
    }
}

#[async_trait]
impl StorageBackend for BufferedStore {
    fn name(&self) -> &'static str {
        "buffered"
    }

    async fn write(&self, attrs: NewEntry) -> Result<CanonicalEntry, StorageError> {
        let entry = CanonicalEntry::from_new(attrs)?;
        let record = serde_json::to_string(&entry)?;
        self.queue.push(&self.keys.buffer_entries(), record).await?;
        crate::metrics::record_entry_written(self.name(), entry.entry_type.as_str());
        Ok(entry)
    }

    async fn update_by_batch(
        &self,
        batch_id: &str,
        entry_type: &EntryType,
        payload_updates: Map<String, Value>,
    ) -> Result<(), StorageError> {
        let update = PendingUpdate {
            batch_id: batch_id.to_string(),
            entry_type: entry_type.clone(),
            payload_updates,
        };
        let record = serde_json::to_string(&update)?;
        self.queue.push(&self.keys.buffer_updates(), record).await
    }

    async fn find(&self, id: &str) -> Result<Option<CanonicalEntry>, StorageError> {
        self.reads.find(id).await
    }

    async fn list(
        &self,
        filter: &EntryFilter,
        page: usize,
        per_page: usize,
        visible_only: bool,
    ) -> Result<Vec<CanonicalEntry>, StorageError> {
        self.reads.list(filter, page, per_page, visible_only).await
    }

    async fn count(&self, filter: &EntryFilter, visible_only: bool) -> Result<u64, StorageError> {
        self.reads.count(filter, visible_only).await
    }

    async fn entries_for_batch(&self, batch_id: &str) -> Result<Vec<CanonicalEntry>, StorageError> {
        self.reads.entries_for_batch(batch_id).await
    }

    async fn entries_for_family(
        &self,
        family_hash: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<CanonicalEntry>, StorageError> {
        self.reads.entries_for_family(family_hash, page, per_page).await
    }

    async fn family_count(&self, family_hash: &str) -> Result<u64, StorageError> {
        self.reads.family_count(family_hash).await
    }

    /// Drops both buffer lists, the secondary indexes and every durable row.
    async fn delete_all(&self) -> Result<u64, StorageError> {
        let entries_key = self.keys.buffer_entries();
        let updates_key = self.keys.buffer_updates();
        self.queue.clear(&[&entries_key, &updates_key]).await?;

        if let Some(ref index) = self.index {
            let dropped = index.clear().await?;
            debug!(dropped, "Secondary indexes cleared");
        }
        self.durable.delete_all().await
    }

    async fn delete_expired(&self, horizon: Duration) -> Result<u64, StorageError> {
        let cutoff = retention::cutoff_for(horizon);
        retention::sweep_expired(
            self.durable.as_ref(),
            self.index.as_deref(),
            cutoff,
            self.sweep_batch_size,
        )
        .await
    }

    async fn is_ready(&self) -> bool {
        let buffer_ready = self.queue.is_ready().await;
        let durable_ready = self.durable.is_ready().await;
        if !(buffer_ready && durable_ready) {
            warn!(buffer_ready, durable_ready, "Buffered backend not ready");
        }
        buffer_ready && durable_ready
    }
}
