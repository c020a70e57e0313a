// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Direct backend: every write goes straight to the durable store.
//!
//! Failures surface to the caller after a bounded retry with reconnect.
//! Reads are filtered, paginated queries against the durable store; the
//! buffered backend reuses this read path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::traits::{DurableStore, EntryFilter, StorageBackend, StorageError};
use crate::entry::{CanonicalEntry, EntryType, NewEntry};
use crate::page;
use crate::resilience::retry::{retry_with_reset, RetryConfig};
use crate::retention::{self, DEFAULT_SWEEP_BATCH_SIZE};

pub struct DirectStore {
    durable: Arc<dyn DurableStore>,
    sweep_batch_size: usize,
    retry: RetryConfig,
}

impl DirectStore {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self {
            durable,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            retry: RetryConfig::query(),
        }
    }

    #[must_use]
    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }
}

#[async_trait]
impl StorageBackend for DirectStore {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn write(&self, attrs: NewEntry) -> Result<CanonicalEntry, StorageError> {
        let entry = CanonicalEntry::from_new(attrs)?;
        let rows = std::slice::from_ref(&entry);
        let mut attempts = 0;

        let written = retry_with_reset(
            "direct_write",
            &self.retry,
            || {
                attempts += 1;
                self.durable.insert_batch(rows)
            },
            || self.durable.reconnect(),
        )
        .await;
        match written {
            Ok(_) => {}
            // The id is fresh, so a duplicate on a retry is our own earlier
            // attempt that committed before its acknowledgement was lost
            Err(StorageError::Duplicate(_)) if attempts > 1 => {
                debug!(id = %entry.id, attempts, "Write already committed by an earlier attempt");
            }
            Err(e) => return Err(e),
        }

        crate::metrics::record_entry_written(self.name(), entry.entry_type.as_str());
        Ok(entry)
    }

    async fn update_by_batch(
        &self,
        batch_id: &str,
        entry_type: &EntryType,
        payload_updates: Map<String, Value>,
    ) -> Result<(), StorageError> {
        let merged = retry_with_reset(
            "direct_update",
            &self.retry,
            || self.durable.merge_into_latest(batch_id, entry_type, &payload_updates),
            || self.durable.reconnect(),
        )
        .await?;

        if merged.is_some() {
            crate::metrics::record_update(true);
        } else {
            debug!(batch_id, entry_type = %entry_type, "No entry to merge update into, dropped");
            crate::metrics::record_update(false);
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<CanonicalEntry>, StorageError> {
        self.durable.get(id).await
    }

    async fn list(
        &self,
        filter: &EntryFilter,
        page: usize,
        per_page: usize,
        visible_only: bool,
    ) -> Result<Vec<CanonicalEntry>, StorageError> {
        self.durable
            .query(filter, visible_only, per_page.max(1), page::offset(page, per_page))
            .await
    }

    async fn count(&self, filter: &EntryFilter, visible_only: bool) -> Result<u64, StorageError> {
        self.durable.count(filter, visible_only).await
    }

    async fn entries_for_batch(&self, batch_id: &str) -> Result<Vec<CanonicalEntry>, StorageError> {
        self.durable.batch_entries(batch_id).await
    }

    async fn entries_for_family(
        &self,
        family_hash: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<CanonicalEntry>, StorageError> {
        self.list(&EntryFilter::new().family_hash(family_hash), page, per_page, false)
            .await
    }

    async fn family_count(&self, family_hash: &str) -> Result<u64, StorageError> {
        self.durable
            .count(&EntryFilter::new().family_hash(family_hash), false)
            .await
    }

    async fn delete_all(&self) -> Result<u64, StorageError> {
        self.durable.delete_all().await
    }

    async fn delete_expired(&self, horizon: Duration) -> Result<u64, StorageError> {
        let cutoff = retention::cutoff_for(horizon);
        retention::sweep_expired(self.durable.as_ref(), None, cutoff, self.sweep_batch_size).await
    }

    async fn is_ready(&self) -> bool {
        self.durable.is_ready().await
    }
}
