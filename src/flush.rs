// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flush: drain the buffer into the durable store.
//!
//! One [`FlushService::run`] does the following:
//!
//! 1. Pop up to `batch_size` entries from `buffer:entries` (atomic pop-N).
//! 2. Insert them in one transaction. Transient failures retry the *same*
//!    batch, reconnecting between attempts, up to the retry ceiling.
//!    At the ceiling the batch goes back to the head of the list and the
//!    run halts; the next run resumes with it.
//! 3. Index the inserted entries (best effort).
//! 4. Repeat until the list is drained.
//! 5. Pop pending updates and merge each into the newest durable entry for
//!    its `(batch_id, entry_type)`. Updates whose target is not durable yet
//!    are dropped.
//!
//! Records that fail to deserialize are logged and discarded. A batch the
//! durable store refuses outright (a duplicate id after an insert that
//! committed but whose acknowledgement was lost, a value too long for its
//! column) is retried entry by entry so one bad row does not sink its
//! neighbours. Only connectivity failures count against the retry ceiling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::entry::{CanonicalEntry, PendingUpdate};
use crate::resilience::retry::{retry_with_reset, RetryConfig};
use crate::storage::buffered::BufferedStore;
use crate::storage::keys::KeySpace;
use crate::storage::traits::{BufferQueue, DurableStore, EntryIndex, StorageError};

pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_MAX_RETRIES: usize = 3;

/// Outcome of one flush run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Entries made durable.
    pub flushed: usize,
    pub updates_applied: usize,
    /// Updates with no durable target.
    pub updates_dropped: usize,
    /// Records discarded as undecodable or rejected.
    pub discarded: usize,
    /// The retry ceiling was hit; remaining work is left for the next run.
    pub halted: bool,
}

enum Insert {
    Done(usize),
    /// Transient failure past the ceiling; carries records not yet durable.
    Halted(Vec<String>, StorageError),
}

pub struct FlushService {
    queue: Arc<dyn BufferQueue>,
    durable: Arc<dyn DurableStore>,
    index: Option<Arc<dyn EntryIndex>>,
    keys: KeySpace,
    batch_size: usize,
    retry: RetryConfig,
}

impl FlushService {
    pub fn new(queue: Arc<dyn BufferQueue>, durable: Arc<dyn DurableStore>, keys: KeySpace) -> Self {
        Self {
            queue,
            durable,
            index: None,
            keys,
            batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            retry: RetryConfig::flush(DEFAULT_FLUSH_MAX_RETRIES),
        }
    }

    /// Flush service draining `store`'s buffer into its durable store.
    pub fn for_store(store: &BufferedStore) -> Self {
        let service = Self::new(store.queue().clone(), store.durable().clone(), store.keys().clone());
        match store.index() {
            Some(index) => service.with_index(index.clone()),
            None => service,
        }
    }

    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn EntryIndex>) -> Self {
        self.index = Some(index);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Drain entries, then pending updates.
    ///
    /// Never fails: errors are logged and reflected in the report.
    #[tracing::instrument(skip(self), fields(batch_size = self.batch_size))]
    pub async fn run(&self) -> FlushReport {
        let started = Instant::now();
        let mut report = FlushReport::default();

        self.flush_entries(&mut report).await;
        if !report.halted {
            self.apply_updates(&mut report).await;
        }

        if report.flushed > 0 || report.updates_applied > 0 || report.halted {
            info!(
                flushed = report.flushed,
                updates_applied = report.updates_applied,
                updates_dropped = report.updates_dropped,
                discarded = report.discarded,
                halted = report.halted,
                "Flush run finished"
            );
        }
        crate::metrics::record_flush_duration(started.elapsed());
        if let Ok(pending) = self.queue.len(&self.keys.buffer_entries()).await {
            crate::metrics::set_buffer_pending(pending);
        }
        report
    }

    async fn pop(&self, key: &str) -> Result<Vec<String>, StorageError> {
        retry_with_reset(
            "flush_pop",
            &self.retry,
            || self.queue.pop_batch(key, self.batch_size),
            || self.queue.reconnect(),
        )
        .await
    }

    async fn requeue(&self, key: &str, records: &[String]) {
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.queue.requeue_front(key, records).await {
            // Queue-level failure: these records are lost
            error!(error = %e, lost = records.len(), "Failed to requeue records");
        }
    }

    async fn flush_entries(&self, report: &mut FlushReport) {
        let key = self.keys.buffer_entries();

        loop {
            let records = match self.pop(&key).await {
                Ok(records) => records,
                Err(e) => {
                    error!(error = %e, flushed_so_far = report.flushed, "Cannot pop from entry buffer");
                    report.halted = true;
                    return;
                }
            };
            if records.is_empty() {
                return;
            }
            let popped = records.len();

            let mut raws = Vec::with_capacity(popped);
            let mut entries = Vec::with_capacity(popped);
            for raw in records {
                match serde_json::from_str::<CanonicalEntry>(&raw) {
                    Ok(entry) => {
                        entries.push(entry);
                        raws.push(raw);
                    }
                    Err(e) => {
                        warn!(error = %e, "Discarding undecodable buffered entry");
                        report.discarded += 1;
                    }
                }
            }

            match self.insert(&raws, &entries, report).await {
                Insert::Done(n) => {
                    report.flushed += n;
                    crate::metrics::record_flush_batch(n);
                }
                Insert::Halted(remaining, e) => {
                    error!(
                        error = %e,
                        flushed_so_far = report.flushed,
                        batch_size = remaining.len(),
                        attempts = self.retry.max_retries.unwrap_or(0),
                        "Retry ceiling hit, leaving batch for next run"
                    );
                    self.requeue(&key, &remaining).await;
                    crate::metrics::record_flush_halt();
                    report.halted = true;
                    return;
                }
            }

            if popped < self.batch_size {
                return;
            }
        }
    }

    async fn insert(&self, raws: &[String], entries: &[CanonicalEntry], report: &mut FlushReport) -> Insert {
        if entries.is_empty() {
            return Insert::Done(0);
        }

        match self.insert_with_retry(entries).await {
            Ok(n) => {
                self.index(entries).await;
                Insert::Done(n)
            }
            Err(e) if e.is_transient() => Insert::Halted(raws.to_vec(), e),
            Err(e) => {
                warn!(error = %e, batch_size = entries.len(), "Batch rejected, inserting entries one by one");
                let mut inserted = 0;
                for (i, entry) in entries.iter().enumerate() {
                    match self.insert_with_retry(std::slice::from_ref(entry)).await {
                        Ok(n) => {
                            self.index(std::slice::from_ref(entry)).await;
                            inserted += n;
                        }
                        Err(e) if e.is_transient() => {
                            report.flushed += inserted;
                            return Insert::Halted(raws[i..].to_vec(), e);
                        }
                        Err(StorageError::Duplicate(_)) => {
                            // Committed by an earlier attempt whose acknowledgement was lost
                            debug!(id = %entry.id, "Entry already durable, skipping insert");
                            self.index(std::slice::from_ref(entry)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, id = %entry.id, "Discarding rejected entry");
                            report.discarded += 1;
                        }
                    }
                }
                Insert::Done(inserted)
            }
        }
    }

    async fn insert_with_retry(&self, entries: &[CanonicalEntry]) -> Result<usize, StorageError> {
        retry_with_reset(
            "flush_insert",
            &self.retry,
            || self.durable.insert_batch(entries),
            || self.durable.reconnect(),
        )
        .await
    }

    async fn index(&self, entries: &[CanonicalEntry]) {
        if let Some(ref index) = self.index {
            if let Err(e) = index.index_entries(entries).await {
                warn!(error = %e, count = entries.len(), "Failed to update secondary indexes");
            }
        }
    }

    async fn apply_updates(&self, report: &mut FlushReport) {
        let key = self.keys.buffer_updates();

        loop {
            let records = match self.pop(&key).await {
                Ok(records) => records,
                Err(e) => {
                    error!(error = %e, "Cannot pop from update buffer");
                    report.halted = true;
                    return;
                }
            };
            if records.is_empty() {
                return;
            }
            let popped = records.len();

            for (i, raw) in records.iter().enumerate() {
                let update: PendingUpdate = match serde_json::from_str(raw) {
                    Ok(update) => update,
                    Err(e) => {
                        warn!(error = %e, "Discarding undecodable pending update");
                        report.discarded += 1;
                        continue;
                    }
                };

                let merged = retry_with_reset(
                    "flush_update",
                    &self.retry,
                    || {
                        self.durable
                            .merge_into_latest(&update.batch_id, &update.entry_type, &update.payload_updates)
                    },
                    || self.durable.reconnect(),
                )
                .await;

                match merged {
                    Ok(Some(entry)) => {
                        report.updates_applied += 1;
                        crate::metrics::record_update(true);
                        if let Some(ref index) = self.index {
                            if let Err(e) = index.refresh_entry(&entry).await {
                                warn!(error = %e, id = %entry.id, "Failed to refresh indexed entry");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(batch_id = %update.batch_id, entry_type = %update.entry_type, "Update target not durable, dropped");
                        report.updates_dropped += 1;
                        crate::metrics::record_update(false);
                    }
                    Err(e) if e.is_transient() => {
                        error!(
                            error = %e,
                            applied_so_far = report.updates_applied,
                            remaining = popped - i,
                            "Retry ceiling hit applying updates, leaving them for next run"
                        );
                        self.requeue(&key, &records[i..]).await;
                        crate::metrics::record_flush_halt();
                        report.halted = true;
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, batch_id = %update.batch_id, "Discarding rejected update");
                        report.discarded += 1;
                    }
                }
            }

            if popped < self.batch_size {
                return;
            }
        }
    }

    /// Run on every tick until `shutdown` flips to `true`, then flush once
    /// more and stop.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            let report = self.run().await;
                            info!(flushed = report.flushed, "Final flush on shutdown");
                            return;
                        }
                    }
                }
            }
        })
    }
}
