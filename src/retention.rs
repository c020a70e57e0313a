// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retention: delete entries older than the configured horizon.
//!
//! Deletion runs in bounded batches so no single statement holds locks for
//! long. Every batch removed from the durable store is also removed from the
//! secondary indexes, so stale ids never surface in later reads.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::entry::now_millis;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{DurableStore, EntryIndex, StorageBackend, StorageError};

pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 1000;

/// Epoch-millis cutoff for `horizon` before now.
pub fn cutoff_for(horizon: Duration) -> i64 {
    now_millis().saturating_sub(horizon.as_millis().min(i64::MAX as u128) as i64)
}

/// Delete every entry with `occurred_at < cutoff`, `batch_size` at a time.
///
/// Stops after the first batch that selects fewer than `batch_size` rows.
/// Returns the number of rows actually removed.
pub async fn sweep_expired(
    durable: &dyn DurableStore,
    index: Option<&dyn EntryIndex>,
    cutoff: i64,
    batch_size: usize,
) -> Result<u64, StorageError> {
    let batch_size = batch_size.max(1);
    let mut total = 0u64;

    loop {
        let batch = durable.delete_expired_batch(cutoff, batch_size).await?;
        total += batch.removed;

        if let Some(index) = index {
            if !batch.entries.is_empty() {
                let result = retry("index_remove_expired", &RetryConfig::query(), || {
                    index.remove_entries(&batch.entries)
                })
                .await;
                if let Err(e) = result {
                    warn!(error = %e, count = batch.entries.len(), "Failed to drop expired ids from secondary indexes");
                }
            }
        }

        debug!(removed = batch.removed, total, "Retention batch deleted");
        if batch.entries.len() < batch_size {
            return Ok(total);
        }
    }
}

/// Periodic retention over a storage backend.
pub struct RetentionSweeper {
    backend: Arc<dyn StorageBackend>,
    horizon: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(backend: Arc<dyn StorageBackend>, horizon: Duration, interval: Duration) -> Self {
        Self {
            backend,
            horizon,
            interval,
        }
    }

    #[tracing::instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn sweep_now(&self) -> Result<u64, StorageError> {
        let removed = self.backend.delete_expired(self.horizon).await?;
        crate::metrics::record_swept(removed);
        if removed > 0 {
            info!(removed, horizon_secs = self.horizon.as_secs(), "Expired entries swept");
        }
        Ok(removed)
    }

    /// Sweep on every tick until `shutdown` flips to `true`.
    ///
    /// A failed sweep is logged; the next tick tries again.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_now().await {
                            error!(error = %e, "Retention sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Retention sweeper stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}
