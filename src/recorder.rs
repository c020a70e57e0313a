// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capture façade.
//!
//! [`Recorder`] is what instrumentation hooks call. For every event it
//! resolves the current [`CorrelationContext`](crate::context::CorrelationContext),
//! merges the context attributes and tags, redacts the payload, computes the
//! family hash and hands the entry to the storage backend selected at
//! startup. Capture never returns an error to the instrumented application:
//! failures are logged, counted and swallowed.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use scope_recorder::context;
//! use scope_recorder::payload::{EventPayload, QueryEvent};
//! use scope_recorder::storage::direct::DirectStore;
//! use scope_recorder::storage::memory::InMemoryStore;
//! use scope_recorder::{Recorder, RecorderConfig};
//!
//! # tokio_test_block_on(async {
//! let config = RecorderConfig { enabled: true, ..Default::default() };
//! let backend = Arc::new(DirectStore::new(Arc::new(InMemoryStore::new())));
//! let recorder = Recorder::new(config, backend);
//!
//! let entry = context::scope(async {
//!     recorder
//!         .record(EventPayload::Query(QueryEvent {
//!             sql: "SELECT * FROM users WHERE id = 1".into(),
//!             name: Some("User Load".into()),
//!             duration_ms: 0.4,
//!             cached: false,
//!             row_count: Some(1),
//!         }))
//!         .await
//! })
//! .await
//! .unwrap();
//!
//! assert!(entry.batch_id.is_some());
//! assert!(entry.family_hash.is_some());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RecorderConfig, StorageKind};
use crate::context;
use crate::entry::{CanonicalEntry, EntryType};
use crate::family::family_hash;
use crate::flush::{FlushReport, FlushService};
use crate::page::{self, Page};
use crate::redact::Redactor;
use crate::resilience::retry::RetryConfig;
use crate::retention::RetentionSweeper;
use crate::payload::EventPayload;
use crate::storage::buffered::BufferedStore;
use crate::storage::direct::DirectStore;
use crate::storage::keys::KeySpace;
use crate::storage::memory::InMemoryStore;
use crate::storage::redis::RedisBuffer;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{DurableStore, EntryFilter, StorageBackend, StorageError};

pub struct Recorder {
    config: RecorderConfig,
    backend: Arc<dyn StorageBackend>,
    redactor: Redactor,
    flusher: Option<Arc<FlushService>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Recorder {
    /// Recorder over an already-built backend, with no background loops.
    pub fn new(config: RecorderConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let redactor = Redactor::new(config.sensitive_keys.iter().cloned());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            backend,
            redactor,
            flusher: None,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the stores named by `config`, select the backend and spawn the
    /// flush (buffered only) and retention loops.
    ///
    /// Without `sql_url` the durable store is in-process and does not
    /// survive a restart.
    #[tracing::instrument(skip(config), fields(storage = ?config.storage))]
    pub async fn start(config: RecorderConfig) -> Result<Self, StorageError> {
        config
            .validate()
            .map_err(|e| StorageError::Malformed(e.to_string()))?;

        let durable: Arc<dyn DurableStore> = match config.sql_url {
            Some(ref url) => Arc::new(SqlStore::new(url).await?),
            None => {
                warn!("No sql_url configured - entries are kept in memory only");
                Arc::new(InMemoryStore::new())
            }
        };

        let (backend, flusher): (Arc<dyn StorageBackend>, Option<Arc<FlushService>>) = match config.storage {
            StorageKind::Direct => {
                let store = DirectStore::new(durable).with_sweep_batch_size(config.sweep_batch_size);
                (Arc::new(store), None)
            }
            StorageKind::Buffered => {
                let url = config
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| StorageError::Malformed("buffered storage requires redis_url".into()))?;
                let buffer = RedisBuffer::new(url).await?;
                let keys = KeySpace::new(config.redis_prefix.clone());
                let index = buffer.index(keys.clone(), config.retention_horizon());

                let store = BufferedStore::new(Arc::new(buffer), durable, keys)
                    .with_index(Arc::new(index))
                    .with_sweep_batch_size(config.sweep_batch_size);
                let flusher = FlushService::for_store(&store)
                    .with_batch_size(config.flush_batch_size)
                    .with_retry(RetryConfig::flush(config.flush_max_retries));
                (Arc::new(store), Some(Arc::new(flusher)))
            }
        };

        let mut recorder = Self::new(config, backend);
        recorder.flusher = flusher;
        recorder.spawn_loops();

        let ready = recorder.backend.is_ready().await;
        crate::metrics::set_backend_ready(recorder.backend.name(), ready);
        info!(backend = recorder.backend.name(), ready, "Recorder started");
        Ok(recorder)
    }

    fn spawn_loops(&self) {
        let mut tasks = self.tasks.lock();
        if let Some(ref flusher) = self.flusher {
            tasks.push(flusher.clone().spawn(self.config.flush_interval(), self.shutdown_tx.subscribe()));
        }
        let sweeper = RetentionSweeper::new(
            self.backend.clone(),
            self.config.retention_horizon(),
            self.config.sweep_interval(),
        );
        tasks.push(sweeper.spawn(self.shutdown_tx.subscribe()));
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether a request to `path` should be captured at all.
    pub fn should_record(&self, path: &str) -> bool {
        self.config.enabled && !self.config.is_ignored_path(path)
    }

    /// Capture one event in the calling unit's context.
    ///
    /// Returns the written entry, or `None` when capture is disabled or the
    /// write failed.
    pub async fn record(&self, event: EventPayload) -> Option<CanonicalEntry> {
        if !self.config.enabled {
            crate::metrics::record_capture_skipped("disabled");
            return None;
        }
        let _timer = crate::metrics::LatencyTimer::new(self.backend.name());

        if !context::in_scope() {
            debug!(entry_type = %event.entry_type(), "No correlation scope, entry gets its own batch");
        }
        let family = family_hash(event.family_components());
        let mut attrs = event.into_entry();
        let (batch_id, fields, tags) =
            context::with_current(|ctx| (ctx.batch_id(), ctx.payload_fields(), ctx.tags().to_vec()));

        attrs.payload.extend(fields);
        attrs.payload = self.redactor.redact_map(&attrs.payload);
        let attrs = attrs.with_batch_id(batch_id).with_family_hash(family).with_tags(tags);
        let entry_type = attrs.entry_type.clone();

        match self.backend.write(attrs).await {
            Ok(entry) => {
                debug!(id = %entry.id, entry_type = %entry.entry_type, "Entry recorded");
                Some(entry)
            }
            Err(e) => {
                warn!(entry_type = %entry_type, error = %e, "Failed to record entry");
                crate::metrics::record_capture_failure("write");
                None
            }
        }
    }

    /// Merge later-arriving data (e.g. the response) into the newest
    /// `entry_type` entry of the calling unit's batch.
    ///
    /// Does nothing outside a unit that has started a batch.
    pub async fn attach_response(&self, entry_type: EntryType, updates: Map<String, Value>) {
        if !self.config.enabled {
            return;
        }
        let Some(batch_id) = context::with_current(|ctx| ctx.peek_batch_id().map(str::to_string)) else {
            debug!(entry_type = %entry_type, "No batch in context, response not attached");
            return;
        };

        let updates = self.redactor.redact_map(&updates);
        if let Err(e) = self.backend.update_by_batch(&batch_id, &entry_type, updates).await {
            warn!(batch_id = %batch_id, entry_type = %entry_type, error = %e, "Failed to attach response");
            crate::metrics::record_capture_failure("update");
        }
    }

    /// One page of entries at the configured page size.
    pub async fn list(
        &self,
        filter: &EntryFilter,
        page: usize,
        visible_only: bool,
    ) -> Result<Page<CanonicalEntry>, StorageError> {
        page::list_page(self.backend.as_ref(), filter, page, self.config.per_page, visible_only).await
    }

    /// One page of a family's recurrences at the configured page size.
    pub async fn family(&self, family_hash: &str, page: usize) -> Result<Page<CanonicalEntry>, StorageError> {
        page::family_page(self.backend.as_ref(), family_hash, page, self.config.per_page).await
    }

    /// Flush the buffer now instead of waiting for the next tick.
    ///
    /// `None` for direct storage, which has nothing to flush.
    pub async fn flush_now(&self) -> Option<FlushReport> {
        match self.flusher {
            Some(ref flusher) => Some(flusher.run().await),
            None => None,
        }
    }

    pub async fn is_ready(&self) -> bool {
        let ready = self.backend.is_ready().await;
        crate::metrics::set_backend_ready(self.backend.name(), ready);
        ready
    }

    /// Stop the background loops. The flush loop drains once more first.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Recorder shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CorrelationContext;
    use crate::payload::{RequestEvent, ViewEvent};
    use crate::storage::memory::{MemoryIndex, MemoryQueue};
    use serde_json::json;

    fn enabled() -> RecorderConfig {
        RecorderConfig {
            enabled: true,
            ..Default::default()
        }
    }

    fn direct() -> (Arc<InMemoryStore>, Recorder) {
        let durable = Arc::new(InMemoryStore::new());
        let recorder = Recorder::new(enabled(), Arc::new(DirectStore::new(durable.clone())));
        (durable, recorder)
    }

    fn request(status: u16) -> EventPayload {
        EventPayload::Request(RequestEvent {
            method: "GET".into(),
            path: "/login".into(),
            status,
            duration_ms: 12.5,
            controller: Some("SessionsController".into()),
            action: Some("create".into()),
            format: None,
            params: Some(json!({"user": {"email": "a@b.c", "password": "hunter2"}})),
            headers: None,
            ip: None,
        })
    }

    #[tokio::test]
    async fn test_record_merges_context_and_redacts() {
        let (_, recorder) = direct();

        let mut ctx = CorrelationContext::with_batch_id("req-1");
        ctx.set_request_id("req-1");
        ctx.set_user_id("7");
        ctx.add_tag("beta");

        let entry = context::scope_with(ctx, recorder.record(request(422))).await.unwrap();

        assert_eq!(entry.batch_id.as_deref(), Some("req-1"));
        assert_eq!(entry.payload["request_id"], "req-1");
        assert_eq!(entry.payload["user_id"], "7");
        assert_eq!(entry.payload["params"]["user"]["password"], "[FILTERED]");
        assert_eq!(entry.payload["params"]["user"]["email"], "a@b.c");
        assert_eq!(entry.tags, vec!["request", "get", "error", "beta"]);
        assert!(entry.family_hash.is_none());
    }

    #[tokio::test]
    async fn test_entries_in_one_scope_share_a_batch() {
        let (durable, recorder) = direct();

        let batch = context::scope(async {
            recorder.record(request(200)).await;
            recorder
                .record(EventPayload::View(ViewEvent {
                    name: "sessions/_form".into(),
                    path: "app/views/sessions/_form.html.erb".into(),
                    duration_ms: 1.0,
                    partial: true,
                    layout: None,
                }))
                .await;
            context::batch_id()
        })
        .await;

        let entries = durable.batch_entries(&batch).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[1].visible_in_listing);
        assert_eq!(recorder.backend().count(&EntryFilter::new(), true).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_unscoped_records_get_separate_batches() {
        let (_, recorder) = direct();
        let recorder = Arc::new(recorder);

        let a = tokio::spawn({
            let recorder = recorder.clone();
            async move { recorder.record(request(200)).await }
        });
        let b = tokio::spawn({
            let recorder = recorder.clone();
            async move { recorder.record(request(500)).await }
        });

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(a.batch_id.is_some());
        assert_ne!(a.batch_id, b.batch_id);
    }

    #[tokio::test]
    async fn test_disabled_recorder_writes_nothing() {
        let durable = Arc::new(InMemoryStore::new());
        let recorder = Recorder::new(RecorderConfig::default(), Arc::new(DirectStore::new(durable.clone())));

        assert!(recorder.record(request(200)).await.is_none());
        assert!(!recorder.should_record("/orders"));
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_should_record_ignores_paths() {
        let (_, recorder) = direct();
        assert!(recorder.should_record("/orders"));
        assert!(!recorder.should_record("/recorder/api/entries"));
        assert!(!recorder.should_record("/cable"));
    }

    #[tokio::test]
    async fn test_attach_response_merges_into_request() {
        let (durable, recorder) = direct();

        let batch = context::scope(async {
            recorder.record(request(200)).await;
            let mut body = Map::new();
            body.insert("response".into(), json!({"status": 200, "token": "abc"}));
            recorder.attach_response(EntryType::Request, body).await;
            context::batch_id()
        })
        .await;

        let entry = durable.batch_entries(&batch).await.unwrap().remove(0);
        assert_eq!(entry.payload["response"]["status"], 200);
        assert_eq!(entry.payload["response"]["token"], "[FILTERED]");
        assert_eq!(entry.payload["path"], "/login");
    }

    #[tokio::test]
    async fn test_attach_response_without_batch_is_noop() {
        let (durable, recorder) = direct();
        context::scope(recorder.attach_response(EntryType::Request, Map::new())).await;
        assert!(durable.is_empty());
    }

    /// Durable store whose every call fails with a transient error.
    struct DownStore;

    #[async_trait::async_trait]
    impl DurableStore for DownStore {
        async fn insert_batch(&self, _: &[CanonicalEntry]) -> Result<usize, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn merge_into_latest(
            &self,
            _: &str,
            _: &EntryType,
            _: &Map<String, Value>,
        ) -> Result<Option<CanonicalEntry>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<CanonicalEntry>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn query(&self, _: &EntryFilter, _: bool, _: usize, _: usize) -> Result<Vec<CanonicalEntry>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn count(&self, _: &EntryFilter, _: bool) -> Result<u64, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn batch_entries(&self, _: &str) -> Result<Vec<CanonicalEntry>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn delete_all(&self) -> Result<u64, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn delete_expired_batch(
            &self,
            _: i64,
            _: usize,
        ) -> Result<crate::storage::traits::ExpiredBatch, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn is_ready(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let backend = DirectStore::new(Arc::new(DownStore)).with_retry(RetryConfig::test());
        let recorder = Recorder::new(enabled(), Arc::new(backend));

        assert!(context::scope(recorder.record(request(200))).await.is_none());

        let mut body = Map::new();
        body.insert("response".into(), json!({}));
        context::scope(async {
            context::batch_id();
            recorder.attach_response(EntryType::Request, body).await;
        })
        .await;

        assert!(!recorder.is_ready().await);
    }

    #[tokio::test]
    async fn test_buffered_flush_now_and_shutdown() {
        let queue = Arc::new(MemoryQueue::new());
        let durable = Arc::new(InMemoryStore::new());
        let store = BufferedStore::new(queue, durable.clone(), KeySpace::default())
            .with_index(Arc::new(MemoryIndex::default()));
        let flusher = Arc::new(FlushService::for_store(&store));

        let mut recorder = Recorder::new(enabled(), Arc::new(store));
        recorder.flusher = Some(flusher);
        recorder.spawn_loops();

        context::scope(recorder.record(request(200))).await;

        // The loop may have drained it already; either way it is durable now
        let report = recorder.flush_now().await.unwrap();
        assert!(!report.halted);
        assert_eq!(durable.len(), 1);

        context::scope(recorder.record(request(201))).await;
        recorder.shutdown().await;
        assert_eq!(durable.len(), 2);

        let page = recorder.list(&EntryFilter::new(), 1, true).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.total_pages, 1);
    }

    #[tokio::test]
    async fn test_direct_has_nothing_to_flush() {
        let (_, recorder) = direct();
        assert!(recorder.flush_now().await.is_none());
        assert!(recorder.is_ready().await);
    }

    #[tokio::test]
    async fn test_start_in_memory_direct() {
        let recorder = Recorder::start(enabled()).await.unwrap();
        assert_eq!(recorder.backend().name(), "direct");
        context::scope(recorder.record(request(200))).await.unwrap();
        recorder.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_buffered_without_redis() {
        let config = RecorderConfig {
            storage: StorageKind::Buffered,
            ..enabled()
        };
        assert!(matches!(Recorder::start(config).await, Err(StorageError::Malformed(_))));
    }
}
