//! Chaos Testing for the flush path
//!
//! Wraps the in-process durable store and queue with failure injection at
//! specific call counts, then checks what the flush service does with it:
//! retry the same batch, reconnect between attempts, requeue at the ceiling
//! and resume on the next run.
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use scope_recorder::entry::{CanonicalEntry, EntryType, NewEntry};
use scope_recorder::flush::FlushService;
use scope_recorder::storage::buffered::BufferedStore;
use scope_recorder::storage::keys::KeySpace;
use scope_recorder::storage::memory::{InMemoryStore, MemoryIndex, MemoryQueue};
use scope_recorder::storage::traits::{
    BufferQueue, DurableStore, EntryFilter, EntryIndex, ExpiredBatch, StorageBackend, StorageError,
};
use scope_recorder::RetryConfig;

// =============================================================================
// Failing Store Wrappers - Precise Error Injection
// =============================================================================

fn fast_retry(attempts: usize) -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 2.0,
        max_retries: Some(attempts),
    }
}

/// Durable store failing `insert_batch` on chosen call numbers (1-indexed),
/// or on every call while `down` is set. Batches holding a poisoned id are
/// rejected outright, as a database refuses a row it can never accept.
struct FailingDurable {
    inner: InMemoryStore,
    insert_calls: AtomicU64,
    fail_on_calls: Vec<u64>,
    down: AtomicBool,
    reconnects: AtomicU64,
    poisoned: Mutex<HashSet<String>>,
}

impl FailingDurable {
    fn new(fail_on_calls: Vec<u64>) -> Self {
        Self {
            inner: InMemoryStore::new(),
            insert_calls: AtomicU64::new(0),
            fail_on_calls,
            down: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    fn poison(&self, id: &str) {
        self.poisoned.lock().unwrap().insert(id.to_string());
    }

    fn always_down() -> Self {
        let store = Self::new(Vec::new());
        store.down.store(true, Ordering::SeqCst);
        store
    }

    fn heal(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    fn outage(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for FailingDurable {
    async fn insert_batch(&self, entries: &[CanonicalEntry]) -> Result<usize, StorageError> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.outage() || self.fail_on_calls.contains(&call) {
            return Err(StorageError::Unavailable(format!("injected failure on call {}", call)));
        }
        if let Some(bad) = entries.iter().find(|e| self.poisoned.lock().unwrap().contains(&e.id)) {
            return Err(StorageError::Rejected(format!("row {} violates a constraint", bad.id)));
        }
        self.inner.insert_batch(entries).await
    }

    async fn merge_into_latest(
        &self,
        batch_id: &str,
        entry_type: &EntryType,
        updates: &Map<String, Value>,
    ) -> Result<Option<CanonicalEntry>, StorageError> {
        if self.outage() {
            return Err(StorageError::Unavailable("injected outage".into()));
        }
        self.inner.merge_into_latest(batch_id, entry_type, updates).await
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalEntry>, StorageError> {
        self.inner.get(id).await
    }

    async fn query(
        &self,
        filter: &EntryFilter,
        visible_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CanonicalEntry>, StorageError> {
        self.inner.query(filter, visible_only, limit, offset).await
    }

    async fn count(&self, filter: &EntryFilter, visible_only: bool) -> Result<u64, StorageError> {
        self.inner.count(filter, visible_only).await
    }

    async fn batch_entries(&self, batch_id: &str) -> Result<Vec<CanonicalEntry>, StorageError> {
        self.inner.batch_entries(batch_id).await
    }

    async fn delete_all(&self) -> Result<u64, StorageError> {
        self.inner.delete_all().await
    }

    async fn delete_expired_batch(&self, cutoff: i64, limit: usize) -> Result<ExpiredBatch, StorageError> {
        self.inner.delete_expired_batch(cutoff, limit).await
    }

    async fn reconnect(&self) -> Result<(), StorageError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        !self.outage()
    }
}

/// Queue failing `pop_batch` on chosen call numbers (1-indexed).
struct FailingQueue {
    inner: MemoryQueue,
    pop_calls: AtomicU64,
    fail_on_calls: Vec<u64>,
}

#[async_trait]
impl BufferQueue for FailingQueue {
    async fn push(&self, key: &str, record: String) -> Result<(), StorageError> {
        self.inner.push(key, record).await
    }

    async fn pop_batch(&self, key: &str, max: usize) -> Result<Vec<String>, StorageError> {
        let call = self.pop_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_calls.contains(&call) {
            return Err(StorageError::Backend("injected pop failure".into()));
        }
        self.inner.pop_batch(key, max).await
    }

    async fn requeue_front(&self, key: &str, records: &[String]) -> Result<(), StorageError> {
        self.inner.requeue_front(key, records).await
    }

    async fn len(&self, key: &str) -> Result<u64, StorageError> {
        self.inner.len(key).await
    }

    async fn clear(&self, keys: &[&str]) -> Result<(), StorageError> {
        self.inner.clear(keys).await
    }

    async fn is_ready(&self) -> bool {
        true
    }
}

fn attrs(batch: &str, n: usize) -> NewEntry {
    NewEntry::new(EntryType::Query)
        .with_batch_id(batch)
        .with_payload(json!({"sql": format!("SELECT {}", n)}))
}

async fn write_n(store: &BufferedStore, batch: &str, n: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        ids.push(store.write(attrs(batch, i)).await.unwrap().id);
    }
    ids
}

// =============================================================================
// Durable Store Failures
// =============================================================================

#[tokio::test]
async fn flush_recovers_when_first_insert_fails() {
    let durable = Arc::new(FailingDurable::new(vec![1]));
    let queue = Arc::new(MemoryQueue::new());
    let store = BufferedStore::new(queue, durable.clone(), KeySpace::default());
    write_n(&store, "b1", 10).await;

    let flusher = FlushService::for_store(&store).with_retry(fast_retry(3));
    let report = flusher.run().await;

    assert_eq!(report.flushed, 10);
    assert!(!report.halted);
    assert_eq!(durable.count(&EntryFilter::new(), false).await.unwrap(), 10);
    assert_eq!(durable.insert_calls.load(Ordering::SeqCst), 2, "same batch retried once");
    assert_eq!(durable.reconnects.load(Ordering::SeqCst), 1, "fresh connection before retry");
}

#[tokio::test]
async fn flush_ceiling_requeues_batch_in_order() {
    let durable = Arc::new(FailingDurable::always_down());
    let queue = Arc::new(MemoryQueue::new());
    let keys = KeySpace::default();
    let store = BufferedStore::new(queue.clone(), durable.clone(), keys.clone());
    let ids = write_n(&store, "b1", 4).await;

    let flusher = FlushService::for_store(&store).with_retry(fast_retry(3));
    let report = flusher.run().await;

    assert!(report.halted);
    assert_eq!(report.flushed, 0);
    assert_eq!(durable.insert_calls.load(Ordering::SeqCst), 3);
    assert_eq!(queue.len(&keys.buffer_entries()).await.unwrap(), 4, "nothing dropped");

    // Requeued at the head, original order preserved
    let raw = queue.pop_batch(&keys.buffer_entries(), 10).await.unwrap();
    let requeued: Vec<String> = raw
        .iter()
        .map(|r| serde_json::from_str::<CanonicalEntry>(r).unwrap().id)
        .collect();
    assert_eq!(requeued, ids);
    queue.requeue_front(&keys.buffer_entries(), &raw).await.unwrap();

    // Next run after recovery resumes with the same batch
    durable.heal();
    let report = flusher.run().await;
    assert_eq!(report.flushed, 4);
    assert!(!report.halted);
    assert_eq!(queue.len(&keys.buffer_entries()).await.unwrap(), 0);
}

#[tokio::test]
async fn flush_reports_partial_progress_before_ceiling() {
    // Batch 1 succeeds on call 1; batch 2 fails on calls 2..=4 (ceiling 3)
    let durable = Arc::new(FailingDurable::new(vec![2, 3, 4]));
    let queue = Arc::new(MemoryQueue::new());
    let keys = KeySpace::default();
    let store = BufferedStore::new(queue.clone(), durable.clone(), keys.clone());
    write_n(&store, "b1", 12).await;

    let flusher = FlushService::for_store(&store)
        .with_batch_size(5)
        .with_retry(fast_retry(3));
    let report = flusher.run().await;

    assert!(report.halted);
    assert_eq!(report.flushed, 5);
    assert_eq!(durable.count(&EntryFilter::new(), false).await.unwrap(), 5);
    assert_eq!(queue.len(&keys.buffer_entries()).await.unwrap(), 7);

    let report = flusher.run().await;
    assert_eq!(report.flushed, 7);
    assert_eq!(durable.count(&EntryFilter::new(), false).await.unwrap(), 12);
}

#[tokio::test]
async fn updates_wait_while_entries_are_halted() {
    let durable = Arc::new(FailingDurable::always_down());
    let queue = Arc::new(MemoryQueue::new());
    let keys = KeySpace::default();
    let store = BufferedStore::new(queue.clone(), durable.clone(), keys.clone());

    store.write(attrs("req-1", 0)).await.unwrap();
    let mut response = Map::new();
    response.insert("response".into(), json!({"status": 200}));
    store.update_by_batch("req-1", &EntryType::Query, response).await.unwrap();

    let flusher = FlushService::for_store(&store).with_retry(fast_retry(2));
    let report = flusher.run().await;
    assert!(report.halted);
    assert_eq!(report.updates_dropped, 0);
    assert_eq!(queue.len(&keys.buffer_updates()).await.unwrap(), 1, "update kept for next run");

    durable.heal();
    let report = flusher.run().await;
    assert_eq!(report.flushed, 1);
    assert_eq!(report.updates_applied, 1);

    let entry = durable.batch_entries("req-1").await.unwrap().remove(0);
    assert_eq!(entry.payload["response"]["status"], 200);
    assert_eq!(entry.payload["sql"], "SELECT 0");
}

#[tokio::test]
async fn rejected_row_does_not_stall_the_buffer() {
    let durable = Arc::new(FailingDurable::new(Vec::new()));
    let queue = Arc::new(MemoryQueue::new());
    let keys = KeySpace::default();
    let store = BufferedStore::new(queue.clone(), durable.clone(), keys.clone());
    let ids = write_n(&store, "req-1", 5).await;
    durable.poison(&ids[2]);

    let mut response = Map::new();
    response.insert("response".into(), json!({"status": 200}));
    store.update_by_batch("req-1", &EntryType::Query, response).await.unwrap();

    let flusher = FlushService::for_store(&store).with_retry(fast_retry(3));
    let report = flusher.run().await;

    assert!(!report.halted, "a permanent rejection is not an outage");
    assert_eq!(report.flushed, 4);
    assert_eq!(report.discarded, 1);
    assert_eq!(report.updates_applied, 1);
    assert_eq!(queue.len(&keys.buffer_entries()).await.unwrap(), 0);
    assert_eq!(queue.len(&keys.buffer_updates()).await.unwrap(), 0);
    assert!(durable.get(&ids[2]).await.unwrap().is_none());
    assert_eq!(durable.count(&EntryFilter::new(), false).await.unwrap(), 4);

    // Nothing left to retry on the next run
    let report = flusher.run().await;
    assert_eq!(report.flushed, 0);
    assert!(!report.halted);
}

// =============================================================================
// Queue Failures
// =============================================================================

#[tokio::test]
async fn flush_retries_failed_pop() {
    let queue = Arc::new(FailingQueue {
        inner: MemoryQueue::new(),
        pop_calls: AtomicU64::new(0),
        fail_on_calls: vec![1],
    });
    let durable = Arc::new(InMemoryStore::new());
    let store = BufferedStore::new(queue, durable.clone(), KeySpace::default());
    write_n(&store, "b1", 3).await;

    let report = FlushService::for_store(&store).with_retry(fast_retry(3)).run().await;

    assert_eq!(report.flushed, 3);
    assert_eq!(durable.len(), 3);
}

#[tokio::test]
async fn flush_halts_when_queue_stays_down() {
    let queue = Arc::new(FailingQueue {
        inner: MemoryQueue::new(),
        pop_calls: AtomicU64::new(0),
        fail_on_calls: vec![1, 2, 3],
    });
    let durable = Arc::new(InMemoryStore::new());
    let store = BufferedStore::new(queue, durable.clone(), KeySpace::default());
    write_n(&store, "b1", 3).await;

    let report = FlushService::for_store(&store).with_retry(fast_retry(3)).run().await;

    assert!(report.halted);
    assert_eq!(report.flushed, 0);
    assert!(durable.is_empty());
}

// =============================================================================
// Corruption and Concurrency
// =============================================================================

#[tokio::test]
async fn garbage_records_are_discarded_not_fatal() {
    let queue = Arc::new(MemoryQueue::new());
    let durable = Arc::new(InMemoryStore::new());
    let keys = KeySpace::default();
    let store = BufferedStore::new(queue.clone(), durable.clone(), keys.clone());

    write_n(&store, "b1", 2).await;
    queue.push(&keys.buffer_entries(), "{not json".into()).await.unwrap();
    queue.push(&keys.buffer_entries(), r#"{"id":"x"}"#.into()).await.unwrap();
    queue.push(&keys.buffer_updates(), "[]".into()).await.unwrap();

    let report = FlushService::for_store(&store).run().await;

    assert_eq!(report.flushed, 2);
    assert_eq!(report.discarded, 3);
    assert_eq!(durable.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_flush_workers_never_double_process() {
    let queue = Arc::new(MemoryQueue::new());
    let durable = Arc::new(InMemoryStore::new());
    let index = Arc::new(MemoryIndex::default());
    let store = BufferedStore::new(queue, durable.clone(), KeySpace::default()).with_index(index.clone());
    let ids: HashSet<String> = write_n(&store, "b1", 200).await.into_iter().collect();

    let flusher = Arc::new(FlushService::for_store(&store).with_batch_size(7));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let flusher = flusher.clone();
            tokio::spawn(async move { flusher.run().await })
        })
        .collect();

    let mut flushed = 0;
    for worker in workers {
        let report = worker.await.unwrap();
        assert_eq!(report.discarded, 0, "duplicate ids would be rejected");
        flushed += report.flushed;
    }

    assert_eq!(flushed, 200);
    assert_eq!(durable.len(), 200);
    assert_eq!(index.len(), 200);

    let stored: HashSet<String> = durable
        .query(&EntryFilter::new(), false, 500, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(stored, ids);
}
