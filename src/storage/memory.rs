// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process implementations of the storage contracts.
//!
//! Used for embedded runs without external services and as the baseline for
//! tests. Semantics match the SQL and Redis implementations: ordering by
//! `occurred_at`, all-or-nothing batch inserts, atomic pop-N.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use super::keys::KeySpace;
use super::traits::{BufferQueue, DurableStore, EntryFilter, EntryIndex, ExpiredBatch, StorageError};
use crate::entry::{CanonicalEntry, EntryType};

struct StoredEntry {
    /// Insertion order; breaks `created_at` ties for "most recently created".
    seq: u64,
    entry: CanonicalEntry,
}

/// Durable store kept in process memory.
pub struct InMemoryStore {
    data: RwLock<HashMap<String, StoredEntry>>,
    seq: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Matching entries sorted newest first.
    fn sorted_desc(&self, filter: &EntryFilter, visible_only: bool) -> Vec<CanonicalEntry> {
        let data = self.data.read();
        let mut rows: Vec<&StoredEntry> = data
            .values()
            .filter(|s| filter.matches(&s.entry) && (!visible_only || s.entry.visible_in_listing))
            .collect();
        rows.sort_by(|a, b| {
            b.entry
                .occurred_at
                .cmp(&a.entry.occurred_at)
                .then(b.seq.cmp(&a.seq))
        });
        rows.into_iter().map(|s| s.entry.clone()).collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn insert_batch(&self, entries: &[CanonicalEntry]) -> Result<usize, StorageError> {
        let mut data = self.data.write();

        let mut seen = HashSet::with_capacity(entries.len());
        for entry in entries {
            if data.contains_key(&entry.id) || !seen.insert(entry.id.as_str()) {
                return Err(StorageError::Duplicate(entry.id.clone()));
            }
        }

        for entry in entries {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            data.insert(entry.id.clone(), StoredEntry { seq, entry: entry.clone() });
        }
        Ok(entries.len())
    }

    async fn merge_into_latest(
        &self,
        batch_id: &str,
        entry_type: &EntryType,
        updates: &Map<String, Value>,
    ) -> Result<Option<CanonicalEntry>, StorageError> {
        let mut data = self.data.write();
        let target = data
            .values_mut()
            .filter(|s| s.entry.batch_id.as_deref() == Some(batch_id) && &s.entry.entry_type == entry_type)
            .max_by(|a, b| a.entry.created_at.cmp(&b.entry.created_at).then(a.seq.cmp(&b.seq)));

        Ok(target.map(|stored| {
            stored.entry.merge_payload(updates);
            stored.entry.clone()
        }))
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalEntry>, StorageError> {
        Ok(self.data.read().get(id).map(|s| s.entry.clone()))
    }

    async fn query(
        &self,
        filter: &EntryFilter,
        visible_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CanonicalEntry>, StorageError> {
        Ok(self
            .sorted_desc(filter, visible_only)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn count(&self, filter: &EntryFilter, visible_only: bool) -> Result<u64, StorageError> {
        let data = self.data.read();
        Ok(data
            .values()
            .filter(|s| filter.matches(&s.entry) && (!visible_only || s.entry.visible_in_listing))
            .count() as u64)
    }

    async fn batch_entries(&self, batch_id: &str) -> Result<Vec<CanonicalEntry>, StorageError> {
        let mut rows = self.sorted_desc(&EntryFilter::new().batch_id(batch_id), false);
        rows.reverse();
        Ok(rows)
    }

    async fn delete_all(&self) -> Result<u64, StorageError> {
        let mut data = self.data.write();
        let removed = data.len() as u64;
        data.clear();
        Ok(removed)
    }

    async fn delete_expired_batch(&self, cutoff: i64, limit: usize) -> Result<ExpiredBatch, StorageError> {
        let mut data = self.data.write();
        let mut expired: Vec<(i64, u64, String)> = data
            .values()
            .filter(|s| s.entry.occurred_at < cutoff)
            .map(|s| (s.entry.occurred_at, s.seq, s.entry.id.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit);

        let entries: Vec<CanonicalEntry> = expired
            .iter()
            .filter_map(|(_, _, id)| data.remove(id).map(|s| s.entry))
            .collect();

        Ok(ExpiredBatch {
            removed: entries.len() as u64,
            entries,
        })
    }

    async fn is_ready(&self) -> bool {
        true
    }
}

/// FIFO lists guarded by a single lock, so pop-N is atomic.
#[derive(Default)]
pub struct MemoryQueue {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BufferQueue for MemoryQueue {
    async fn push(&self, key: &str, record: String) -> Result<(), StorageError> {
        self.lists.lock().entry(key.to_string()).or_default().push_back(record);
        Ok(())
    }

    async fn pop_batch(&self, key: &str, max: usize) -> Result<Vec<String>, StorageError> {
        let mut lists = self.lists.lock();
        let Some(list) = lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let n = max.min(list.len());
        Ok(list.drain(..n).collect())
    }

    async fn requeue_front(&self, key: &str, records: &[String]) -> Result<(), StorageError> {
        let mut lists = self.lists.lock();
        let list = lists.entry(key.to_string()).or_default();
        for record in records.iter().rev() {
            list.push_front(record.clone());
        }
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<u64, StorageError> {
        Ok(self.lists.lock().get(key).map_or(0, |l| l.len() as u64))
    }

    async fn clear(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut lists = self.lists.lock();
        for key in keys {
            lists.remove(*key);
        }
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }
}

/// Secondary indexes held in process memory, keyed like the Redis layout.
pub struct MemoryIndex {
    keys: KeySpace,
    entries: DashMap<String, CanonicalEntry>,
    sorted: DashMap<String, BTreeSet<(i64, String)>>,
    members: DashMap<String, HashSet<String>>,
}

impl MemoryIndex {
    #[must_use]
    pub fn new(keys: KeySpace) -> Self {
        Self {
            keys,
            entries: DashMap::new(),
            sorted: DashMap::new(),
            members: DashMap::new(),
        }
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids under one index key: sorted sets oldest first, tag sets sorted.
    #[cfg(test)]
    pub(crate) fn ids(&self, key: &str) -> Vec<String> {
        if let Some(set) = self.sorted.get(key) {
            return set.iter().map(|(_, id)| id.clone()).collect();
        }
        let mut ids: Vec<String> = self
            .members
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: &str) -> Option<CanonicalEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    fn zcard(&self, key: &str) -> u64 {
        self.sorted.get(key).map_or(0, |set| set.len() as u64)
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new(KeySpace::default())
    }
}

#[async_trait]
impl EntryIndex for MemoryIndex {
    async fn index_entries(&self, entries: &[CanonicalEntry]) -> Result<(), StorageError> {
        for entry in entries {
            self.entries.insert(entry.id.clone(), entry.clone());
            for key in self.keys.sorted_indexes_for(entry) {
                self.sorted
                    .entry(key)
                    .or_default()
                    .insert((entry.occurred_at, entry.id.clone()));
            }
            for key in self.keys.tag_indexes_for(entry) {
                self.members.entry(key).or_default().insert(entry.id.clone());
            }
        }
        Ok(())
    }

    async fn refresh_entry(&self, entry: &CanonicalEntry) -> Result<(), StorageError> {
        if let Some(mut stored) = self.entries.get_mut(&entry.id) {
            *stored = entry.clone();
        }
        Ok(())
    }

    async fn remove_entries(&self, entries: &[CanonicalEntry]) -> Result<(), StorageError> {
        for entry in entries {
            self.entries.remove(&entry.id);
            let member = (entry.occurred_at, entry.id.clone());
            for key in self.keys.sorted_indexes_for(entry) {
                if let Some(mut set) = self.sorted.get_mut(&key) {
                    set.remove(&member);
                }
                self.sorted.remove_if(&key, |_, set| set.is_empty());
            }
            for key in self.keys.tag_indexes_for(entry) {
                if let Some(mut set) = self.members.get_mut(&key) {
                    set.remove(&entry.id);
                }
                self.members.remove_if(&key, |_, set| set.is_empty());
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let indexed = self.zcard(&self.keys.all());
        self.entries.clear();
        self.sorted.clear();
        self.members.clear();
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::NewEntry;
    use serde_json::json;
    use std::sync::Arc;

    fn entry(ty: EntryType, batch: &str, at: i64) -> CanonicalEntry {
        CanonicalEntry::from_new(NewEntry::new(ty).with_batch_id(batch).occurred_at(at)).unwrap()
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::default();
        assert!(store.is_empty());
        assert_eq!(store.count(&EntryFilter::new(), false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryStore::new();
        let e = entry(EntryType::Request, "b", 10);
        store.insert_batch(std::slice::from_ref(&e)).await.unwrap();

        assert_eq!(store.get(&e.id).await.unwrap(), Some(e));
        assert!(store.get("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejects_whole_batch() {
        let store = InMemoryStore::new();
        let a = entry(EntryType::Query, "b", 1);
        store.insert_batch(std::slice::from_ref(&a)).await.unwrap();

        let b = entry(EntryType::Query, "b", 2);
        let err = store.insert_batch(&[b.clone(), a.clone()]).await.unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(ref id) if *id == a.id));
        assert!(store.get(&b.id).await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_query_orders_newest_first_and_pages() {
        let store = InMemoryStore::new();
        let rows: Vec<_> = (0..5).map(|i| entry(EntryType::Query, "b", i)).collect();
        store.insert_batch(&rows).await.unwrap();

        let page = store.query(&EntryFilter::new(), false, 2, 1).await.unwrap();
        assert_eq!(page.iter().map(|e| e.occurred_at).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_batch_entries_ascending() {
        let store = InMemoryStore::new();
        store
            .insert_batch(&[
                entry(EntryType::Query, "b", 30),
                entry(EntryType::Request, "b", 10),
                entry(EntryType::View, "other", 20),
            ])
            .await
            .unwrap();

        let rows = store.batch_entries("b").await.unwrap();
        assert_eq!(rows.iter().map(|e| e.occurred_at).collect::<Vec<_>>(), vec![10, 30]);
    }

    #[tokio::test]
    async fn test_merge_targets_most_recently_created() {
        let store = InMemoryStore::new();
        let first = entry(EntryType::Request, "b", 1);
        let second = entry(EntryType::Request, "b", 2);
        store.insert_batch(&[first.clone(), second.clone()]).await.unwrap();

        let updates = json!({"status": 500});
        let merged = store
            .merge_into_latest("b", &EntryType::Request, updates.as_object().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.id, second.id);
        assert_eq!(store.get(&first.id).await.unwrap().unwrap().payload.get("status"), None);

        let missing = store
            .merge_into_latest("nope", &EntryType::Request, updates.as_object().unwrap())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_delete_expired_batch_is_bounded() {
        let store = InMemoryStore::new();
        let rows: Vec<_> = (0..5).map(|i| entry(EntryType::Query, "b", i)).collect();
        store.insert_batch(&rows).await.unwrap();

        let first = store.delete_expired_batch(4, 3).await.unwrap();
        assert_eq!(first.removed, 3);
        let second = store.delete_expired_batch(4, 3).await.unwrap();
        assert_eq!(second.removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_fifo_and_requeue() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            queue.push("q", format!("r{}", i)).await.unwrap();
        }

        let popped = queue.pop_batch("q", 3).await.unwrap();
        assert_eq!(popped, vec!["r0", "r1", "r2"]);
        queue.requeue_front("q", &popped).await.unwrap();

        assert_eq!(queue.pop_batch("q", 10).await.unwrap(), vec!["r0", "r1", "r2", "r3", "r4"]);
        assert_eq!(queue.len("q").await.unwrap(), 0);
        assert!(queue.pop_batch("missing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_pops_never_share_records() {
        let queue = Arc::new(MemoryQueue::new());
        for i in 0..100 {
            queue.push("q", i.to_string()).await.unwrap();
        }

        let mut handles = vec![];
        for _ in 0..4 {
            let q = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut got = vec![];
                loop {
                    let batch = q.pop_batch("q", 7).await.unwrap();
                    if batch.is_empty() {
                        break got;
                    }
                    got.extend(batch);
                }
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for record in handle.await.unwrap() {
                assert!(all.insert(record));
            }
        }
        assert_eq!(all.len(), 100);
    }

    #[tokio::test]
    async fn test_index_lifecycle() {
        let index = MemoryIndex::default();
        let a = CanonicalEntry::from_new(
            NewEntry::new(EntryType::Exception)
                .with_batch_id("b")
                .with_family_hash(Some("f".into()))
                .with_tags(["error"])
                .occurred_at(1),
        )
        .unwrap();
        let b = CanonicalEntry::from_new(
            NewEntry::new(EntryType::Exception)
                .with_batch_id("b")
                .with_family_hash(Some("f".into()))
                .with_visibility(false)
                .occurred_at(2),
        )
        .unwrap();

        index.index_entries(&[a.clone(), b.clone()]).await.unwrap();
        let keys = KeySpace::default();
        assert_eq!(index.len(), 2);
        assert_eq!(index.ids(&keys.batch("b")), vec![a.id.clone(), b.id.clone()]);
        assert_eq!(index.ids(&keys.family("f")), vec![a.id.clone(), b.id.clone()]);
        assert_eq!(index.ids(&keys.tag("error")), vec![a.id.clone()]);
        assert_eq!(index.ids(&keys.all()).len(), 2);
        assert_eq!(index.ids(&keys.visible()), vec![a.id.clone()]);

        let mut merged = b.clone();
        merged.payload.insert("status".into(), json!(500));
        index.refresh_entry(&merged).await.unwrap();
        assert_eq!(index.get(&b.id).unwrap().payload["status"], 500);

        index.remove_entries(std::slice::from_ref(&a)).await.unwrap();
        assert_eq!(index.ids(&keys.batch("b")), vec![b.id.clone()]);
        assert!(index.ids(&keys.tag("error")).is_empty());
        assert!(index.get(&a.id).is_none());

        assert_eq!(index.clear().await.unwrap(), 1);
        assert!(index.is_empty());
        assert!(index.ids(&keys.family("f")).is_empty());
    }
}
