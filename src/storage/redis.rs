// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis buffer queue and secondary indexes.
//!
//! [`RedisBuffer`] holds the two FIFO lists the buffered backend writes to.
//! Pop-N uses `LPOP key count` (Redis 6.2+), which is atomic, so several
//! flush workers can drain the same list without coordination.
//!
//! [`RedisIndex`] keeps the secondary indexes described in
//! [`KeySpace`](super::keys::KeySpace): one `entry:<id>` string per entry
//! (TTL = retention horizon) plus sorted sets scored by `occurred_at` and
//! tag membership sets. All writes for a batch go through one `MULTI`
//! pipeline.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, RedisError};
use tracing::{debug, info};

use super::keys::KeySpace;
use super::traits::{BufferQueue, EntryIndex, StorageError};
use crate::entry::CanonicalEntry;
use crate::resilience::retry::{retry, RetryConfig};

fn map_redis_err(err: RedisError) -> StorageError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        StorageError::Unavailable(err.to_string())
    } else {
        StorageError::Backend(err.to_string())
    }
}

/// `LPUSH` pushes left one at a time, so the last argument ends up at the
/// head. Reverse to keep the original order.
fn requeue_args(records: &[String]) -> Vec<&str> {
    records.iter().rev().map(String::as_str).collect()
}

async fn open(client: &Client) -> Result<ConnectionManager, StorageError> {
    // Startup config: fail fast, don't hang forever
    retry("redis_connect", &RetryConfig::startup(), || async {
        ConnectionManager::new(client.clone()).await
    })
    .await
    .map_err(map_redis_err)
}

pub struct RedisBuffer {
    client: Client,
    connection: RwLock<ConnectionManager>,
}

impl RedisBuffer {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;
        let connection = open(&client).await?;
        info!("Redis buffer connected");
        Ok(Self {
            client,
            connection: RwLock::new(connection),
        })
    }

    /// Clone of the current connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.read().clone()
    }

    /// Secondary indexes sharing this buffer's connection.
    pub fn index(&self, keys: KeySpace, retention: Duration) -> RedisIndex {
        RedisIndex::new(self.connection(), keys, retention)
    }
}

#[async_trait]
impl BufferQueue for RedisBuffer {
    async fn push(&self, key: &str, record: String) -> Result<(), StorageError> {
        let mut conn = self.connection();
        let _: () = cmd("RPUSH")
            .arg(key)
            .arg(record)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn pop_batch(&self, key: &str, max: usize) -> Result<Vec<String>, StorageError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection();
        let records: Option<Vec<String>> = cmd("LPOP")
            .arg(key)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(records.unwrap_or_default())
    }

    async fn requeue_front(&self, key: &str, records: &[String]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        let _: () = cmd("LPUSH")
            .arg(key)
            .arg(requeue_args(records))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection();
        cmd("LLEN").arg(key).query_async(&mut conn).await.map_err(map_redis_err)
    }

    async fn clear(&self, keys: &[&str]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        let _: () = cmd("DEL").arg(keys).query_async(&mut conn).await.map_err(map_redis_err)?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StorageError> {
        let fresh = open(&self.client).await?;
        *self.connection.write() = fresh;
        debug!("Redis buffer reconnected");
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        let mut conn = self.connection();
        cmd("PING").query_async::<String>(&mut conn).await.is_ok()
    }
}

pub struct RedisIndex {
    connection: ConnectionManager,
    keys: KeySpace,
    ttl_secs: i64,
}

impl RedisIndex {
    pub fn new(connection: ConnectionManager, keys: KeySpace, retention: Duration) -> Self {
        Self {
            connection,
            keys,
            ttl_secs: retention.as_secs().clamp(1, i64::MAX as u64) as i64,
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        cmd("ZCARD").arg(key).query_async(&mut conn).await.map_err(map_redis_err)
    }

    /// All keys matching `pattern`, via cursor SCAN.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            found.extend(keys);
            if next == 0 {
                return Ok(found);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl EntryIndex for RedisIndex {
    async fn index_entries(&self, entries: &[CanonicalEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }

        let prepared: Vec<(String, String)> = entries
            .iter()
            .map(|e| -> Result<(String, String), StorageError> { Ok((self.keys.entry(&e.id), serde_json::to_string(e)?)) })
            .collect::<Result<_, StorageError>>()?;

        let conn = self.connection.clone();
        retry("redis_index_entries", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let prepared = &prepared;
            async move {
                let mut pipeline = pipe();
                pipeline.atomic();
                for (entry, (entry_key, doc)) in entries.iter().zip(prepared) {
                    pipeline.cmd("SET").arg(entry_key).arg(doc).arg("EX").arg(self.ttl_secs).ignore();
                    for key in self.keys.sorted_indexes_for(entry) {
                        pipeline.cmd("ZADD").arg(&key).arg(entry.occurred_at).arg(&entry.id).ignore();
                    }
                    // Per-batch/family/tag keys age out once they stop receiving entries
                    let mut grouped: Vec<String> = self.keys.tag_indexes_for(entry);
                    for key in &grouped {
                        pipeline.cmd("SADD").arg(key).arg(&entry.id).ignore();
                    }
                    grouped.extend(entry.batch_id.as_deref().map(|b| self.keys.batch(b)));
                    grouped.extend(entry.family_hash.as_deref().map(|f| self.keys.family(f)));
                    for key in &grouped {
                        pipeline.cmd("EXPIRE").arg(key).arg(self.ttl_secs).ignore();
                    }
                }
                pipeline.query_async::<()>(&mut conn).await
            }
        })
        .await
        .map_err(map_redis_err)
    }

    async fn refresh_entry(&self, entry: &CanonicalEntry) -> Result<(), StorageError> {
        let doc = serde_json::to_string(entry)?;
        let mut conn = self.connection.clone();
        // XX: an expired entry is not resurrected
        let _: Option<String> = cmd("SET")
            .arg(self.keys.entry(&entry.id))
            .arg(doc)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn remove_entries(&self, entries: &[CanonicalEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }

        let conn = self.connection.clone();
        retry("redis_remove_entries", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let mut pipeline = pipe();
                pipeline.atomic();
                for entry in entries {
                    pipeline.cmd("DEL").arg(self.keys.entry(&entry.id)).ignore();
                    for key in self.keys.sorted_indexes_for(entry) {
                        pipeline.cmd("ZREM").arg(&key).arg(&entry.id).ignore();
                    }
                    for key in self.keys.tag_indexes_for(entry) {
                        pipeline.cmd("SREM").arg(&key).arg(&entry.id).ignore();
                    }
                }
                pipeline.query_async::<()>(&mut conn).await
            }
        })
        .await
        .map_err(map_redis_err)
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let indexed = self.zcard(&self.keys.all()).await?;

        let mut doomed = vec![self.keys.all(), self.keys.visible()];
        for kind in ["entry:", "type:", "batch:", "family:", "tag:"] {
            doomed.extend(self.scan(&format!("{}{}*", self.keys.prefix(), kind)).await?);
        }

        let mut conn = self.connection.clone();
        for chunk in doomed.chunks(500) {
            let _: () = cmd("DEL").arg(chunk).query_async(&mut conn).await.map_err(map_redis_err)?;
        }
        info!(indexed, keys = doomed.len(), "Cleared Redis secondary indexes");
        Ok(indexed)
    }
}
