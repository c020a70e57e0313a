// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL durable store.
//!
//! One row per [`CanonicalEntry`] plus a tag membership table:
//!
//! ```sql
//! CREATE TABLE recorder_entries (
//!   id           VARCHAR(64) PRIMARY KEY,
//!   batch_id     VARCHAR(64),
//!   family_hash  VARCHAR(64),
//!   entry_type   VARCHAR(64) NOT NULL,
//!   payload      LONGTEXT NOT NULL,   -- JSON object as text
//!   tags         TEXT NOT NULL,       -- JSON array as text
//!   visible      BIGINT NOT NULL,     -- 0/1
//!   occurred_at  BIGINT NOT NULL,     -- epoch millis
//!   created_at   BIGINT NOT NULL,
//!   updated_at   BIGINT NOT NULL
//! );
//! CREATE TABLE recorder_entry_tags (entry_id VARCHAR(64), tag VARCHAR(191));
//! ```
//!
//! Indexed on `batch_id`, `family_hash`, `entry_type`, `occurred_at`,
//! `(entry_type, visible)` and `recorder_entry_tags.tag`.
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON is kept in TEXT columns because the `Any` driver has no mapping for
//! MySQL's JSON type, and MySQL LONGTEXT/TEXT columns come back as bytes.
//! String columns are therefore read as `String` first and `Vec<u8>` second.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::error::DatabaseError;
use sqlx::mysql::MySqlDatabaseError;
use sqlx::sqlite::SqliteError;
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::traits::{DurableStore, EntryFilter, ExpiredBatch, StorageError};
use crate::entry::{CanonicalEntry, EntryType};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const COLUMNS: &str =
    "id, batch_id, family_hash, entry_type, payload, tags, visible, occurred_at, created_at, updated_at";

/// Lowest bind-parameter limit among the supported drivers (SQLite builds
/// before 3.32). Multi-row statements are split to stay under it.
const MAX_BIND_PARAMS: usize = 999;

const ENTRY_BINDS: usize = 10;

/// Map a driver error onto the storage taxonomy.
///
/// Only connectivity failures and lock contention are transient. Anything
/// else the database reports about the statement is permanent: retrying
/// the same insert can never succeed.
fn map_sqlx_err(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => StorageError::Duplicate(db.to_string()),
        sqlx::Error::Database(ref db) if is_lock_contention(db.as_ref()) => StorageError::Backend(db.to_string()),
        sqlx::Error::Database(db) => StorageError::Rejected(db.to_string()),
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
        other => StorageError::Rejected(other.to_string()),
    }
}

/// SQLite BUSY/LOCKED (any extended code) or MySQL lock wait / deadlock.
fn is_lock_contention(db: &dyn DatabaseError) -> bool {
    if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
        return matches!(mysql.number(), 1205 | 1213);
    }
    if db.try_downcast_ref::<SqliteError>().is_some() {
        return db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6));
    }
    false
}

/// Read a text column as `String` (SQLite) or bytes (MySQL LONGTEXT).
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

fn row_to_entry(row: &AnyRow) -> Result<CanonicalEntry, StorageError> {
    let id = text_column(row, "id").ok_or_else(|| StorageError::Backend("row without id".into()))?;
    let entry_type = EntryType::parse(&text_column(row, "entry_type").unwrap_or_default())?;

    let payload: Map<String, Value> = match text_column(row, "payload") {
        Some(json) => serde_json::from_str(&json)?,
        None => Map::new(),
    };
    let tags: Vec<String> = match text_column(row, "tags") {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };

    Ok(CanonicalEntry {
        id,
        batch_id: text_column(row, "batch_id"),
        family_hash: text_column(row, "family_hash"),
        entry_type,
        payload,
        tags,
        visible_in_listing: row.try_get::<i64, _>("visible").unwrap_or(1) != 0,
        occurred_at: row.try_get("occurred_at").map_err(map_sqlx_err)?,
        created_at: row.try_get("created_at").unwrap_or(0),
        updated_at: row.try_get("updated_at").unwrap_or(0),
    })
}

/// WHERE clause and its string binds for a listing filter.
fn where_clause(filter: &EntryFilter, visible_only: bool) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();

    if let Some(ref ty) = filter.entry_type {
        conditions.push("entry_type = ?");
        binds.push(ty.as_str().to_string());
    }
    if visible_only {
        conditions.push("visible = 1");
    }
    if let Some(ref batch_id) = filter.batch_id {
        conditions.push("batch_id = ?");
        binds.push(batch_id.clone());
    }
    if let Some(ref family_hash) = filter.family_hash {
        conditions.push("family_hash = ?");
        binds.push(family_hash.clone());
    }
    if let Some(ref tag) = filter.tag {
        conditions.push("id IN (SELECT entry_id FROM recorder_entry_tags WHERE tag = ?)");
        binds.push(tag.clone());
    }

    if conditions.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), binds)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct SqlStore {
    url: String,
    pool: RwLock<AnyPool>,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the schema if missing.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let pool = retry("sql_connect", &RetryConfig::startup(), || {
            Self::connect(connection_string, is_sqlite)
        })
        .await?;

        let store = Self {
            url: connection_string.to_string(),
            pool: RwLock::new(pool),
            is_sqlite,
        };
        store.init_schema().await?;
        info!(sqlite = is_sqlite, "SQL durable store ready");
        Ok(store)
    }

    async fn connect(url: &str, is_sqlite: bool) -> Result<AnyPool, StorageError> {
        let pool = AnyPoolOptions::new()
            .max_connections(if is_sqlite { 5 } else { 20 })
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(url)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        // WAL: readers don't block the flush writer
        if is_sqlite {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
            sqlx::query("PRAGMA synchronous = NORMAL")
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        }
        Ok(pool)
    }

    /// Clone of the current pool handle.
    pub fn pool(&self) -> AnyPool {
        self.pool.read().clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS recorder_entries (
                    id TEXT PRIMARY KEY,
                    batch_id TEXT,
                    family_hash TEXT,
                    entry_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    tags TEXT NOT NULL,
                    visible INTEGER NOT NULL DEFAULT 1,
                    occurred_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS recorder_entry_tags (
                    entry_id TEXT NOT NULL,
                    tag TEXT NOT NULL,
                    PRIMARY KEY (entry_id, tag)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_recorder_batch ON recorder_entries (batch_id)",
                "CREATE INDEX IF NOT EXISTS idx_recorder_family ON recorder_entries (family_hash)",
                "CREATE INDEX IF NOT EXISTS idx_recorder_type ON recorder_entries (entry_type)",
                "CREATE INDEX IF NOT EXISTS idx_recorder_occurred ON recorder_entries (occurred_at)",
                "CREATE INDEX IF NOT EXISTS idx_recorder_type_visible ON recorder_entries (entry_type, visible)",
                "CREATE INDEX IF NOT EXISTS idx_recorder_tag ON recorder_entry_tags (tag)",
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS recorder_entries (
                    id VARCHAR(64) PRIMARY KEY,
                    batch_id VARCHAR(64),
                    family_hash VARCHAR(64),
                    entry_type VARCHAR(64) NOT NULL,
                    payload LONGTEXT NOT NULL,
                    tags TEXT NOT NULL,
                    visible BIGINT NOT NULL DEFAULT 1,
                    occurred_at BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    INDEX idx_recorder_batch (batch_id),
                    INDEX idx_recorder_family (family_hash),
                    INDEX idx_recorder_type (entry_type),
                    INDEX idx_recorder_occurred (occurred_at),
                    INDEX idx_recorder_type_visible (entry_type, visible)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS recorder_entry_tags (
                    entry_id VARCHAR(64) NOT NULL,
                    tag VARCHAR(191) NOT NULL,
                    PRIMARY KEY (entry_id, tag),
                    INDEX idx_recorder_tag (tag)
                )
                "#,
            ]
        };

        let pool = self.pool();
        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&pool).await.map_err(map_sqlx_err)
            })
            .await?;
        }
        Ok(())
    }

    async fn fetch_entries(&self, sql: &str, binds: &[String], tail: &[i64]) -> Result<Vec<CanonicalEntry>, StorageError> {
        let pool = self.pool();
        let rows = retry("sql_query", &RetryConfig::query(), || async {
            let mut query = sqlx::query(sql);
            for bind in binds {
                query = query.bind(bind);
            }
            for value in tail {
                query = query.bind(*value);
            }
            query.fetch_all(&pool).await.map_err(map_sqlx_err)
        })
        .await?;

        rows.iter().map(row_to_entry).collect()
    }
}

#[async_trait]
impl DurableStore for SqlStore {
    async fn insert_batch(&self, entries: &[CanonicalEntry]) -> Result<usize, StorageError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let pool = self.pool();
        let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

        for chunk in entries.chunks(MAX_BIND_PARAMS / ENTRY_BINDS) {
            let entry_sql = format!(
                "INSERT INTO recorder_entries ({}) VALUES {}",
                COLUMNS,
                vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&entry_sql);
            for entry in chunk {
                query = query
                    .bind(entry.id.clone())
                    .bind(entry.batch_id.clone())
                    .bind(entry.family_hash.clone())
                    .bind(entry.entry_type.as_str().to_string())
                    .bind(serde_json::to_string(&entry.payload)?)
                    .bind(serde_json::to_string(&entry.tags)?)
                    .bind(i64::from(entry.visible_in_listing))
                    .bind(entry.occurred_at)
                    .bind(entry.created_at)
                    .bind(entry.updated_at);
            }
            query.execute(&mut *tx).await.map_err(map_sqlx_err)?;
        }

        let tag_rows: Vec<(&str, &str)> = entries
            .iter()
            .flat_map(|e| e.tags.iter().map(move |t| (e.id.as_str(), t.as_str())))
            .collect();
        for chunk in tag_rows.chunks(MAX_BIND_PARAMS / 2) {
            let tag_sql = format!(
                "INSERT INTO recorder_entry_tags (entry_id, tag) VALUES {}",
                vec!["(?, ?)"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&tag_sql);
            for (id, tag) in chunk {
                query = query.bind(id.to_string()).bind(tag.to_string());
            }
            query.execute(&mut *tx).await.map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        debug!(count = entries.len(), tags = tag_rows.len(), "Inserted entry batch");
        Ok(entries.len())
    }

    async fn merge_into_latest(
        &self,
        batch_id: &str,
        entry_type: &EntryType,
        updates: &Map<String, Value>,
    ) -> Result<Option<CanonicalEntry>, StorageError> {
        let pool = self.pool();
        let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

        let select = format!(
            "SELECT {} FROM recorder_entries WHERE batch_id = ? AND entry_type = ? \
             ORDER BY created_at DESC, occurred_at DESC LIMIT 1",
            COLUMNS
        );
        let row = sqlx::query(&select)
            .bind(batch_id.to_string())
            .bind(entry_type.as_str().to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut entry = row_to_entry(&row)?;
        entry.merge_payload(updates);

        sqlx::query("UPDATE recorder_entries SET payload = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&entry.payload)?)
            .bind(entry.updated_at)
            .bind(entry.id.clone())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(Some(entry))
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalEntry>, StorageError> {
        let sql = format!("SELECT {} FROM recorder_entries WHERE id = ?", COLUMNS);
        let mut rows = self.fetch_entries(&sql, &[id.to_string()], &[]).await?;
        Ok(rows.pop())
    }

    async fn query(
        &self,
        filter: &EntryFilter,
        visible_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CanonicalEntry>, StorageError> {
        let (clause, binds) = where_clause(filter, visible_only);
        let sql = format!(
            "SELECT {} FROM recorder_entries{} ORDER BY occurred_at DESC, created_at DESC LIMIT ? OFFSET ?",
            COLUMNS, clause
        );
        self.fetch_entries(&sql, &binds, &[limit as i64, offset as i64]).await
    }

    async fn count(&self, filter: &EntryFilter, visible_only: bool) -> Result<u64, StorageError> {
        let (clause, binds) = where_clause(filter, visible_only);
        let sql = format!("SELECT COUNT(*) as cnt FROM recorder_entries{}", clause);
        let pool = self.pool();

        let row = retry("sql_count", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind);
            }
            query.fetch_one(&pool).await.map_err(map_sqlx_err)
        })
        .await?;

        let count: i64 = row.try_get("cnt").map_err(map_sqlx_err)?;
        Ok(count as u64)
    }

    async fn batch_entries(&self, batch_id: &str) -> Result<Vec<CanonicalEntry>, StorageError> {
        let sql = format!(
            "SELECT {} FROM recorder_entries WHERE batch_id = ? ORDER BY occurred_at ASC, created_at ASC",
            COLUMNS
        );
        self.fetch_entries(&sql, &[batch_id.to_string()], &[]).await
    }

    async fn delete_all(&self) -> Result<u64, StorageError> {
        let pool = self.pool();
        let mut tx = pool.begin().await.map_err(map_sqlx_err)?;
        sqlx::query("DELETE FROM recorder_entry_tags")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        let result = sqlx::query("DELETE FROM recorder_entries")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_batch(&self, cutoff: i64, limit: usize) -> Result<ExpiredBatch, StorageError> {
        let pool = self.pool();
        let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

        let select = format!(
            "SELECT {} FROM recorder_entries WHERE occurred_at < ? ORDER BY occurred_at ASC LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&select)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        let entries: Vec<CanonicalEntry> = rows.iter().map(row_to_entry).collect::<Result<_, _>>()?;

        if entries.is_empty() {
            return Ok(ExpiredBatch::default());
        }

        let mut removed = 0;
        for chunk in entries.chunks(MAX_BIND_PARAMS) {
            let ids = placeholders(chunk.len());
            let delete_tags = format!("DELETE FROM recorder_entry_tags WHERE entry_id IN ({})", ids);
            let mut query = sqlx::query(&delete_tags);
            for entry in chunk {
                query = query.bind(entry.id.clone());
            }
            query.execute(&mut *tx).await.map_err(map_sqlx_err)?;

            let delete_entries = format!("DELETE FROM recorder_entries WHERE id IN ({})", ids);
            let mut query = sqlx::query(&delete_entries);
            for entry in chunk {
                query = query.bind(entry.id.clone());
            }
            removed += query.execute(&mut *tx).await.map_err(map_sqlx_err)?.rows_affected();
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(ExpiredBatch { removed, entries })
    }

    async fn reconnect(&self) -> Result<(), StorageError> {
        let fresh = Self::connect(&self.url, self.is_sqlite).await?;
        let old = std::mem::replace(&mut *self.pool.write(), fresh);
        old.close().await;
        info!("SQL pool reconnected");
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        let pool = self.pool();
        sqlx::query("SELECT 1 FROM recorder_entries LIMIT 1")
            .fetch_optional(&pool)
            .await
            .is_ok()
    }
}
