// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical entry data model.
//!
//! [`CanonicalEntry`] is the unit of record shared by every storage backend.
//! Event sources hand in a [`NewEntry`] (the raw entry attributes); the
//! backend validates it, stamps an id and bookkeeping timestamps, and
//! persists the result.
//!
//! # Example
//!
//! ```
//! use scope_recorder::{CanonicalEntry, EntryType, NewEntry};
//! use serde_json::json;
//!
//! let attrs = NewEntry::new(EntryType::Query)
//!     .with_batch_id("b-1")
//!     .with_payload(json!({"sql": "SELECT 1"}))
//!     .with_tags(["query", "select", "query"]);
//!
//! let entry = CanonicalEntry::from_new(attrs).unwrap();
//! assert_eq!(entry.entry_type, EntryType::Query);
//! assert_eq!(entry.tags, vec!["query", "select"]);
//! assert!(entry.visible_in_listing);
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::traits::StorageError;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Discriminates the payload shape of an entry.
///
/// Serialized as its lower-case wire name (`"job_perform"`, ...). Names the
/// recorder does not know are carried through as [`EntryType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntryType {
    Request,
    Query,
    Exception,
    JobEnqueue,
    JobPerform,
    Command,
    Model,
    View,
    Other(String),
}

impl EntryType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Request => "request",
            Self::Query => "query",
            Self::Exception => "exception",
            Self::JobEnqueue => "job_enqueue",
            Self::JobPerform => "job_perform",
            Self::Command => "command",
            Self::Model => "model",
            Self::View => "view",
            Self::Other(name) => name,
        }
    }

    /// Parse a wire name. Blank names are rejected.
    pub fn parse(name: &str) -> Result<Self, StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::Malformed("entry_type must not be blank".into()));
        }
        Ok(match name {
            "request" => Self::Request,
            "query" => Self::Query,
            "exception" => Self::Exception,
            "job_enqueue" => Self::JobEnqueue,
            "job_perform" => Self::JobPerform,
            "command" => Self::Command,
            "model" => Self::Model,
            "view" => Self::View,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EntryType> for String {
    fn from(value: EntryType) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for EntryType {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for EntryType {
    type Error = StorageError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

fn default_visible() -> bool {
    true
}

/// Raw entry attributes supplied by an event source.
///
/// Everything is optional at this stage so that malformed input can be
/// rejected with a clear error instead of failing to deserialize. A write
/// requires a non-blank `entry_type` and an `occurred_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntry {
    /// Preassigned id; generated when absent or blank.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub family_hash: Option<String>,
    #[serde(default)]
    pub entry_type: String,
    /// Already-redacted, type-specific fields.
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_visible")]
    pub visible_in_listing: bool,
    /// Logical event time (epoch millis).
    #[serde(default)]
    pub occurred_at: Option<i64>,
}

impl Default for NewEntry {
    fn default() -> Self {
        Self {
            id: None,
            batch_id: None,
            family_hash: None,
            entry_type: String::new(),
            payload: Map::new(),
            tags: Vec::new(),
            visible_in_listing: true,
            occurred_at: None,
        }
    }
}

impl NewEntry {
    /// Attributes for an event of `entry_type` that occurred now.
    pub fn new(entry_type: EntryType) -> Self {
        Self {
            entry_type: entry_type.into(),
            occurred_at: Some(now_millis()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    #[must_use]
    pub fn with_family_hash(mut self, family_hash: Option<String>) -> Self {
        self.family_hash = family_hash;
        self
    }

    /// Replace the payload. Non-object values are wrapped as `{"value": v}`.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_visibility(mut self, visible_in_listing: bool) -> Self {
        self.visible_in_listing = visible_in_listing;
        self
    }

    #[must_use]
    pub fn occurred_at(mut self, millis: i64) -> Self {
        self.occurred_at = Some(millis);
        self
    }
}

/// A recorded event as persisted by the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    /// Public identifier (UUID v4 unless preassigned). Immutable.
    pub id: String,
    /// Groups all entries of one request/job/command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Groups recurrences of the same kind of event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_hash: Option<String>,
    pub entry_type: EntryType,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_visible")]
    pub visible_in_listing: bool,
    /// Epoch millis.
    pub occurred_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CanonicalEntry {
    /// Validate raw attributes and build the entry that will be stored.
    ///
    /// Rejects a blank `entry_type` or a missing `occurred_at` with
    /// [`StorageError::Malformed`]; nothing is persisted in that case.
    pub fn from_new(attrs: NewEntry) -> Result<Self, StorageError> {
        let entry_type = EntryType::parse(&attrs.entry_type)?;
        let occurred_at = attrs
            .occurred_at
            .ok_or_else(|| StorageError::Malformed("occurred_at is required".into()))?;

        let id = attrs
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let now = now_millis();
        Ok(Self {
            id,
            batch_id: attrs.batch_id.filter(|b| !b.is_empty()),
            family_hash: attrs.family_hash.filter(|f| !f.is_empty()),
            entry_type,
            payload: attrs.payload,
            tags: normalize_tags(attrs.tags),
            visible_in_listing: attrs.visible_in_listing,
            occurred_at,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Merge top-level payload keys from a later phase of the same operation.
    ///
    /// Only `payload` and `updated_at` change; identity and grouping fields
    /// are left untouched.
    pub fn merge_payload(&mut self, updates: &Map<String, Value>) {
        for (key, value) in updates {
            self.payload.insert(key.clone(), value.clone());
        }
        self.updated_at = now_millis().max(self.updated_at);
    }
}

/// De-duplicate tags, keeping first-seen order and dropping blanks.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.into();
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// A deferred payload merge queued by the buffered backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub batch_id: String,
    pub entry_type: EntryType,
    pub payload_updates: Map<String, Value>,
}
