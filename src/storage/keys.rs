// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key layout for the buffer store.
//!
//! ```text
//! {prefix}buffer:entries        LIST   serialized CanonicalEntry, FIFO
//! {prefix}buffer:updates        LIST   serialized PendingUpdate, FIFO
//! {prefix}entry:<id>            STRING serialized entry, TTL = retention
//! {prefix}entries               ZSET   all ids, score = occurred_at
//! {prefix}visible               ZSET   listing-visible ids
//! {prefix}type:<entry_type>     ZSET
//! {prefix}batch:<batch_id>      ZSET
//! {prefix}family:<family_hash>  ZSET
//! {prefix}tag:<tag>             SET
//! ```

use crate::entry::CanonicalEntry;

pub const DEFAULT_PREFIX: &str = "recorder:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn buffer_entries(&self) -> String {
        format!("{}buffer:entries", self.prefix)
    }

    pub fn buffer_updates(&self) -> String {
        format!("{}buffer:updates", self.prefix)
    }

    pub fn entry(&self, id: &str) -> String {
        format!("{}entry:{}", self.prefix, id)
    }

    pub fn all(&self) -> String {
        format!("{}entries", self.prefix)
    }

    pub fn visible(&self) -> String {
        format!("{}visible", self.prefix)
    }

    pub fn entry_type(&self, entry_type: &str) -> String {
        format!("{}type:{}", self.prefix, entry_type)
    }

    pub fn batch(&self, batch_id: &str) -> String {
        format!("{}batch:{}", self.prefix, batch_id)
    }

    pub fn family(&self, family_hash: &str) -> String {
        format!("{}family:{}", self.prefix, family_hash)
    }

    pub fn tag(&self, tag: &str) -> String {
        format!("{}tag:{}", self.prefix, tag)
    }

    /// Every time-ordered index (sorted set) the entry belongs to.
    pub fn sorted_indexes_for(&self, entry: &CanonicalEntry) -> Vec<String> {
        let mut keys = vec![self.all(), self.entry_type(entry.entry_type.as_str())];
        if entry.visible_in_listing {
            keys.push(self.visible());
        }
        if let Some(ref batch_id) = entry.batch_id {
            keys.push(self.batch(batch_id));
        }
        if let Some(ref family_hash) = entry.family_hash {
            keys.push(self.family(family_hash));
        }
        keys
    }

    /// Tag membership sets the entry belongs to.
    pub fn tag_indexes_for(&self, entry: &CanonicalEntry) -> Vec<String> {
        entry.tags.iter().map(|t| self.tag(t)).collect()
    }
}
