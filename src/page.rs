// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pagination for the read API.
//!
//! Pages are 1-indexed. A page number of 0 is treated as page 1 and a page
//! size of 0 as 1, so callers passing raw query-string values never divide
//! by zero or underflow.
//!
//! ```
//! use scope_recorder::page::total_pages;
//!
//! assert_eq!(total_pages(30, 25), 2);
//! assert_eq!(total_pages(0, 25), 0);
//! ```

use serde::Serialize;

use crate::entry::CanonicalEntry;
use crate::storage::traits::{EntryFilter, StorageBackend, StorageError};

pub const DEFAULT_PER_PAGE: usize = 25;

/// `ceil(total / per_page)`.
pub fn total_pages(total: u64, per_page: usize) -> u64 {
    let per_page = per_page.max(1) as u64;
    total.div_ceil(per_page)
}

/// Row offset of a 1-indexed page.
pub fn offset(page: usize, per_page: usize) -> usize {
    page.max(1).saturating_sub(1).saturating_mul(per_page.max(1))
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: usize, per_page: usize, total: u64) -> Self {
        let per_page = per_page.max(1);
        Self {
            items,
            page: page.max(1),
            per_page,
            total,
            total_pages: total_pages(total, per_page),
        }
    }

    pub fn has_next(&self) -> bool {
        (self.page as u64) < self.total_pages
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }
}

/// One page of a filtered listing plus its totals.
pub async fn list_page(
    backend: &dyn StorageBackend,
    filter: &EntryFilter,
    page: usize,
    per_page: usize,
    visible_only: bool,
) -> Result<Page<CanonicalEntry>, StorageError> {
    let total = backend.count(filter, visible_only).await?;
    let items = backend.list(filter, page, per_page, visible_only).await?;
    Ok(Page::new(items, page, per_page, total))
}

/// One page of a family's recurrences plus its totals.
pub async fn family_page(
    backend: &dyn StorageBackend,
    family_hash: &str,
    page: usize,
    per_page: usize,
) -> Result<Page<CanonicalEntry>, StorageError> {
    let total = backend.family_count(family_hash).await?;
    let items = backend.entries_for_family(family_hash, page, per_page).await?;
    Ok(Page::new(items, page, per_page, total))
}
