// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends and the stores they are built from.
//!
//! - [`direct`] and [`buffered`] implement [`traits::StorageBackend`].
//! - [`sql`] and [`memory`] provide durable stores.
//! - [`redis`] and [`memory`] provide buffer queues and secondary indexes.

pub mod traits;
pub mod keys;
pub mod memory;
pub mod sql;
pub mod redis;
pub mod direct;
pub mod buffered;
