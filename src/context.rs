// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Correlation context for one execution unit (request, job, command).
//!
//! Every entry written while a unit runs inherits the unit's batch id, tags
//! and attributes. Contexts are unit-local and never shared between
//! concurrent units:
//!
//! - [`scope`] installs a fresh context in tokio task-local storage for the
//!   lifetime of a future. It is released when the future completes, fails,
//!   panics or is dropped mid-flight.
//! - [`sync_scope`] does the same for a synchronous closure using a
//!   thread-local slot and a drop guard.
//! - Outside any scope there is no unit to attach state to. Each call then
//!   sees a throwaway context, so nothing leaks between tasks that happen to
//!   share a worker thread. State set there is discarded immediately.
//!
//! ```
//! use scope_recorder::context::{self, CorrelationContext};
//!
//! let batch = context::sync_scope(|| {
//!     context::add_tag("checkout");
//!     let first = context::batch_id();
//!     assert_eq!(first, context::batch_id());
//!     assert_eq!(CorrelationContext::current().tags(), ["checkout"]);
//!     first
//! });
//! assert!(!batch.is_empty());
//! assert!(CorrelationContext::current().peek_batch_id().is_none());
//! ```

use std::cell::RefCell;
use std::future::Future;

use serde_json::{Map, Value};

tokio::task_local! {
    static TASK_CONTEXT: RefCell<CorrelationContext>;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<CorrelationContext>> = const { RefCell::new(None) };
}

/// State carried by one execution unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationContext {
    batch_id: Option<String>,
    tags: Vec<String>,
    request_id: Option<String>,
    user_id: Option<String>,
    attributes: Map<String, Value>,
}

impl CorrelationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose batch id is already known (e.g. an incoming request id).
    pub fn with_batch_id(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            ..Self::default()
        }
    }

    /// Snapshot of the calling unit's context.
    pub fn current() -> Self {
        with_current(|ctx| ctx.clone())
    }

    /// The unit's batch id, generated and memoized on first call.
    pub fn batch_id(&mut self) -> String {
        self.batch_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    /// The batch id if one was generated or preset, without generating one.
    pub fn peek_batch_id(&self) -> Option<&str> {
        self.batch_id.as_deref()
    }

    pub fn set_batch_id(&mut self, batch_id: impl Into<String>) {
        self.batch_id = Some(batch_id.into());
    }

    /// Idempotent: a tag already present is not added twice.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !tag.is_empty() && !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.add_tag(tag);
        }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn set_request_id(&mut self, request_id: impl Into<String>) {
        self.request_id = Some(request_id.into());
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Fields merged into every entry payload written by this unit.
    ///
    /// Free-form attributes first, then `request_id` and `user_id` when set.
    pub fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = self.attributes.clone();
        if let Some(ref request_id) = self.request_id {
            fields.insert("request_id".into(), Value::String(request_id.clone()));
        }
        if let Some(ref user_id) = self.user_id {
            fields.insert("user_id".into(), Value::String(user_id.clone()));
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Drop all state. The next `batch_id()` starts a new batch.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// True inside [`scope`] or [`sync_scope`].
pub fn in_scope() -> bool {
    TASK_CONTEXT.try_with(|_| ()).is_ok() || THREAD_CONTEXT.with(|cell| cell.borrow().is_some())
}

/// Run `f` against the calling unit's context.
///
/// Resolves the task-local context when inside [`scope`], then the one
/// installed by [`sync_scope`]. Outside both, `f` gets a fresh context that
/// is dropped afterwards. `f` must not call back into this module.
pub fn with_current<R>(f: impl FnOnce(&mut CorrelationContext) -> R) -> R {
    if TASK_CONTEXT.try_with(|_| ()).is_ok() {
        return TASK_CONTEXT.with(|cell| f(&mut cell.borrow_mut()));
    }
    THREAD_CONTEXT.with(|cell| match cell.borrow_mut().as_mut() {
        Some(ctx) => f(ctx),
        None => f(&mut CorrelationContext::new()),
    })
}

/// Batch id of the calling unit.
pub fn batch_id() -> String {
    with_current(CorrelationContext::batch_id)
}

pub fn add_tag(tag: impl Into<String>) {
    let tag = tag.into();
    with_current(|ctx| ctx.add_tag(tag));
}

/// Clear the calling unit's context.
pub fn clear() {
    with_current(CorrelationContext::clear);
}

/// Run `fut` as its own execution unit with a fresh context.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    scope_with(CorrelationContext::new(), fut).await
}

/// Run `fut` as its own execution unit starting from `ctx`.
pub async fn scope_with<F: Future>(ctx: CorrelationContext, fut: F) -> F::Output {
    TASK_CONTEXT.scope(RefCell::new(ctx), fut).await
}

/// Restores the previous thread-local context on drop, including unwinds.
struct ThreadScopeGuard {
    previous: Option<CorrelationContext>,
}

impl Drop for ThreadScopeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_CONTEXT.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Run `f` as its own execution unit on the current thread.
pub fn sync_scope<R>(f: impl FnOnce() -> R) -> R {
    let previous = THREAD_CONTEXT.with(|cell| cell.borrow_mut().replace(CorrelationContext::new()));
    let _guard = ThreadScopeGuard { previous };
    f()
}
