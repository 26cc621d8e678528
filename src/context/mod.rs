//! Execution context store
//!
//! One [`ExecutionContext`] exists per logical unit of work (request, job,
//! worker iteration). It carries the diagnostic state producers attach while
//! the unit runs: user info, tags, named data frames, a bounded breadcrumb
//! trail, the inherited propagation context, and the unit's active trace.
//!
//! # Design
//!
//! - The context is a `Send + Sync` handle with interior locking, so a unit
//!   can hand `&ExecutionContext` to helpers and concurrent sub-operations.
//!   It must still be treated as exclusively owned by its unit: never share
//!   one context between unrelated concurrent units.
//! - Every operation is best-effort and infallible. Telemetry bookkeeping
//!   must never raise into the host application.
//! - Hosts that pool worker threads use [`ContextStore`] for the ambient
//!   per-thread slot and are required to call [`ContextStore::clear`] at
//!   unit boundaries so state never leaks into the next unit.
//!
//! # Example
//!
//! ```
//! use kodama_telemetry::context::{Breadcrumb, BreadcrumbLevel, ExecutionContext, UserInfo};
//!
//! let ctx = ExecutionContext::default();
//! ctx.set_user(UserInfo::with_id("user-42"));
//! ctx.set_tag("request_id", "req-9000");
//! ctx.add_breadcrumb(Breadcrumb::new("cache miss", "cache", BreadcrumbLevel::Debug));
//!
//! let result = ctx.with_context("job", serde_json::json!({"queue": "default"}), || 2 + 2);
//! assert_eq!(result, 4);
//! assert!(ctx.data_frame("job").is_none()); // frame popped on exit
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::propagation::PropagationContext;
use crate::trace::ActiveTrace;

/// Default cap for the breadcrumb ring
pub const DEFAULT_MAX_BREADCRUMBS: usize = 100;

/// Severity of a breadcrumb
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreadcrumbLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

/// A lightweight timestamped diagnostic note
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub category: String,
    pub level: BreadcrumbLevel,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

impl Breadcrumb {
    /// Create a breadcrumb stamped with the current time
    pub fn new(
        message: impl Into<String>,
        category: impl Into<String>,
        level: BreadcrumbLevel,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            category: category.into(),
            level,
            data: HashMap::new(),
        }
    }

    /// Attach a structured data field
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// User identity attached to the current unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl UserInfo {
    /// User identified by id only
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct ContextInner {
    user: Option<UserInfo>,
    tags: HashMap<String, String>,
    extra: HashMap<String, serde_json::Value>,
    breadcrumbs: VecDeque<Breadcrumb>,
    propagation: Option<PropagationContext>,
    active_trace: Option<ActiveTrace>,
}

/// Per-unit diagnostic state
///
/// See the module docs for the ownership rules. All mutators merge with
/// last-write-wins semantics per key and never fail.
#[derive(Debug)]
pub struct ExecutionContext {
    inner: Mutex<ContextInner>,
    max_breadcrumbs: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BREADCRUMBS)
    }
}

impl ExecutionContext {
    /// Create a context with a specific breadcrumb cap
    pub fn new(max_breadcrumbs: usize) -> Self {
        Self {
            inner: Mutex::new(ContextInner::default()),
            max_breadcrumbs,
        }
    }

    /// Replace the user identity
    pub fn set_user(&self, user: UserInfo) {
        self.inner.lock().user = Some(user);
    }

    /// Set one tag, overwriting an existing value under the same key
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().tags.insert(key.into(), value.into());
    }

    /// Merge a tag map, last write wins per key
    pub fn set_tags(&self, tags: HashMap<String, String>) {
        self.inner.lock().tags.extend(tags);
    }

    /// Set a named data frame, overwriting an existing frame of that name
    pub fn set_context(&self, name: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().extra.insert(name.into(), value);
    }

    /// Run `f` with a named data frame pushed onto the context
    ///
    /// The frame is popped (and any shadowed frame of the same name
    /// restored) on every exit path, including unwinding.
    pub fn with_context<T>(
        &self,
        name: &str,
        value: serde_json::Value,
        f: impl FnOnce() -> T,
    ) -> T {
        let previous = self.inner.lock().extra.insert(name.to_string(), value);
        let _restore = FrameGuard {
            context: self,
            name: name.to_string(),
            previous,
        };
        f()
    }

    /// Append a breadcrumb, evicting the oldest once the cap is reached
    pub fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        if self.max_breadcrumbs == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.breadcrumbs.push_back(breadcrumb);
        while inner.breadcrumbs.len() > self.max_breadcrumbs {
            inner.breadcrumbs.pop_front();
        }
    }

    /// Store the propagation context inherited from a caller
    pub fn set_propagation(&self, context: PropagationContext) {
        self.inner.lock().propagation = Some(context);
    }

    /// The unit's current propagation context, if any
    pub fn propagation(&self) -> Option<PropagationContext> {
        self.inner.lock().propagation.clone()
    }

    /// Snapshot of the user identity
    pub fn user(&self) -> Option<UserInfo> {
        self.inner.lock().user.clone()
    }

    /// Snapshot of the tag map
    pub fn tags(&self) -> HashMap<String, String> {
        self.inner.lock().tags.clone()
    }

    /// Snapshot of one named data frame
    pub fn data_frame(&self, name: &str) -> Option<serde_json::Value> {
        self.inner.lock().extra.get(name).cloned()
    }

    /// Snapshot of the breadcrumb trail, oldest first
    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.inner.lock().breadcrumbs.iter().cloned().collect()
    }

    /// Detach all per-unit state
    ///
    /// Pooled-thread hosts call this at unit boundaries so nothing leaks
    /// into the next unit scheduled on the same thread.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = ContextInner::default();
    }

    pub(crate) fn install_trace(&self, active: ActiveTrace) -> bool {
        let mut inner = self.inner.lock();
        if inner.active_trace.is_some() {
            return false;
        }
        inner.active_trace = Some(active);
        true
    }

    pub(crate) fn has_active_trace(&self) -> bool {
        self.inner.lock().active_trace.is_some()
    }

    pub(crate) fn take_active_trace(&self) -> Option<ActiveTrace> {
        self.inner.lock().active_trace.take()
    }

    pub(crate) fn with_active_trace<T>(&self, f: impl FnOnce(&mut ActiveTrace) -> T) -> Option<T> {
        self.inner.lock().active_trace.as_mut().map(f)
    }
}

struct FrameGuard<'a> {
    context: &'a ExecutionContext,
    name: String,
    previous: Option<serde_json::Value>,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.context.inner.lock();
        match self.previous.take() {
            Some(previous) => {
                inner.extra.insert(std::mem::take(&mut self.name), previous);
            }
            None => {
                inner.extra.remove(&self.name);
            }
        }
    }
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Arc<ExecutionContext>>> = const { RefCell::new(None) };
}

/// Ambient per-thread context slot
///
/// Each OS thread gets at most one lazily created [`ExecutionContext`].
/// This is the scoped-storage convenience for hosts that map one logical
/// unit to one thread at a time; explicit `&ExecutionContext` handles work
/// everywhere and do not require the store.
pub struct ContextStore;

impl ContextStore {
    /// The calling thread's context, created on first use
    pub fn current() -> Arc<ExecutionContext> {
        CURRENT_CONTEXT.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| Arc::new(ExecutionContext::default()))
                .clone()
        })
    }

    /// The calling thread's context without creating one
    pub fn active() -> Option<Arc<ExecutionContext>> {
        CURRENT_CONTEXT.with(|slot| slot.borrow().clone())
    }

    /// Detach the calling thread's context
    ///
    /// The next [`ContextStore::current`] call starts from a fresh context.
    /// Required at unit boundaries on pooled threads.
    pub fn clear() {
        CURRENT_CONTEXT.with(|slot| {
            slot.borrow_mut().take();
        });
    }
}
