//! Dependency-tracking scopes for cached computations.
//!
//! A [`CachingFlow`] is the stack of [`CachingContext`]s of one logical
//! execution flow. It can be passed explicitly, or installed as the ambient
//! flow of an async call chain with [`CachingFlow::scope`]; the ambient flow
//! follows the future across `.await` points and worker threads but is not
//! inherited by spawned tasks.
//!
//! Concurrent branches of one computation (`tokio::join!`, `join_all`) must
//! not share a stack: each cached call works on a [`fork`](CachingFlow::fork)
//! of the ambient flow, whose contexts hang off the caller's context.
//!
//! ```ignore
//! let flow = CachingFlow::new();
//! let context = flow.open_cache_context("report:7");
//! context.add_dependency("tenant:42")?;
//! context.propagate_to_parent(backend.features(), &recorder);
//! flow.dispose(&context)?;
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::features::CachingBackendFeatures;

tokio::task_local! {
    static AMBIENT_FLOW: CachingFlow;
}

/// What a context is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingContextKind {
    /// Computing a value for the first time.
    Cache,
    /// Recomputing a value that is already cached.
    Recache,
    /// Dependency tracking is paused.
    Suspended,
    /// The root of every flow; not inside any cached computation.
    Null,
}

/// Records nesting between cached computations when the backend cannot
/// store the child key as a dependency of the parent.
pub trait NestedCacheRecorder: Send + Sync {
    fn record_nested(&self, parent_key: &str, child_key: &str);
}

#[derive(Debug, Default)]
struct ContextState {
    dependencies: HashSet<String>,
    disposed: bool,
}

/// One node of the context stack.
#[derive(Debug)]
pub struct CachingContext {
    key: Option<String>,
    kind: CachingContextKind,
    parent: Option<Arc<CachingContext>>,
    state: Mutex<ContextState>,
}

impl CachingContext {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            key: None,
            kind: CachingContextKind::Null,
            parent: None,
            state: Mutex::default(),
        })
    }

    fn child(key: Option<String>, kind: CachingContextKind, parent: Arc<CachingContext>) -> Arc<Self> {
        Arc::new(Self {
            key,
            kind,
            parent: Some(parent),
            state: Mutex::default(),
        })
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn kind(&self) -> CachingContextKind {
        self.kind
    }

    pub fn parent(&self) -> Option<&Arc<CachingContext>> {
        self.parent.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Snapshot of the accumulated dependencies.
    pub fn dependencies(&self) -> Vec<String> {
        self.state.lock().dependencies.iter().cloned().collect()
    }

    /// Adds a dependency to the computation of this context.
    ///
    /// After the context was disposed the dependency goes to the parent.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidOperation` when called on the root context,
    /// i.e. outside any cached computation.
    pub fn add_dependency(&self, dependency: impl Into<String>) -> CacheResult<()> {
        self.add_dependencies([dependency.into()])
    }

    /// # Errors
    ///
    /// Same as [`add_dependency`](Self::add_dependency).
    pub fn add_dependencies<I, S>(&self, dependencies: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.kind == CachingContextKind::Null {
            return Err(CacheError::invalid_operation(
                "Dependencies can only be added in the context of a cached computation.",
            ));
        }
        self.absorb(dependencies.into_iter().map(Into::into).collect());
        Ok(())
    }

    fn absorb(&self, dependencies: Vec<String>) {
        match self.kind {
            CachingContextKind::Null => {
                debug!(count = dependencies.len(), "dependencies reached the root context");
                return;
            }
            CachingContextKind::Suspended => return,
            CachingContextKind::Cache | CachingContextKind::Recache => {}
        }

        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            if let Some(parent) = &self.parent {
                parent.absorb(dependencies);
            }
            return;
        }
        state.dependencies.extend(dependencies);
    }

    /// Hands this context's dependencies to its parent. When the backend
    /// tracks dependencies the context key itself becomes a dependency of the
    /// parent; otherwise the nesting is reported to `recorder`.
    pub fn propagate_to_parent(&self, features: CachingBackendFeatures, recorder: &dyn NestedCacheRecorder) {
        let Some(parent) = &self.parent else {
            return;
        };
        parent.absorb(self.dependencies());

        let Some(key) = &self.key else {
            return;
        };
        if features.dependencies {
            parent.absorb(vec![key.clone()]);
        } else if let Some(parent_key) = parent.nearest_key() {
            recorder.record_nested(parent_key, key);
        }
    }

    fn nearest_key(&self) -> Option<&str> {
        match self.kind {
            CachingContextKind::Cache | CachingContextKind::Recache => self.key.as_deref(),
            CachingContextKind::Suspended | CachingContextKind::Null => None,
        }
    }
}

/// The context stack of one logical execution flow.
#[derive(Clone, Debug)]
pub struct CachingFlow {
    current: Arc<Mutex<Arc<CachingContext>>>,
}

impl CachingFlow {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(CachingContext::root())),
        }
    }

    /// The ambient flow of the running future, if one was installed.
    pub fn ambient() -> Option<CachingFlow> {
        AMBIENT_FLOW.try_with(Clone::clone).ok()
    }

    /// The ambient flow, or a fresh one when none is installed.
    pub fn ambient_or_new() -> CachingFlow {
        Self::ambient().unwrap_or_default()
    }

    /// Runs `future` with this flow as the ambient flow.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        AMBIENT_FLOW.scope(self, future).await
    }

    /// A new flow starting at this flow's current context.
    ///
    /// Contexts opened on the fork have the current context as parent, but
    /// opening and disposing them leaves this flow untouched.
    pub fn fork(&self) -> CachingFlow {
        Self {
            current: Arc::new(Mutex::new(self.current())),
        }
    }

    pub fn current(&self) -> Arc<CachingContext> {
        self.current.lock().clone()
    }

    pub fn open_cache_context(&self, key: impl Into<String>) -> Arc<CachingContext> {
        self.push(Some(key.into()), CachingContextKind::Cache)
    }

    pub fn open_recache_context(&self, key: impl Into<String>) -> Arc<CachingContext> {
        self.push(Some(key.into()), CachingContextKind::Recache)
    }

    pub fn open_suspended_context(&self) -> Arc<CachingContext> {
        self.push(None, CachingContextKind::Suspended)
    }

    fn push(&self, key: Option<String>, kind: CachingContextKind) -> Arc<CachingContext> {
        let mut current = self.current.lock();
        let context = CachingContext::child(key, kind, current.clone());
        *current = context.clone();
        context
    }

    /// Closes `context` and makes its parent current.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidOperation` if `context` is not the current
    /// context of this flow, or is the root.
    pub fn dispose(&self, context: &Arc<CachingContext>) -> CacheResult<()> {
        let mut current = self.current.lock();
        if !Arc::ptr_eq(&current, context) {
            return Err(CacheError::invalid_operation(
                "Only the current context can be disposed.",
            ));
        }
        let parent = context
            .parent
            .clone()
            .ok_or_else(|| CacheError::invalid_operation("The root caching context cannot be disposed."))?;

        context.state.lock().disposed = true;
        *current = parent;
        Ok(())
    }
}

impl Default for CachingFlow {
    fn default() -> Self {
        Self::new()
    }
}

/// Adds a dependency to the current context of the ambient flow.
///
/// # Errors
///
/// Returns `CacheError::InvalidOperation` outside any cached computation.
pub fn add_dependency(dependency: impl Into<String>) -> CacheResult<()> {
    match CachingFlow::ambient() {
        Some(flow) => flow.current().add_dependency(dependency),
        None => Err(CacheError::invalid_operation(
            "Dependencies can only be added in the context of a cached computation.",
        )),
    }
}
