//! Fire-and-forget background work with drain support.
//!
//! Tasks run on the tokio runtime, never on the caller's stack. Failures and
//! panics are caught, logged and counted. [`BackgroundTaskScheduler::when_queue_empty`]
//! waits for every tracked task; after [`BackgroundTaskScheduler::dispose`] new
//! tasks are rejected so the drain cannot be starved.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::error::CacheResult;

struct SchedulerState {
    name: String,
    pending: AtomicUsize,
    exceptions: AtomicUsize,
    stopped: AtomicBool,
    idle: Notify,
}

impl SchedulerState {
    fn task_finished(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Runs background tasks and tracks how many are outstanding.
#[derive(Clone)]
pub struct BackgroundTaskScheduler {
    state: Arc<SchedulerState>,
}

impl BackgroundTaskScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(SchedulerState {
                name: name.into(),
                pending: AtomicUsize::new(0),
                exceptions: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Schedules `task` on the current tokio runtime.
    ///
    /// Returns `false` when the task was rejected, either because the
    /// scheduler is stopped or because no runtime is available.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: Future<Output = CacheResult<()>> + Send + 'static,
    {
        // Count first so a concurrent drain cannot miss this task.
        self.state.pending.fetch_add(1, Ordering::AcqRel);

        if self.state.stopped.load(Ordering::Acquire) {
            debug!(scheduler = %self.state.name, "background task rejected after stop");
            self.state.task_finished();
            return false;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.state.exceptions.fetch_add(1, Ordering::Relaxed);
                error!(scheduler = %self.state.name, error = %e, "no runtime for background task");
                self.state.task_finished();
                return false;
            }
        };

        let state = self.state.clone();
        handle.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    state.exceptions.fetch_add(1, Ordering::Relaxed);
                    error!(scheduler = %state.name, error = %e, "background task failed");
                }
                Err(_) => {
                    state.exceptions.fetch_add(1, Ordering::Relaxed);
                    error!(scheduler = %state.name, "background task panicked");
                }
            }
            state.task_finished();
        });
        true
    }

    /// Waits until no tracked task is outstanding.
    pub async fn when_queue_empty(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting tasks and drains the outstanding ones. Idempotent.
    pub async fn dispose(&self) {
        self.state.stopped.store(true, Ordering::Release);
        self.when_queue_empty().await;
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Number of tasks that failed or panicked.
    pub fn exception_count(&self) -> usize {
        self.state.exceptions.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BackgroundTaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTaskScheduler")
            .field("name", &self.state.name)
            .field("pending", &self.pending_count())
            .field("exceptions", &self.exception_count())
            .finish()
    }
}
