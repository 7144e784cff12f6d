//! Cooperative cancellation (§5, §9 redesign flag).
//!
//! The source material models cancellation via coroutine/await-driven exceptions.
//! Here it is carried by value: every outbound I/O call accepts a [`CancelToken`]
//! and checks it at suspension points. A token is cheap to clone (it wraps a
//! `tokio::sync::watch` receiver) and fans out from a task's submit call down
//! through every delegated child task.

use dashmap::DashMap;
use tokio::sync::watch;

/// The firing half of a cancellation signal. Owned by whoever can cancel a task
/// (`Orchestrator::cancel`, `WorkerPool` on deadline exceeded).
#[derive(Debug, Clone)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// The observing half of a cancellation signal. Cheap to clone; every component
/// that awaits I/O holds one and races it against the I/O future.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Construct a fresh, unfired cancellation pair.
pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}

impl CancelSource {
    /// Fire the signal. Idempotent — firing twice is a no-op the second time.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// True once [`CancelSource::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve as soon as the token is cancelled. Intended for use inside
    /// `tokio::select!` alongside the real I/O future.
    pub async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }

    /// A token that never fires. Useful for call sites outside a cancellable task
    /// (tests, one-off CLI invocations).
    pub fn never() -> Self {
        let (_source, token) = cancel_pair();
        token
    }
}

/// Process-wide table of outstanding tasks' cancel sources, keyed by task id.
///
/// `Orchestrator::cancel` and the worker's own deadline-exceeded path both need
/// to reach a task's [`CancelSource`] without either owning it directly — the
/// source is minted when a task starts running and discarded once it reaches a
/// terminal state, the same lifecycle `limiter.rs`'s per-domain backoff entries
/// follow via the same `DashMap`-per-key pattern.
pub struct CancelRegistry {
    sources: DashMap<String, CancelSource>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        CancelRegistry {
            sources: DashMap::new(),
        }
    }

    /// Mint a fresh cancellation pair for `task_id`, replacing any prior one
    /// (a task is only ever registered once per lease it holds).
    pub fn register(&self, task_id: &str) -> CancelToken {
        let (source, token) = cancel_pair();
        self.sources.insert(task_id.to_string(), source);
        token
    }

    /// Fire the signal for `task_id` if it is currently registered. Returns
    /// `false` if the task is unknown or already terminal.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.sources.get(task_id) {
            Some(source) => {
                source.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the entry for a task once it reaches a terminal state.
    pub fn remove(&self, task_id: &str) {
        self.sources.remove(task_id);
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
