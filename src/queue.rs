//! The abstract `Queue` (§6): job handoff between ingress (C9/C10) and the
//! `WorkerPool` (C11). Out of scope per §1 ("the message queue... treated as
//! an abstract `Queue`"); this module defines the seam plus an in-process
//! [`InMemoryQueue`] built on a `tokio::sync::Notify`-signalled deque, the same
//! "cheap, runtime-native primitive over a dedicated crate" choice the donor
//! makes throughout (e.g. `tokio::sync::RwLock` for the tool registry in
//! `tool_protocol.rs` rather than a lock-free alternative).

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::error::EngineError;
use crate::task::TaskId;

/// What kind of work a queued job represents (C11 step (c) dispatch table).
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Run `AgentRunner` against an already-persisted task.
    AgentTask { task_id: TaskId },
    /// Run `Researcher` against an already-persisted task.
    Research { task_id: TaskId },
    /// Substantive follow-up work for an already-acked webhook delivery
    /// (§4.10: fetch full mail, parse scrape result, create booking/triage tasks).
    WebhookFollowUp {
        endpoint: String,
        external_id: String,
        body: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    /// Number of times this job has previously been attempted (0 on first claim).
    pub attempt: u32,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            attempt: 0,
        }
    }
}

/// Job handoff seam (§6). `claim` long-polls; `ack`/`nack` resolve a prior claim.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), EngineError>;

    /// Wait up to `timeout` for a job to become available. `Ok(None)` on a
    /// clean long-poll timeout (not an error — the worker just loops again).
    async fn claim(&self, timeout: Duration) -> Result<Option<Job>, EngineError>;

    /// Extend the broker-side visibility timeout for an in-flight job. A no-op
    /// on [`InMemoryQueue`], which has no separate broker-side lease to renew —
    /// the task's own `Store` lease (§3 Ownership) is what actually protects
    /// against double-processing in-process.
    async fn extend_lease(&self, job_id: &str, ttl: Duration) -> Result<(), EngineError>;

    async fn ack(&self, job_id: &str) -> Result<(), EngineError>;

    /// Re-enqueue after `delay` (retry ladder, §4.11).
    async fn nack(&self, job: Job, delay: Duration) -> Result<(), EngineError>;
}

struct Inner {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
}

/// A process-local FIFO `Queue`. Delayed re-enqueues (`nack`) are realised with
/// a detached `tokio::spawn` sleep-then-push, mirroring the donor's
/// fire-and-forget `tokio::spawn` usage in `event.rs::emit_sync`.
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        InMemoryQueue {
            inner: Arc::new(Inner {
                jobs: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<(), EngineError> {
        self.inner.jobs.lock().await.push_back(job);
        self.inner.notify.notify_one();
        Ok(())
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<Job>, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.inner.jobs.lock().await.pop_front() {
                return Ok(Some(job));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let notified = self.inner.notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn extend_lease(&self, _job_id: &str, _ttl: Duration) -> Result<(), EngineError> {
        Ok(())
    }

    async fn ack(&self, _job_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn nack(&self, mut job: Job, delay: Duration) -> Result<(), EngineError> {
        job.attempt += 1;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.jobs.lock().await.push_back(job);
            inner.notify.notify_one();
        });
        Ok(())
    }
}

pub type SharedQueue = Arc<dyn Queue>;
