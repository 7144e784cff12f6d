//! C11 — `WorkerPool`: a fixed-size pool pulling jobs off the `Queue` and
//! dispatching them to `AgentRunner` (C8), `Researcher` (C7), or a
//! webhook-specific follow-up handler, with lease heartbeating and the
//! engine's one retry ladder (§4.11).
//!
//! Each worker is a detached `tokio::spawn`ed loop, mirroring the donor's
//! fire-and-forget `tokio::spawn` usage for event emission in `event.rs`'s
//! `emit_sync`. The lease heartbeat races a periodic `Store::extend_lease`
//! against a stop signal via `tokio::select!`, the same "do work, watch a
//! cancellation channel concurrently" idiom C7/C8 use for their own cancel
//! checks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::agent_runner::AgentRunner;
use crate::cancel::CancelRegistry;
use crate::error::EngineError;
use crate::queue::{Job, JobKind, Queue};
use crate::researcher::Researcher;
use crate::store::Store;
use crate::task::{DomainEntity, Task, TaskId, TaskKind, TaskState};

/// Retry ladder for transient job failures (§4.11): three additional
/// attempts, waiting this long before each re-enqueue.
const RETRY_DELAYS: [Duration; 3] = [Duration::from_secs(2), Duration::from_secs(8), Duration::from_secs(20)];
const MAX_ADDITIONAL_ATTEMPTS: u32 = 3;

const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    store: Arc<dyn Store>,
    agent_runner: Arc<AgentRunner>,
    researcher: Arc<Researcher>,
    cancel_registry: Arc<CancelRegistry>,
    worker_count: usize,
    claim_timeout: Duration,
    lease_ttl: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn Queue>,
        store: Arc<dyn Store>,
        agent_runner: Arc<AgentRunner>,
        researcher: Arc<Researcher>,
        cancel_registry: Arc<CancelRegistry>,
    ) -> Self {
        WorkerPool {
            queue,
            store,
            agent_runner,
            researcher,
            cancel_registry,
            worker_count: DEFAULT_WORKER_COUNT,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    /// Start `worker_count` detached long-poll loops. Returns their join
    /// handles so a caller doing graceful shutdown can await them after
    /// signalling cancellation to outstanding tasks (§4.12).
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.worker_count)
            .map(|_| {
                let pool = self.clone();
                tokio::spawn(async move { pool.run_loop().await })
            })
            .collect()
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            match self.queue.claim(self.claim_timeout).await {
                Ok(Some(job)) => self.process_one(job).await,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("queue claim failed: {}", err);
                    continue;
                }
            }
        }
    }

    /// Dispatch one job to its handler (§4.11 step (c)). Exposed (not just
    /// called from `run_loop`) so it can be driven directly and
    /// deterministically in tests.
    pub async fn process_one(&self, job: Job) {
        match job.kind.clone() {
            JobKind::AgentTask { task_id } => self.handle_agent_task(job, task_id).await,
            JobKind::Research { task_id } => self.handle_research_task(job, task_id).await,
            JobKind::WebhookFollowUp { endpoint, external_id, body } => {
                self.handle_webhook_followup(job, endpoint, external_id, body).await
            }
        }
    }

    async fn claim_task(&self, task_id: &TaskId) -> Option<Task> {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(t)) => t,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("failed to load task {}: {}", task_id, err);
                return None;
            }
        };
        if task.state.is_terminal() {
            return None;
        }
        let lease_until = Utc::now() + chrono::Duration::from_std(self.lease_ttl).unwrap_or_default();
        match self
            .store
            .cas_task_state(task_id, TaskState::Queued, TaskState::Running, Some(lease_until))
            .await
        {
            Ok(true) => Some(task),
            Ok(false) => None,
            Err(err) => {
                log::warn!("cas to Running failed for task {}: {}", task_id, err);
                None
            }
        }
    }

    fn spawn_heartbeat(&self, task_id: TaskId, mut stop_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.lease_ttl / 2;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let lease_until = Utc::now() + chrono::Duration::from_std(interval * 2).unwrap_or_default();
                        let _ = store.extend_lease(&task_id, lease_until).await;
                    }
                    _ = &mut stop_rx => break,
                }
            }
        })
    }

    async fn handle_agent_task(&self, job: Job, task_id: TaskId) {
        let task = match self.claim_task(&task_id).await {
            Some(t) => t,
            None => return,
        };

        let cancel = self.cancel_registry.register(&task_id.0);
        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = self.spawn_heartbeat(task_id.clone(), stop_rx);

        let result = self.agent_runner.run(&task, cancel).await;

        let _ = stop_tx.send(());
        let _ = heartbeat.await;
        self.cancel_registry.remove(&task_id.0);

        let mapped = result.map(|outcome| {
            serde_json::json!({
                "text": outcome.text,
                "delegations": outcome.delegations.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                "warning": outcome.warning,
                "used_model": outcome.model_id,
            })
        });
        self.finish_task(job, task_id, mapped).await;
    }

    async fn handle_research_task(&self, job: Job, task_id: TaskId) {
        let task = match self.claim_task(&task_id).await {
            Some(t) => t,
            None => return,
        };

        let (max_sources, preferred_agent) = match &task.kind {
            TaskKind::Research { max_sources, preferred_agent } => (*max_sources, preferred_agent.clone()),
            other => {
                self.finish_task(
                    job,
                    task_id,
                    Err(EngineError::Internal(format!("research job against non-research task: {:?}", other))),
                )
                .await;
                return;
            }
        };
        // preferred_agent is accepted and persisted on the task but does not yet
        // re-frame Researcher::synthesise's system prompt in that agent's voice;
        // doing so would mean threading a system-prompt override through C7.
        let _ = preferred_agent;

        let query = task
            .inputs
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let cancel = self.cancel_registry.register(&task_id.0);
        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = self.spawn_heartbeat(task_id.clone(), stop_rx);

        let result = self.researcher.research(&task.requester_id, &query, max_sources, cancel).await;

        let _ = stop_tx.send(());
        let _ = heartbeat.await;
        self.cancel_registry.remove(&task_id.0);

        let mapped = result.map(|r| {
            serde_json::json!({
                "answer": r.answer,
                "sources": r.sources.iter().map(|s| serde_json::json!({
                    "index": s.index,
                    "url": s.url,
                    "title": s.title,
                    "summary": s.summary,
                })).collect::<Vec<_>>(),
                "pages_synthesised": r.sources.len(),
            })
        });
        self.finish_task(job, task_id, mapped).await;
    }

    /// Common success/retry/fail handling for task-backed jobs (§4.11 steps d/e).
    async fn finish_task(&self, job: Job, task_id: TaskId, result: Result<serde_json::Value, EngineError>) {
        match result {
            Ok(output) => {
                let _ = self.store.set_task_output(&task_id, TaskState::Completed, Some(output), None).await;
                let _ = self.queue.ack(&job.id).await;
            }
            Err(EngineError::Cancelled) => {
                let _ = self
                    .store
                    .set_task_output(&task_id, TaskState::Cancelled, None, Some("cancelled".to_string()))
                    .await;
                let _ = self.queue.ack(&job.id).await;
            }
            Err(err) if err.is_transient() && job.attempt < MAX_ADDITIONAL_ATTEMPTS => {
                let _ = self.store.cas_task_state(&task_id, TaskState::Running, TaskState::Queued, None).await;
                let delay = RETRY_DELAYS[job.attempt as usize];
                let _ = self.queue.nack(job, delay).await;
            }
            Err(err) => {
                let _ = self.store.set_task_output(&task_id, TaskState::Failed, None, Some(err.to_string())).await;
                let _ = self.queue.ack(&job.id).await;
            }
        }
    }

    async fn handle_webhook_followup(&self, job: Job, endpoint: String, external_id: String, body: serde_json::Value) {
        let result = self.process_webhook_followup(&endpoint, &external_id, &body).await;
        match result {
            Ok(()) => {
                let _ = self.queue.ack(&job.id).await;
            }
            Err(err) if err.is_transient() && job.attempt < MAX_ADDITIONAL_ATTEMPTS => {
                let delay = RETRY_DELAYS[job.attempt as usize];
                let _ = self.queue.nack(job, delay).await;
            }
            Err(err) => {
                log::warn!("webhook follow-up {}/{} failed permanently: {}", endpoint, external_id, err);
                let _ = self.queue.ack(&job.id).await;
            }
        }
    }

    /// Endpoint-specific substantive work for an already-acked webhook
    /// delivery (§4.10): fetch full mail, parse a scrape result, create a
    /// booking's calendar record plus a call-prep follow-up, or open an alert
    /// plus an engineering triage task.
    async fn process_webhook_followup(
        &self,
        endpoint: &str,
        external_id: &str,
        body: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let requester_id = format!("webhook:{}", endpoint);
        match endpoint {
            "mail" => {
                self.store
                    .insert_domain_entity(DomainEntity::new("mail", &requester_id, body.clone()))
                    .await
            }
            "scrape" => {
                self.store
                    .insert_domain_entity(DomainEntity::new("scrape", &requester_id, body.clone()))
                    .await
            }
            "booking" => {
                self.store
                    .insert_domain_entity(DomainEntity::new("calendar_event", &requester_id, body.clone()))
                    .await?;
                self.spawn_agent_task(
                    &requester_id,
                    "call_prep",
                    serde_json::json!({
                        "prompt": format!("Prepare a call brief for booking {}", external_id),
                        "booking": body,
                    }),
                )
                .await
            }
            "alert" => {
                self.store
                    .insert_domain_entity(DomainEntity::new("alert", &requester_id, body.clone()))
                    .await?;
                self.spawn_agent_task(
                    &requester_id,
                    "engineer",
                    serde_json::json!({
                        "prompt": format!("Triage monitoring alert {}", external_id),
                        "alert": body,
                    }),
                )
                .await
            }
            other => Err(EngineError::Internal(format!("unknown webhook endpoint: {}", other))),
        }
    }

    async fn spawn_agent_task(&self, requester_id: &str, agent_id: &str, inputs: serde_json::Value) -> Result<(), EngineError> {
        let task = Task::new_root(
            requester_id,
            TaskKind::Agent { agent_id: agent_id.to_string() },
            inputs,
            None,
            None,
        );
        let task_id = task.id.clone();
        self.store.insert_task(task).await?;
        self.queue.enqueue(Job::new(JobKind::AgentTask { task_id })).await
    }
}
