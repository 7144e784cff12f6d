//! C9 — `Orchestrator`: the public entry point for submitting agent tasks,
//! multi-agent fan-out, and research runs. Never performs LLM calls itself —
//! everything is persisted and enqueued for the `WorkerPool` (C11), so every
//! outbound call is uniformly rate-limited and audited regardless of entry
//! point (§4.9).

use std::sync::Arc;
use std::time::Duration;

use crate::agent_registry::AgentRegistry;
use crate::cancel::CancelRegistry;
use crate::error::EngineError;
use crate::queue::{Job, JobKind, Queue};
use crate::store::Store;
use crate::task::{Task, TaskId, TaskKind};

/// How often the §6 HTTP fast-path re-checks a task's state while waiting for
/// it to go terminal. Short enough that an in-process worker pool completing a
/// simple agent call in a few hundred milliseconds still looks synchronous to
/// the caller; long enough not to hammer the `Store` on a slow call.
const FAST_PATH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Scan `text` for mentions of any agent id in `candidates`, returning the
/// distinct ids found in order of first appearance (§4.9: "a plain substring
/// scan over the closed agent-id set, no NLP dependency justified").
fn extract_mentions(text: &str, candidates: &[&str]) -> Vec<String> {
    let mut hits: Vec<(usize, &str)> = candidates
        .iter()
        .filter_map(|id| text.find(id).map(|pos| (pos, *id)))
        .collect();
    hits.sort_by_key(|(pos, _)| *pos);

    let mut out = Vec::new();
    for (_, id) in hits {
        if !out.iter().any(|seen: &String| seen == id) {
            out.push(id.to_string());
        }
    }
    out
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    registry: Arc<AgentRegistry>,
    cancel_registry: Arc<CancelRegistry>,
    default_research_max_sources: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        registry: Arc<AgentRegistry>,
        cancel_registry: Arc<CancelRegistry>,
        default_research_max_sources: usize,
    ) -> Self {
        Orchestrator {
            store,
            queue,
            registry,
            cancel_registry,
            default_research_max_sources,
        }
    }

    /// §4.9 `submit`. Idempotency-checks against live tasks for this requester
    /// before creating anything new (invariant (iii)): a repeat of the same
    /// key with the same `agent_id`/`inputs` returns the live task unchanged,
    /// but the same key with anything different is a `Conflict` (§7) rather
    /// than silently returning the earlier task's result.
    pub async fn submit(
        &self,
        requester_id: &str,
        agent_id: &str,
        inputs: serde_json::Value,
        idempotency_key: Option<String>,
        conversation_id: Option<String>,
    ) -> Result<Task, EngineError> {
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.store.find_live_by_idempotency_key(requester_id, key).await? {
                let same_agent = matches!(&existing.kind, TaskKind::Agent { agent_id: existing_agent } if existing_agent == agent_id);
                if same_agent && existing.inputs == inputs {
                    return Ok(existing);
                }
                return Err(EngineError::Conflict(format!(
                    "idempotency key {} already used with different agent_id/inputs",
                    key
                )));
            }
        }
        if self.registry.get(agent_id).is_none() {
            return Err(EngineError::UnknownAgent(agent_id.to_string()));
        }

        let task = Task::new_root(
            requester_id,
            TaskKind::Agent {
                agent_id: agent_id.to_string(),
            },
            inputs,
            idempotency_key,
            conversation_id,
        );
        self.store.insert_task(task.clone()).await?;
        self.queue
            .enqueue(Job::new(JobKind::AgentTask { task_id: task.id.clone() }))
            .await?;
        Ok(task)
    }

    /// §4.9 `submit_multi`. Requires at least two distinct agent mentions in
    /// `free_text`; routes to the `multi_agent` pseudo-agent otherwise errors.
    pub async fn submit_multi(
        &self,
        requester_id: &str,
        free_text: &str,
        conversation_id: Option<String>,
    ) -> Result<Task, EngineError> {
        let nameable: Vec<&str> = self.registry.nameable_ids();
        let mentioned = extract_mentions(free_text, &nameable);
        if mentioned.len() < 2 {
            return Err(EngineError::BadRequest(
                "submit_multi requires at least two distinct agent mentions in the prompt".to_string(),
            ));
        }

        let inputs = serde_json::json!({
            "prompt": free_text,
            "mentioned_agents": mentioned,
        });
        let task = Task::new_root(
            requester_id,
            TaskKind::Agent {
                agent_id: "multi_agent".to_string(),
            },
            inputs,
            None,
            conversation_id,
        );
        self.store.insert_task(task.clone()).await?;
        self.queue
            .enqueue(Job::new(JobKind::AgentTask { task_id: task.id.clone() }))
            .await?;
        Ok(task)
    }

    /// §4.9 `research`. Same lifecycle as a normal task but dispatched to C7.
    pub async fn research(
        &self,
        requester_id: &str,
        query: &str,
        max_sources: Option<usize>,
        preferred_agent: Option<String>,
    ) -> Result<Task, EngineError> {
        let max_sources = max_sources.unwrap_or(self.default_research_max_sources);
        let inputs = serde_json::json!({ "query": query });
        let task = Task::new_root(
            requester_id,
            TaskKind::Research {
                max_sources,
                preferred_agent,
            },
            inputs,
            None,
            None,
        );
        self.store.insert_task(task.clone()).await?;
        self.queue
            .enqueue(Job::new(JobKind::Research { task_id: task.id.clone() }))
            .await?;
        Ok(task)
    }

    /// §2 C9 "synchronous fast-path": poll `task_id` until it reaches a
    /// terminal state or `deadline` elapses, whichever comes first. Returns
    /// whatever state the task is actually in when it returns — the caller
    /// (the HTTP layer) decides between a 200-with-output and a 202-queued
    /// response based on `task.state.is_terminal()`.
    pub async fn await_terminal(&self, task_id: &TaskId, deadline: Duration) -> Result<Task, EngineError> {
        let start = tokio::time::Instant::now();
        loop {
            let task = self.get(task_id).await?;
            if task.state.is_terminal() || start.elapsed() >= deadline {
                return Ok(task);
            }
            tokio::time::sleep(FAST_PATH_POLL_INTERVAL).await;
        }
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))
    }

    /// Fire the cancellation signal for a task, if it is currently registered
    /// (i.e. a worker is holding its lease). Cancelling an already-terminal or
    /// unknown task is not an error — it's a no-op.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<(), EngineError> {
        self.cancel_registry.cancel(&task_id.0);
        Ok(())
    }

    pub async fn list_for_requester(&self, requester_id: &str) -> Result<Vec<Task>, EngineError> {
        self.store.list_tasks_by_requester(requester_id).await
    }
}
