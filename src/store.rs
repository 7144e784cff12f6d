//! The abstract `Store` (§6): persistence for tasks, webhook audit entries, and
//! opaque domain entities. Out of scope per §1 ("the relational store... treated
//! as an abstract `Store`"); this module defines the seam plus an in-process
//! [`InMemoryStore`] so the engine is runnable and testable without a real
//! database behind it.
//!
//! Grounded in the same `async_trait` + `Send + Sync` seam the rest of this
//! crate uses for its pluggable backends, and in `limiter.rs`'s per-key
//! `DashMap<_, Mutex<_>>` locking discipline for the task table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::task::{DomainEntity, Task, TaskId, TaskState, WebhookAuditEntry};

struct TaskRecord {
    task: Task,
    lease_until: Option<DateTime<Utc>>,
}

/// Persistence operations the engine needs from the `Store` (§6).
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_task(&self, task: Task) -> Result<(), EngineError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, EngineError>;

    /// Compare-and-set the state of `id` from `from` to `to`, stamping a new
    /// lease deadline. Returns `Ok(false)` (not an error) if the current state
    /// doesn't match `from` — the caller (another worker) lost the race.
    async fn cas_task_state(
        &self,
        id: &TaskId,
        from: TaskState,
        to: TaskState,
        lease_until: Option<DateTime<Utc>>,
    ) -> Result<bool, EngineError>;

    async fn extend_lease(&self, id: &TaskId, lease_until: DateTime<Utc>) -> Result<(), EngineError>;

    /// Write a terminal output/error and transition to `state` unconditionally
    /// (the caller already holds the lease).
    async fn set_task_output(
        &self,
        id: &TaskId,
        state: TaskState,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), EngineError>;

    async fn add_child(&self, parent_id: &TaskId, child_id: TaskId) -> Result<(), EngineError>;

    async fn list_tasks_by_requester(&self, requester_id: &str) -> Result<Vec<Task>, EngineError>;

    /// Invariant (iii): an idempotency key is unique across a requester's
    /// non-terminal tasks. `None` if no live task currently holds it.
    async fn find_live_by_idempotency_key(
        &self,
        requester_id: &str,
        key: &str,
    ) -> Result<Option<Task>, EngineError>;

    async fn insert_audit_entry(&self, entry: WebhookAuditEntry) -> Result<(), EngineError>;

    async fn lookup_audit_entry(
        &self,
        endpoint: &str,
        external_id: &str,
    ) -> Result<Option<WebhookAuditEntry>, EngineError>;

    async fn insert_domain_entity(&self, entity: DomainEntity) -> Result<(), EngineError>;
}

/// A process-local `Store` backed by `DashMap`s. Suitable for tests, a single
/// process deployment, or as the default before a real relational store is
/// wired in behind the same trait.
pub struct InMemoryStore {
    tasks: DashMap<TaskId, Mutex<TaskRecord>>,
    audit: DashMap<(String, String), WebhookAuditEntry>,
    domain_entities: Mutex<Vec<DomainEntity>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            tasks: DashMap::new(),
            audit: DashMap::new(),
            domain_entities: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_task(&self, task: Task) -> Result<(), EngineError> {
        let id = task.id.clone();
        self.tasks.insert(
            id,
            Mutex::new(TaskRecord {
                task,
                lease_until: None,
            }),
        );
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, EngineError> {
        match self.tasks.get(id) {
            Some(entry) => Ok(Some(entry.lock().await.task.clone())),
            None => Ok(None),
        }
    }

    async fn cas_task_state(
        &self,
        id: &TaskId,
        from: TaskState,
        to: TaskState,
        lease_until: Option<DateTime<Utc>>,
    ) -> Result<bool, EngineError> {
        let entry = match self.tasks.get(id) {
            Some(e) => e,
            None => return Err(EngineError::NotFound(format!("task {}", id))),
        };
        let mut guard = entry.lock().await;
        if guard.task.state != from {
            return Ok(false);
        }
        guard.task.state = to;
        guard.lease_until = lease_until;
        Ok(true)
    }

    async fn extend_lease(&self, id: &TaskId, lease_until: DateTime<Utc>) -> Result<(), EngineError> {
        let entry = self
            .tasks
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", id)))?;
        entry.lock().await.lease_until = Some(lease_until);
        Ok(())
    }

    async fn set_task_output(
        &self,
        id: &TaskId,
        state: TaskState,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let entry = self
            .tasks
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", id)))?;
        let mut guard = entry.lock().await;
        guard.task.state = state;
        guard.task.output = output;
        guard.task.error = error;
        guard.task.completed_at = Some(Utc::now());
        guard.lease_until = None;
        Ok(())
    }

    async fn add_child(&self, parent_id: &TaskId, child_id: TaskId) -> Result<(), EngineError> {
        let entry = self
            .tasks
            .get(parent_id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", parent_id)))?;
        entry.lock().await.task.child_task_ids.push(child_id);
        Ok(())
    }

    async fn list_tasks_by_requester(&self, requester_id: &str) -> Result<Vec<Task>, EngineError> {
        let mut out = Vec::new();
        for entry in self.tasks.iter() {
            let guard = entry.value().lock().await;
            if guard.task.requester_id == requester_id {
                out.push(guard.task.clone());
            }
        }
        Ok(out)
    }

    async fn find_live_by_idempotency_key(
        &self,
        requester_id: &str,
        key: &str,
    ) -> Result<Option<Task>, EngineError> {
        for entry in self.tasks.iter() {
            let guard = entry.value().lock().await;
            if guard.task.requester_id == requester_id
                && guard.task.idempotency_key.as_deref() == Some(key)
                && !guard.task.state.is_terminal()
            {
                return Ok(Some(guard.task.clone()));
            }
        }
        Ok(None)
    }

    async fn insert_audit_entry(&self, entry: WebhookAuditEntry) -> Result<(), EngineError> {
        self.audit
            .insert((entry.endpoint.clone(), entry.external_id.clone()), entry);
        Ok(())
    }

    async fn lookup_audit_entry(
        &self,
        endpoint: &str,
        external_id: &str,
    ) -> Result<Option<WebhookAuditEntry>, EngineError> {
        Ok(self
            .audit
            .get(&(endpoint.to_string(), external_id.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn insert_domain_entity(&self, entity: DomainEntity) -> Result<(), EngineError> {
        self.domain_entities.lock().await.push(entity);
        Ok(())
    }
}

/// Convenience alias for the shared-ownership form every component actually holds.
pub type SharedStore = Arc<dyn Store>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    fn sample_task(requester: &str, key: Option<&str>) -> Task {
        Task::new_root(
            requester,
            TaskKind::Agent {
                agent_id: "assistant".to_string(),
            },
            serde_json::json!({"prompt": "hi"}),
            key.map(|s| s.to_string()),
            None,
        )
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = InMemoryStore::new();
        let task = sample_task("u1", None);
        let id = task.id.clone();
        store.insert_task(task).await.unwrap();
        let fetched = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(fetched.requester_id, "u1");
    }

    #[tokio::test]
    async fn cas_fails_when_current_state_does_not_match() {
        let store = InMemoryStore::new();
        let task = sample_task("u1", None);
        let id = task.id.clone();
        store.insert_task(task).await.unwrap();

        let won = store
            .cas_task_state(&id, TaskState::Queued, TaskState::Running, None)
            .await
            .unwrap();
        assert!(won);

        let lost = store
            .cas_task_state(&id, TaskState::Queued, TaskState::Running, None)
            .await
            .unwrap();
        assert!(!lost);
    }

    #[tokio::test]
    async fn idempotency_key_is_found_only_while_live() {
        let store = InMemoryStore::new();
        let task = sample_task("u1", Some("key-1"));
        let id = task.id.clone();
        store.insert_task(task).await.unwrap();

        let hit = store.find_live_by_idempotency_key("u1", "key-1").await.unwrap();
        assert!(hit.is_some());

        store
            .set_task_output(&id, TaskState::Completed, Some(serde_json::json!("done")), None)
            .await
            .unwrap();

        let miss = store.find_live_by_idempotency_key("u1", "key-1").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn audit_dedup_lookup_round_trips() {
        let store = InMemoryStore::new();
        store
            .insert_audit_entry(WebhookAuditEntry {
                endpoint: "scrape".to_string(),
                external_id: "abc123".to_string(),
                headers: Default::default(),
                received_at: Utc::now(),
                signature_valid: true,
            })
            .await
            .unwrap();

        assert!(store.lookup_audit_entry("scrape", "abc123").await.unwrap().is_some());
        assert!(store.lookup_audit_entry("scrape", "other").await.unwrap().is_none());
        assert!(store.lookup_audit_entry("mail", "abc123").await.unwrap().is_none());
    }
}
