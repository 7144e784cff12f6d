//! Core data model (§3): `Task`, `ConversationMessage`, and the opaque
//! domain-entity sum type used by webhook handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for a task. Newtype over `String` (the donor crate favours
/// plain owned strings for ids throughout its tool and resource metadata types)
/// so task ids can't be confused with conversation ids at the type level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state machine (§3).
///
/// `Queued -> Running -> (AwaitingChild -> Running)* -> Completed | Failed | Cancelled`.
/// A task in a terminal state (`Completed`, `Failed`, `Cancelled`) is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    AwaitingChild,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Invariant (i): terminal states carry exactly one of output/error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Either an agent task or a research task; tells the worker which handler to
/// dispatch to (C11 step (c)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskKind {
    /// Run through `AgentRunner` against the named agent id.
    Agent { agent_id: String },
    /// Run through `Researcher`.
    Research {
        max_sources: usize,
        preferred_agent: Option<String>,
    },
    /// Substantive work for a previously-acked webhook (C10 endpoint handlers).
    WebhookFollowUp { endpoint: String },
}

/// A unit of work tracked end-to-end by the engine (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub requester_id: String,
    pub kind: TaskKind,
    /// Arbitrary structured payload the handler interprets (prompt, research query, ...).
    pub inputs: serde_json::Value,
    pub state: TaskState,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_task_id: Option<TaskId>,
    /// Ids of child tasks spawned by delegation (C8 step 7). Never a raw reference —
    /// per §9's redesign flag, parentage is id-based, resolved through the `Store`.
    pub child_task_ids: Vec<TaskId>,
    pub idempotency_key: Option<String>,
    /// Depth in the delegation call tree; 0 for a root task submitted by `Orchestrator`.
    pub depth: u32,
    /// Agent ids already on this task's call stack (root to self), used for cycle
    /// detection (C8 step 6) without walking the `Store` on every delegation.
    pub call_stack: Vec<String>,
    pub conversation_id: Option<String>,
}

impl Task {
    /// Construct a fresh root task in `Queued` state.
    pub fn new_root(
        requester_id: impl Into<String>,
        kind: TaskKind,
        inputs: serde_json::Value,
        idempotency_key: Option<String>,
        conversation_id: Option<String>,
    ) -> Self {
        // Seed the call stack with the root agent itself so a later A->B->A
        // delegation is caught at the second hop, not missed because the
        // root's own id was never recorded.
        let call_stack = match &kind {
            TaskKind::Agent { agent_id } => vec![agent_id.clone()],
            TaskKind::Research { .. } | TaskKind::WebhookFollowUp { .. } => Vec::new(),
        };
        Task {
            id: TaskId::new(),
            requester_id: requester_id.into(),
            kind,
            inputs,
            state: TaskState::Queued,
            output: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            parent_task_id: None,
            child_task_ids: Vec::new(),
            idempotency_key,
            depth: 0,
            call_stack,
            conversation_id,
        }
    }

    /// Construct a child task for a delegation (C8 step 7).
    pub fn new_child(
        parent: &Task,
        callee_agent_id: &str,
        inputs: serde_json::Value,
    ) -> Self {
        let mut call_stack = parent.call_stack.clone();
        call_stack.push(callee_agent_id.to_string());
        Task {
            id: TaskId::new(),
            requester_id: parent.requester_id.clone(),
            kind: TaskKind::Agent {
                agent_id: callee_agent_id.to_string(),
            },
            inputs,
            state: TaskState::Queued,
            output: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            parent_task_id: Some(parent.id.clone()),
            child_task_ids: Vec::new(),
            idempotency_key: None,
            depth: parent.depth + 1,
            call_stack,
            conversation_id: parent.conversation_id.clone(),
        }
    }

    pub fn mark_completed(&mut self, output: serde_json::Value) {
        self.state = TaskState::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = TaskState::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.state = TaskState::Cancelled;
        self.error = Some("cancelled".to_string());
        self.completed_at = Some(Utc::now());
    }
}

/// Role of a `ConversationMessage` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
}

/// An append-only conversation log entry (§3, C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub conversation_id: String,
    /// Monotonic per-conversation sequence number, assigned by `MemoryLog::append`.
    pub seq: u64,
    pub role: ConversationRole,
    /// Agent id of the speaker; `None` for user/system messages.
    pub speaker: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Opaque domain-side-effect record (Lead / Insight / CampaignRecord / CalendarEvent /
/// Alert / Document / Scrape / WebhookAuditEntry, §3). The engine never interprets
/// `payload`; it only persists it as a side effect of an agent or webhook handler
/// finishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntity {
    pub kind: String,
    pub requester_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DomainEntity {
    pub fn new(kind: impl Into<String>, requester_id: impl Into<String>, payload: serde_json::Value) -> Self {
        DomainEntity {
            kind: kind.into(),
            requester_id: requester_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// An audit record for an accepted webhook delivery (§4.10 step 4), keyed for
/// dedup by `(endpoint, external_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAuditEntry {
    pub endpoint: String,
    pub external_id: String,
    pub headers: std::collections::HashMap<String, String>,
    pub received_at: DateTime<Utc>,
    pub signature_valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_task_inherits_and_extends_call_stack() {
        let parent = Task::new_root(
            "req-1",
            TaskKind::Agent {
                agent_id: "product_manager".to_string(),
            },
            serde_json::json!({"prompt": "hi"}),
            None,
            None,
        );
        assert_eq!(parent.call_stack, vec!["product_manager".to_string()]);

        let child = Task::new_child(&parent, "engineer", serde_json::json!({"prompt": "feasibility?"}));
        assert_eq!(child.depth, 1);
        assert_eq!(
            child.call_stack,
            vec!["product_manager".to_string(), "engineer".to_string()]
        );
        assert_eq!(child.parent_task_id, Some(parent.id.clone()));
    }

    #[test]
    fn terminal_states_are_closed_under_is_terminal() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::AwaitingChild.is_terminal());
    }
}
