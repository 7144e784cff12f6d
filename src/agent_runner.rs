//! C8 (execution side) — `AgentRunner`: load an agent record, call the model,
//! detect and bound inter-agent delegation, and consolidate child outputs.
//!
//! The delegation-detection loop is grounded in the donor's `Agent::parse_tool_call`
//! (`agent.rs`) brace-counting extraction of a structured fragment from free-text
//! model output, generalised here from "is this a tool call" to "is this a
//! delegation directive" against a fixed sentinel (§9 Open Question (a), resolved
//! below). The sequential-children-then-consolidate shape is grounded in the
//! donor's `Orchestration::execute_hierarchical` (`orchestration.rs`), generalised
//! from a fixed static layer list to depth/cycle-bounded recursion — the donor
//! never recurses, so the bound itself is new code, not copied.
//!
//! Delegation directive syntax (Open Question (a)): a line `DELEGATE <agent_id>:`
//! followed by a two-space-indented block holding the sub-prompt, reusing C1's
//! own indentation convention rather than inventing a second one. Each agent's
//! system prompt instructs it to emit this when it needs a peer's help.

use futures_util::future::BoxFuture;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::agent_registry::AgentRegistry;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::memory_log::MemoryLog;
use crate::model_client::{ChatMessage, CompletionRequest, ModelClient};
use crate::serde_compact;
use crate::store::Store;
use crate::task::{ConversationRole, Task, TaskId, TaskKind, TaskState};

/// Verbatim conversation messages pulled from C5 before the agent's own turn.
const CONVERSATION_WINDOW: usize = 10;
const RESPONSE_MAX_TOKENS: u32 = 900;

/// Result of running one agent turn, including everything delegated beneath it.
#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    pub text: String,
    /// Every child task spawned by delegation, in call order (successful or not).
    pub delegations: Vec<TaskId>,
    /// Set when MAX_DEPTH was reached and directives were ignored (§4.8 step 6).
    pub warning: Option<String>,
    /// Model id that produced `text` (the invoked agent's own model, or the
    /// consolidating agent's model when children ran) — surfaced as
    /// `used_model` on the §6 fast-path response.
    pub model_id: String,
}

fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
        0u8.hash(&mut hasher); // separator so "ab","c" != "a","bc"
    }
    format!("{:016x}", hasher.finish())
}

fn role_str(role: ConversationRole) -> &'static str {
    match role {
        ConversationRole::User => "user",
        ConversationRole::Assistant => "assistant",
        ConversationRole::System => "system",
    }
}

/// Scan `text` for `DELEGATE <agent_id>:` sentinel blocks, returning
/// `(callee_id, sub_prompt)` pairs in the order they appear.
fn parse_delegations(text: &str) -> Vec<(String, String)> {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let header = line
            .strip_prefix("DELEGATE ")
            .and_then(|rest| rest.strip_suffix(':'));
        match header {
            Some(agent_id) => {
                let agent_id = agent_id.trim().to_string();
                i += 1;
                let mut body = Vec::new();
                while i < lines.len() {
                    let candidate = lines[i];
                    if let Some(stripped) = candidate.strip_prefix("  ") {
                        body.push(stripped);
                        i += 1;
                    } else if candidate.trim().is_empty() {
                        body.push("");
                        i += 1;
                    } else {
                        break;
                    }
                }
                while matches!(body.last(), Some(l) if l.is_empty()) {
                    body.pop();
                }
                if !agent_id.is_empty() {
                    out.push((agent_id, body.join("\n").trim().to_string()));
                }
            }
            None => i += 1,
        }
    }
    out
}

/// Build the consolidation prompt for C8 step 8 / the multi-agent reducer.
/// `original` is `None` for the multi-agent case (there is no single
/// "original" respondent, only peers consulted in parallel).
fn build_consolidation_prompt(original: Option<(&str, &str)>, children: &[(String, String)]) -> String {
    let mut prompt = String::new();
    if let Some((agent_id, text)) = original {
        prompt.push_str(&format!("Original response from {}:\n{}\n\n", agent_id, text));
    }
    prompt.push_str("Responses consulted:\n");
    for (callee, text) in children {
        prompt.push_str(&format!("[{}]\n{}\n\n", callee, text));
    }
    prompt.push_str("Produce one coherent final answer for the user that draws on all of the above.");
    prompt
}

pub struct AgentRunner {
    registry: std::sync::Arc<AgentRegistry>,
    model: std::sync::Arc<ModelClient>,
    memory: std::sync::Arc<MemoryLog>,
    store: std::sync::Arc<dyn Store>,
    max_depth: u32,
}

impl AgentRunner {
    pub fn new(
        registry: std::sync::Arc<AgentRegistry>,
        model: std::sync::Arc<ModelClient>,
        memory: std::sync::Arc<MemoryLog>,
        store: std::sync::Arc<dyn Store>,
        max_depth: u32,
    ) -> Self {
        AgentRunner {
            registry,
            model,
            memory,
            store,
            max_depth,
        }
    }

    /// Run `task`'s agent turn end to end (§4.8 steps 1-10). Boxed because the
    /// delegation path recurses into this same method for each child.
    pub fn run<'a>(&'a self, task: &'a Task, cancel: CancelToken) -> BoxFuture<'a, Result<AgentRunOutcome, EngineError>> {
        Box::pin(self.run_inner(task, cancel))
    }

    async fn run_inner(&self, task: &Task, mut cancel: CancelToken) -> Result<AgentRunOutcome, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let agent_id = match &task.kind {
            TaskKind::Agent { agent_id } => agent_id.clone(),
            other => {
                return Err(EngineError::Internal(format!(
                    "AgentRunner given a non-agent task kind: {:?}",
                    other
                )))
            }
        };

        if agent_id == "multi_agent" {
            return self.run_multi_agent(task, cancel).await;
        }

        let record = self
            .registry
            .get(&agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.clone()))?
            .clone();

        // `Task::new_root`/`Task::new_child` always seed this with the task's
        // own agent id, so it's never empty here for an `Agent`-kind task.
        let call_stack = task.call_stack.clone();

        let mut messages = Vec::new();
        if let Some(conversation_id) = &task.conversation_id {
            for m in self.memory.recent(conversation_id, CONVERSATION_WINDOW).await {
                messages.push(ChatMessage {
                    role: role_str(m.role).to_string(),
                    content: m.content,
                });
            }
        }
        let encoded_inputs = serde_compact::encode(&task.inputs)?;
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: encoded_inputs.clone(),
        });

        let request = CompletionRequest {
            model_id: record.model_id.clone(),
            system_text: record.system_prompt.clone(),
            messages,
            temperature: record.temperature,
            max_tokens: RESPONSE_MAX_TOKENS,
            timeout: record.timeout,
            idempotency_key: fingerprint(&["agent", &agent_id, &record.model_id, &encoded_inputs]),
        };

        let response = tokio::select! {
            res = self.model.complete(&task.requester_id, request) => res?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let mut delegations = Vec::new();
        let mut warning = None;
        let mut child_outputs: Vec<(String, String)> = Vec::new();

        if !record.can_delegate {
            // No delegation capability: nothing to parse.
        } else if task.depth >= self.max_depth {
            warning = Some(format!(
                "delegation depth {} reached MAX_DEPTH {}; directives ignored",
                task.depth, self.max_depth
            ));
        } else {
            for (callee, sub_prompt) in parse_delegations(&response.text) {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                if !record.allowed_callees.iter().any(|a| a == &callee) {
                    continue; // not on the allow-list: silently dropped (§4.8 step 6).
                }
                if call_stack.contains(&callee) {
                    child_outputs.push((
                        callee.clone(),
                        format!("[delegation to {} refused: cycle detected]", callee),
                    ));
                    continue;
                }

                let mut child = Task::new_child(task, &callee, serde_json::json!({ "prompt": sub_prompt }));
                self.store.insert_task(child.clone()).await?;
                self.store.add_child(&task.id, child.id.clone()).await?;
                delegations.push(child.id.clone());

                self.store
                    .cas_task_state(&child.id, TaskState::Queued, TaskState::Running, None)
                    .await?;
                child.state = TaskState::Running;

                match self.run(&child, cancel.clone()).await {
                    Ok(outcome) => {
                        self.store
                            .set_task_output(&child.id, TaskState::Completed, Some(serde_json::json!(outcome.text)), None)
                            .await?;
                        child_outputs.push((callee, outcome.text));
                    }
                    Err(err) => {
                        self.store
                            .set_task_output(&child.id, TaskState::Failed, None, Some(err.to_string()))
                            .await?;
                        if record.require_children {
                            return Err(err);
                        }
                        child_outputs.push((callee, format!("[delegation to {} failed: {}]", callee, err)));
                    }
                }
            }
        }

        let final_text = if child_outputs.is_empty() {
            response.text.clone()
        } else {
            let consolidation_prompt = build_consolidation_prompt(Some((&agent_id, &response.text)), &child_outputs);
            let request = CompletionRequest {
                model_id: record.model_id.clone(),
                system_text: record.system_prompt.clone(),
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: consolidation_prompt,
                }],
                temperature: record.temperature,
                max_tokens: RESPONSE_MAX_TOKENS,
                timeout: record.timeout,
                idempotency_key: fingerprint(&[
                    "consolidate",
                    &agent_id,
                    &task.id.to_string(),
                    &child_outputs.len().to_string(),
                ]),
            };
            let consolidated = tokio::select! {
                res = self.model.complete(&task.requester_id, request) => res?,
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            };
            consolidated.text
        };

        let final_text = match &warning {
            Some(w) => format!("{}\n\n[note: {}]", final_text, w),
            None => final_text,
        };

        if let Some(conversation_id) = &task.conversation_id {
            self.memory
                .append(conversation_id, ConversationRole::Assistant, Some(agent_id.clone()), final_text.clone())
                .await;
        }

        Ok(AgentRunOutcome {
            text: final_text,
            delegations,
            warning,
            model_id: record.model_id.clone(),
        })
    }

    /// `multi_agent` pseudo-agent (§4.9 `submit_multi`): invoke each mentioned
    /// agent in order and consolidate. Single-mentioned-agent reduces to
    /// identity (Open Question (b)'s resolution) rather than calling the model
    /// a second time to "consolidate" one response.
    async fn run_multi_agent(&self, task: &Task, mut cancel: CancelToken) -> Result<AgentRunOutcome, EngineError> {
        let record = self
            .registry
            .get("multi_agent")
            .ok_or_else(|| EngineError::UnknownAgent("multi_agent".to_string()))?
            .clone();

        let prompt = task
            .inputs
            .get("prompt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::BadRequest("multi_agent task missing prompt".to_string()))?
            .to_string();
        let mentioned: Vec<String> = task
            .inputs
            .get("mentioned_agents")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        if mentioned.is_empty() {
            return Err(EngineError::BadRequest(
                "multi_agent task requires at least one mentioned agent".to_string(),
            ));
        }

        let mut delegations = Vec::new();
        let mut child_outputs: Vec<(String, String)> = Vec::new();

        for callee in &mentioned {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let child = Task::new_child(task, callee, serde_json::json!({ "prompt": prompt }));
            self.store.insert_task(child.clone()).await?;
            self.store.add_child(&task.id, child.id.clone()).await?;
            delegations.push(child.id.clone());
            self.store
                .cas_task_state(&child.id, TaskState::Queued, TaskState::Running, None)
                .await?;

            match self.run(&child, cancel.clone()).await {
                Ok(outcome) => {
                    self.store
                        .set_task_output(&child.id, TaskState::Completed, Some(serde_json::json!(outcome.text)), None)
                        .await?;
                    child_outputs.push((callee.clone(), outcome.text));
                }
                Err(err) => {
                    self.store
                        .set_task_output(&child.id, TaskState::Failed, None, Some(err.to_string()))
                        .await?;
                    child_outputs.push((callee.clone(), format!("[{} failed: {}]", callee, err)));
                }
            }
        }

        let (final_text, model_id) = if child_outputs.len() == 1 {
            let used_model = self
                .registry
                .get(&mentioned[0])
                .map(|r| r.model_id.clone())
                .unwrap_or_else(|| record.model_id.clone());
            (child_outputs[0].1.clone(), used_model)
        } else {
            let consolidation_prompt = build_consolidation_prompt(None, &child_outputs);
            let request = CompletionRequest {
                model_id: record.model_id.clone(),
                system_text: record.system_prompt.clone(),
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: consolidation_prompt,
                }],
                temperature: record.temperature,
                max_tokens: RESPONSE_MAX_TOKENS,
                timeout: record.timeout,
                idempotency_key: fingerprint(&["multi_agent", &task.id.to_string(), &child_outputs.len().to_string()]),
            };
            let consolidated = tokio::select! {
                res = self.model.complete(&task.requester_id, request) => res?,
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            };
            (consolidated.text, record.model_id.clone())
        };

        if let Some(conversation_id) = &task.conversation_id {
            self.memory
                .append(
                    conversation_id,
                    ConversationRole::Assistant,
                    Some("multi_agent".to_string()),
                    final_text.clone(),
                )
                .await;
        }

        Ok(AgentRunOutcome {
            text: final_text,
            delegations,
            warning: None,
            model_id,
        })
    }
}
