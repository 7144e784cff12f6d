//! C5 — `MemoryLog`: append-only per-conversation message history with
//! LLM-authored self-compression when a conversation outgrows its token budget.
//!
//! The self-compression strategy (summarise the oldest half, keep the most
//! recent messages verbatim) is grounded in the donor crate's
//! `SelfCompressionStrategy` (`context_strategy.rs`), generalised here from a
//! single-session context window to a per-conversation store shared across many
//! concurrent tasks. Per-conversation mutual exclusion uses a `dashmap`-looked-up
//! `tokio::sync::Mutex`, the same pattern `limiter.rs` uses for per-domain state.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::task::{ConversationMessage, ConversationRole};

/// Recent messages are always kept verbatim; only older history is a
/// summarisation candidate (§4.5).
const VERBATIM_TAIL: usize = 10;

/// A rough whitespace-split token estimate; good enough to decide when a
/// conversation needs compressing without depending on a provider-specific
/// tokenizer.
fn estimate_tokens(messages: &[ConversationMessage]) -> usize {
    messages
        .iter()
        .map(|m| m.content.split_whitespace().count())
        .sum()
}

struct ConversationState {
    messages: Vec<ConversationMessage>,
    next_seq: u64,
}

/// A function that turns a run of older messages into one summary string. In
/// production this is backed by a C6 `ModelProvider` call; tests supply a
/// deterministic stub.
pub type Summariser = Arc<dyn Fn(&[ConversationMessage]) -> Result<String, EngineError> + Send + Sync>;

/// Append-only per-conversation message log.
pub struct MemoryLog {
    conversations: DashMap<String, Mutex<ConversationState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog {
            conversations: DashMap::new(),
        }
    }

    /// Append one message, returning its assigned sequence number.
    pub async fn append(
        &self,
        conversation_id: &str,
        role: ConversationRole,
        speaker: Option<String>,
        content: impl Into<String>,
    ) -> u64 {
        let entry = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                Mutex::new(ConversationState {
                    messages: Vec::new(),
                    next_seq: 0,
                })
            });
        let mut guard = entry.lock().await;
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.messages.push(ConversationMessage {
            conversation_id: conversation_id.to_string(),
            seq,
            role,
            speaker,
            content: content.into(),
            created_at: chrono::Utc::now(),
        });
        seq
    }

    /// The most recent `n` messages, oldest first.
    pub async fn recent(&self, conversation_id: &str, n: usize) -> Vec<ConversationMessage> {
        match self.conversations.get(conversation_id) {
            Some(entry) => {
                let guard = entry.lock().await;
                let len = guard.messages.len();
                let start = len.saturating_sub(n);
                guard.messages[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Return the conversation's messages, summarising the oldest half in
    /// place (behind a single synthetic `System` message) if the estimated
    /// token count exceeds `token_budget`. The most recent [`VERBATIM_TAIL`]
    /// messages are never summarised away, per §4.5.
    pub async fn summarise_if_over(
        &self,
        conversation_id: &str,
        token_budget: usize,
        summarise: Summariser,
    ) -> Result<Vec<ConversationMessage>, EngineError> {
        let entry = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                Mutex::new(ConversationState {
                    messages: Vec::new(),
                    next_seq: 0,
                })
            });
        let mut guard = entry.lock().await;

        if estimate_tokens(&guard.messages) <= token_budget || guard.messages.len() <= VERBATIM_TAIL {
            return Ok(guard.messages.clone());
        }

        let split = guard.messages.len() - VERBATIM_TAIL;
        let (older, tail) = guard.messages.split_at(split);
        let summary_text = summarise(older)?;

        let mut compacted = Vec::with_capacity(1 + tail.len());
        compacted.push(ConversationMessage {
            conversation_id: conversation_id.to_string(),
            seq: older.last().map(|m| m.seq).unwrap_or(0),
            role: ConversationRole::System,
            speaker: None,
            content: format!("[summary of {} earlier messages] {}", older.len(), summary_text),
            created_at: chrono::Utc::now(),
        });
        compacted.extend_from_slice(tail);

        guard.messages = compacted.clone();
        Ok(compacted)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_increasing_sequence_numbers() {
        let log = MemoryLog::new();
        let seq0 = log.append("c1", ConversationRole::User, None, "hi").await;
        let seq1 = log
            .append("c1", ConversationRole::Assistant, Some("assistant".to_string()), "hello")
            .await;
        assert_eq!(seq0, 0);
        assert_eq!(seq1, 1);
    }

    #[tokio::test]
    async fn recent_returns_last_n_in_order() {
        let log = MemoryLog::new();
        for i in 0..5 {
            log.append("c1", ConversationRole::User, None, format!("msg{}", i)).await;
        }
        let last_two = log.recent("c1", 2).await;
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].content, "msg3");
        assert_eq!(last_two[1].content, "msg4");
    }

    #[tokio::test]
    async fn recent_on_unknown_conversation_is_empty() {
        let log = MemoryLog::new();
        assert!(log.recent("ghost", 5).await.is_empty());
    }

    #[tokio::test]
    async fn under_budget_conversation_is_returned_unchanged() {
        let log = MemoryLog::new();
        log.append("c1", ConversationRole::User, None, "hi").await;
        let summariser: Summariser = Arc::new(|_msgs| Ok("should not be called".to_string()));
        let messages = log.summarise_if_over("c1", 10_000, summariser).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn over_budget_conversation_compresses_oldest_half() {
        let log = MemoryLog::new();
        for i in 0..20 {
            log.append("c1", ConversationRole::User, None, format!("message number {}", i))
                .await;
        }
        let summariser: Summariser = Arc::new(|older| {
            Ok(format!("condensed {} messages", older.len()))
        });
        let messages = log.summarise_if_over("c1", 1, summariser).await.unwrap();

        assert_eq!(messages.len(), 1 + VERBATIM_TAIL);
        assert_eq!(messages[0].role, ConversationRole::System);
        assert!(messages[0].content.contains("condensed 10 messages"));
        assert_eq!(messages.last().unwrap().content, "message number 19");
    }

    #[tokio::test]
    async fn short_conversation_is_never_summarised_even_over_budget() {
        let log = MemoryLog::new();
        for i in 0..3 {
            log.append("c1", ConversationRole::User, None, format!("this is a longer message {}", i))
                .await;
        }
        let summariser: Summariser = Arc::new(|_| Ok("unused".to_string()));
        let messages = log.summarise_if_over("c1", 1, summariser).await.unwrap();
        assert_eq!(messages.len(), 3);
    }
}
