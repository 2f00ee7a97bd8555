//! State-machine builder for the engine's message array.
//!
//! Enforces the assembly order system → conversation → tool messages →
//! dynamic context. Each transition is checked and double-build is
//! rejected, so a caller can never feed the model a half-assembled
//! history.

use foreman_store::Database;
use foreman_types::{ChatMessage, Role, ThreadId};

use crate::orchestrator::OrchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Init,
    SystemPrompt,
    Conversation,
    ToolMessages,
    DynamicContext,
    Built,
}

/// The assembled array plus bookkeeping the caller needs to slice new
/// messages off the engine result.
#[derive(Debug)]
pub struct MessageArrayResult {
    /// The messages, in engine order.
    pub messages: Vec<ChatMessage>,
    /// How many messages were assembled; everything the engine appends
    /// beyond this index is new.
    pub assembled_len: usize,
}

/// Builder for one engine invocation's message array.
#[derive(Debug)]
pub struct MessageArrayBuilder {
    db: Database,
    phase: Phase,
    system: Vec<ChatMessage>,
    dynamic_context: Vec<ChatMessage>,
    conversation: Vec<ChatMessage>,
}

impl MessageArrayBuilder {
    /// Start a builder over the database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            phase: Phase::Init,
            system: Vec::new(),
            dynamic_context: Vec::new(),
            conversation: Vec::new(),
        }
    }

    fn advance(&mut self, expected_before: Phase, next: Phase, op: &str) -> Result<(), OrchError> {
        if self.phase >= next {
            return Err(OrchError::Builder(format!("builder already past {op}")));
        }
        if self.phase < expected_before {
            return Err(OrchError::Builder(format!(
                "must call {expected_before:?} phase before {op}"
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Set the fresh system prompt. Always injected from configuration,
    /// never read back from the thread.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Result<Self, OrchError> {
        self.advance(Phase::Init, Phase::SystemPrompt, "SYSTEM_PROMPT")?;
        self.system.push(ChatMessage::system(prompt));
        Ok(self)
    }

    /// Load the thread's conversation. Persisted system messages are
    /// skipped - they are stale by definition; the fresh prompt and
    /// dynamic context replace them.
    pub async fn with_conversation(mut self, thread_id: ThreadId) -> Result<Self, OrchError> {
        self.advance(Phase::SystemPrompt, Phase::Conversation, "CONVERSATION")?;
        let records = self.db.messages_for_thread(thread_id).await;
        self.conversation = records
            .iter()
            .filter(|m| m.role != Role::System)
            .map(foreman_store::MessageRecord::to_chat)
            .collect();
        Ok(self)
    }

    /// Append tool messages that are not yet persisted to the thread
    /// (sequential resume injects the worker reply here).
    pub fn with_tool_messages(
        mut self,
        tool_messages: Vec<ChatMessage>,
    ) -> Result<Self, OrchError> {
        self.advance(Phase::Conversation, Phase::ToolMessages, "TOOL_MESSAGES")?;
        self.conversation.extend(tool_messages);
        Ok(self)
    }

    /// Add ephemeral context (recent-worker listing and the like) as
    /// system messages grouped behind the prompt. Regenerated fresh each
    /// run, never persisted.
    pub fn with_dynamic_context(
        mut self,
        context: Vec<ChatMessage>,
    ) -> Result<Self, OrchError> {
        if self.phase < Phase::Conversation {
            return Err(OrchError::Builder(
                "with_dynamic_context must be called after CONVERSATION".into(),
            ));
        }
        if self.phase >= Phase::DynamicContext {
            return Err(OrchError::Builder("builder already past DYNAMIC_CONTEXT".into()));
        }
        self.phase = Phase::DynamicContext;
        self.dynamic_context = context;
        Ok(self)
    }

    /// Assemble the final array.
    pub fn build(mut self) -> Result<MessageArrayResult, OrchError> {
        if self.phase == Phase::Built {
            return Err(OrchError::Builder("builder already built".into()));
        }
        if self.phase < Phase::Conversation {
            return Err(OrchError::Builder(
                "must at least call with_system_prompt and with_conversation".into(),
            ));
        }
        self.phase = Phase::Built;

        let mut messages = self.system;
        messages.append(&mut self.dynamic_context);
        messages.append(&mut self.conversation);
        let assembled_len = messages.len();
        Ok(MessageArrayResult {
            messages,
            assembled_len,
        })
    }
}
