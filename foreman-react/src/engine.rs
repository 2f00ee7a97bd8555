//! The engine proper: LLM calls with heartbeats, the bounded loop, and
//! the empty-response guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use foreman_artifacts::{ArtifactStore, ToolOutputStore};
use foreman_provider::{
    CompletionRequest, CompletionResponse, Provider, ProviderError, ToolChoice, ToolSchema,
};
use foreman_store::{Database, StoreError};
use foreman_tool::ToolDyn;
use foreman_types::{ChatMessage, Settings, TokenUsage};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::{AgentProfile, RunContext};
use crate::executor::{ToolBatchOutcome, execute_tools_parallel};
use crate::ReactResult;

/// Assistant message appended when the model stays empty after the retry.
const EMPTY_RESPONSE_ERROR: &str =
    "Error: LLM returned an empty response twice. This is a provider/model issue.";

/// Corrective system message for the one-shot empty-response retry.
const EMPTY_RETRY_PROMPT: &str = "Your previous response was empty. You MUST either:\n\
     1) Call the appropriate tool(s), OR\n\
     2) Provide a final answer.\n\nDo not return an empty message.";

/// Errors that fail the current run.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// The model call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A store operation on the spawn path failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The run execution engine.
///
/// Holds only shared read-only dependencies; per-invocation state lives
/// on the stack of [`ReactEngine::run_loop`].
#[derive(Clone)]
pub struct ReactEngine {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) db: Database,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) tool_outputs: ToolOutputStore,
    pub(crate) settings: Arc<Settings>,
}

impl ReactEngine {
    /// Create an engine over shared dependencies.
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        db: Database,
        artifacts: ArtifactStore,
        tool_outputs: ToolOutputStore,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            provider,
            db,
            artifacts,
            tool_outputs,
            settings,
        }
    }

    /// The shared settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run the loop until the model finishes or a spawn interrupts it.
    ///
    /// `messages` is the complete history including the system prompt;
    /// `tools` is the allowlist-filtered tool set for this agent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on LLM failure or a store failure on the
    /// spawn path; tool failures never error, they become `<tool-error>`
    /// tool messages inline.
    pub async fn run_loop(
        &self,
        messages: Vec<ChatMessage>,
        profile: &AgentProfile,
        tools: &[Arc<dyn ToolDyn>],
        ctx: &RunContext,
    ) -> Result<ReactResult, EngineError> {
        let mut usage = TokenUsage::default();
        let mut current = messages;

        let tools_by_name: HashMap<String, Arc<dyn ToolDyn>> = tools
            .iter()
            .map(|t| (t.name().to_string(), Arc::clone(t)))
            .collect();
        let schemas: Vec<ToolSchema> = tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();

        // Resume path: the last message may be an assistant message whose
        // tool calls were never answered (the run was restored mid-turn).
        // Execute the pending calls before touching the model.
        let mut phase = "initial";
        if let Some(pending) = unresolved_tool_calls(&current) {
            info!(pending = pending.len(), "resuming with pending tool calls");
            let outcome = execute_tools_parallel(self, &pending, &tools_by_name, profile, ctx).await?;
            match outcome {
                ToolBatchOutcome::Interrupted { tool_messages, interrupt } => {
                    current.extend(tool_messages);
                    return Ok(ReactResult {
                        messages: current,
                        usage,
                        interrupt: Some(interrupt),
                    });
                }
                ToolBatchOutcome::Completed(tool_messages) => {
                    current.extend(tool_messages);
                    phase = "resume_synthesis";
                }
            }
        }

        let mut response = self
            .call_llm(&current, &schemas, profile, ToolChoice::Auto, phase, ctx)
            .await?;
        usage.add(&response.usage);

        // Empty-response guard: one corrective retry with tool_choice
        // required, then a synthetic error message. This is not a system
        // failure - the run completes.
        if is_empty_response(&response.message) {
            warn!("model produced an empty response; retrying once");
            current.push(ChatMessage::system(EMPTY_RETRY_PROMPT));
            let tool_choice = if schemas.is_empty() {
                ToolChoice::Auto
            } else {
                ToolChoice::Required
            };
            response = self
                .call_llm(&current, &schemas, profile, tool_choice, "empty_retry", ctx)
                .await?;
            usage.add(&response.usage);
            if is_empty_response(&response.message) {
                error!("model produced an empty response after retry");
                current.push(ChatMessage::assistant(EMPTY_RESPONSE_ERROR));
                return Ok(ReactResult {
                    messages: current,
                    usage,
                    interrupt: None,
                });
            }
        }

        // Main loop, bounded by the iteration cap.
        let mut iteration: u32 = 0;
        while response.message.has_tool_calls() {
            iteration += 1;
            if iteration > self.settings.max_react_iterations {
                error!(
                    cap = self.settings.max_react_iterations,
                    "loop exceeded the iteration cap"
                );
                current.push(ChatMessage::assistant(format!(
                    "Error: exceeded maximum of {} tool iterations.",
                    self.settings.max_react_iterations
                )));
                return Ok(ReactResult {
                    messages: current,
                    usage,
                    interrupt: None,
                });
            }

            let calls = response.message.tool_calls.clone().unwrap_or_default();
            current.push(response.message);

            let outcome = execute_tools_parallel(self, &calls, &tools_by_name, profile, ctx).await?;
            match outcome {
                ToolBatchOutcome::Interrupted { tool_messages, interrupt } => {
                    current.extend(tool_messages);
                    return Ok(ReactResult {
                        messages: current,
                        usage,
                        interrupt: Some(interrupt),
                    });
                }
                ToolBatchOutcome::Completed(tool_messages) => {
                    current.extend(tool_messages);
                }
            }

            response = self
                .call_llm(&current, &schemas, profile, ToolChoice::Auto, "tool_iteration", ctx)
                .await?;
            usage.add(&response.usage);
        }

        current.push(response.message);
        Ok(ReactResult {
            messages: current,
            usage,
            interrupt: None,
        })
    }

    /// One model call wrapped with heartbeats and audit logging.
    async fn call_llm(
        &self,
        messages: &[ChatMessage],
        schemas: &[ToolSchema],
        profile: &AgentProfile,
        tool_choice: ToolChoice,
        phase: &str,
        ctx: &RunContext,
    ) -> Result<CompletionResponse, EngineError> {
        let correlation_id = Uuid::new_v4();
        let start = Instant::now();
        info!(
            %correlation_id,
            phase,
            model = %profile.model,
            message_count = messages.len(),
            run_id = ?ctx.run_id,
            trace_id = ?ctx.trace_id,
            "llm request"
        );

        // Heartbeats run as a sibling task so external monitors see the
        // engine is alive during a long model call. Always cancelled with
        // a bounded join.
        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(emit_heartbeats(
            ctx.emitter.clone(),
            phase.to_string(),
            self.settings.react_heartbeat_interval,
            cancel.clone(),
        ));

        let request = CompletionRequest {
            model: profile.model.clone(),
            messages: messages.to_vec(),
            tools: schemas.to_vec(),
            tool_choice,
            reasoning_effort: profile.reasoning_effort.clone(),
        };
        let result = self
            .provider
            .complete_with_tokens(request, ctx.token_sink.as_deref())
            .await;

        cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(1), heartbeat)
            .await
            .is_err()
        {
            warn!("heartbeat task did not stop within the join bound");
        }

        let duration_ms = start.elapsed().as_millis() as i64;
        match &result {
            Ok(response) => info!(
                %correlation_id,
                duration_ms,
                tool_calls = response
                    .message
                    .tool_calls
                    .as_ref()
                    .map_or(0, Vec::len),
                total_tokens = response.usage.total_tokens,
                "llm response"
            ),
            Err(err) => error!(%correlation_id, duration_ms, %err, "llm failure"),
        }

        Ok(result?)
    }
}

async fn emit_heartbeats(
    emitter: foreman_events::EventEmitter,
    phase: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {
                emitter.emit_heartbeat(&phase).await;
            }
        }
    }
}

/// Tool calls on the trailing assistant message with no reply downstream.
fn unresolved_tool_calls(messages: &[ChatMessage]) -> Option<Vec<foreman_types::ToolCall>> {
    let last = messages.last()?;
    if !last.has_tool_calls() {
        return None;
    }
    // Replies would come after the assistant message; the assistant being
    // last means every call is unresolved. A partially-answered turn is
    // reconstructed by the caller with the replies in place, so the
    // assistant is only last when nothing was answered - but check the
    // whole tail anyway for replies persisted out of order.
    let answered: std::collections::HashSet<&str> = messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    let pending: Vec<foreman_types::ToolCall> = last
        .tool_calls
        .as_ref()?
        .iter()
        .filter(|tc| !answered.contains(tc.id.as_str()))
        .cloned()
        .collect();
    if pending.is_empty() { None } else { Some(pending) }
}

fn is_empty_response(message: &ChatMessage) -> bool {
    !message.has_tool_calls() && message.text_content().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::ToolCall;
    use serde_json::json;

    #[test]
    fn unresolved_detection_requires_trailing_assistant() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("tc1", "echo", json!({}))],
            ),
        ];
        let pending = unresolved_tool_calls(&messages).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "tc1");

        // With the reply present there is nothing to resume.
        let mut answered = messages;
        answered.push(ChatMessage::tool("ok", "tc1", "echo"));
        // assistant is no longer last
        assert!(unresolved_tool_calls(&answered).is_none());
    }

    #[test]
    fn empty_response_detection() {
        assert!(is_empty_response(&ChatMessage::assistant("")));
        assert!(is_empty_response(&ChatMessage::assistant("   ")));
        assert!(!is_empty_response(&ChatMessage::assistant("text")));
        assert!(!is_empty_response(&ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("tc1", "echo", json!({}))],
        )));
    }
}
