//! Parallel tool execution with order-preserving output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use foreman_artifacts::{GetToolOutputTool, format_marker};
use foreman_tool::ToolDyn;
use foreman_tool::envelope::{check_tool_error, is_critical_tool_error, safe_preview};
use foreman_types::{ChatMessage, ToolCall};
use serde_json::Value;
use tracing::warn;

use crate::context::{AgentProfile, RunContext};
use crate::engine::{EngineError, ReactEngine};
use crate::spawn::{Interrupt, SPAWN_TOOL_NAME, handle_spawn_calls};

/// Outcome of executing one assistant message's tool calls.
#[derive(Debug)]
pub enum ToolBatchOutcome {
    /// All calls resolved inline; the loop continues.
    Completed(Vec<ChatMessage>),
    /// Spawn calls opened a barrier; the loop must return.
    Interrupted {
        /// Tool messages to append before parking the run, including the
        /// spawn acknowledgements.
        tool_messages: Vec<ChatMessage>,
        /// The interrupt for the orchestrator's barrier commit.
        interrupt: Interrupt,
    },
}

/// Execute one batch of tool calls.
///
/// Non-spawn calls run concurrently; spawn calls go through two-phase
/// commit. The returned tool messages are in the assistant's call order
/// regardless of completion order.
pub(crate) async fn execute_tools_parallel(
    engine: &ReactEngine,
    calls: &[ToolCall],
    tools_by_name: &HashMap<String, Arc<dyn ToolDyn>>,
    profile: &AgentProfile,
    ctx: &RunContext,
) -> Result<ToolBatchOutcome, EngineError> {
    let mut spawn_calls: Vec<(usize, ToolCall)> = Vec::new();
    let mut other_calls: Vec<(usize, ToolCall)> = Vec::new();
    for (index, call) in calls.iter().enumerate() {
        if call.name == SPAWN_TOOL_NAME {
            spawn_calls.push((index, call.clone()));
        } else {
            other_calls.push((index, call.clone()));
        }
    }

    let mut indexed: Vec<(usize, ChatMessage)> = Vec::with_capacity(calls.len());

    // Non-spawn calls run as sibling futures; a failure in one never
    // cancels the others.
    let futures = other_calls
        .iter()
        .map(|(index, call)| {
            let index = *index;
            async move { (index, execute_tool(engine, call, tools_by_name, ctx).await) }
        })
        .collect::<Vec<_>>();
    indexed.extend(futures::future::join_all(futures).await);

    let interrupt = if spawn_calls.is_empty() {
        None
    } else {
        let (spawn_messages, interrupt) =
            handle_spawn_calls(engine, &spawn_calls, profile, ctx).await?;
        indexed.extend(spawn_messages);
        interrupt
    };

    indexed.sort_by_key(|(index, _)| *index);
    let tool_messages = indexed.into_iter().map(|(_, message)| message).collect();

    Ok(match interrupt {
        Some(interrupt) => ToolBatchOutcome::Interrupted {
            tool_messages,
            interrupt,
        },
        None => ToolBatchOutcome::Completed(tool_messages),
    })
}

/// Execute one non-spawn tool call, producing its tool message.
///
/// Failures become `<tool-error>` messages; critical errors additionally
/// mark the context for the outer runner's fail-fast override.
async fn execute_tool(
    engine: &ReactEngine,
    call: &ToolCall,
    tools_by_name: &HashMap<String, Arc<dyn ToolDyn>>,
    ctx: &RunContext,
) -> ChatMessage {
    let started = Instant::now();
    ctx.emitter
        .emit_tool_started(&call.name, &call.id, &call.args)
        .await;

    let raw = match tools_by_name.get(&call.name) {
        None => format!("Error: Tool '{}' not found.", call.name),
        Some(tool) => {
            // Underscore-prefixed keys are internal arguments the model
            // never supplies; owner and run scope ride along so tools
            // like get_tool_output can enforce ownership.
            let mut args = call.args.clone();
            if let Value::Object(map) = &mut args {
                if let Some(owner) = ctx.owner_id {
                    map.insert("_owner_id".into(), Value::from(owner.as_i64()));
                }
                if let Some(run_id) = ctx.run_id {
                    map.insert("_run_id".into(), Value::from(run_id.as_i64()));
                }
                map.insert("_tool_call_id".into(), Value::from(call.id.clone()));
            }
            match tool.call(args).await {
                Ok(value) => render_tool_value(&value),
                Err(err) => format!("<tool-error> {err}"),
            }
        }
    };

    let duration_ms = started.elapsed().as_millis() as i64;
    let error = check_tool_error(&raw);

    if let Some(message) = &error {
        if is_critical_tool_error(&call.name, message) {
            warn!(tool = %call.name, %message, "critical tool error");
            ctx.emitter.mark_critical_error(message.clone());
        }
    }

    let content = externalize_if_large(engine, &call.name, &call.id, raw, ctx).await;

    match &error {
        Some(message) => {
            ctx.emitter
                .emit_tool_failed(&call.name, &call.id, duration_ms, message)
                .await;
        }
        None => {
            ctx.emitter
                .emit_tool_completed(&call.name, &call.id, duration_ms, &content)
                .await;
        }
    }

    ChatMessage::tool(content, &call.id, &call.name)
}

/// Render a tool's JSON result for the conversation.
fn render_tool_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => match serde_json::to_string(other) {
            Ok(body) => body,
            Err(err) => format!("<tool-error> failed to serialize tool result: {err}"),
        },
    }
}

/// Store an oversized output out of band, replacing it inline with the
/// marker block. The `get_tool_output` call itself is exempt so fetched
/// outputs are never re-externalized.
async fn externalize_if_large(
    engine: &ReactEngine,
    tool_name: &str,
    tool_call_id: &str,
    raw: String,
    ctx: &RunContext,
) -> String {
    let max_chars = engine.settings.tool_output_max_chars;
    if max_chars == 0 || raw.chars().count() <= max_chars || tool_name == GetToolOutputTool::NAME {
        return raw;
    }

    let preview_chars = engine
        .settings
        .tool_output_preview_chars
        .min(max_chars)
        .max(1);
    let preview = safe_preview(&raw, preview_chars);

    let Some(owner_id) = ctx.owner_id else {
        return format!(
            "(Tool output truncated; exceeded {max_chars} characters.)\n\
             Full output was not stored (no owner context).\nPreview:\n{preview}"
        );
    };

    match engine.tool_outputs.save_output(owner_id, &raw).await {
        Ok(artifact_id) => {
            let marker = format_marker(&artifact_id, tool_name, raw.len());
            format!(
                "{marker}\n\
                 Tool output exceeded {max_chars} characters and was stored out of band.\n\
                 Preview (first {preview_chars} chars):\n{preview}\n\n\
                 Use get_tool_output(artifact_id) to fetch the full output."
            )
        }
        Err(err) => {
            warn!(tool = tool_name, tool_call_id, %err, "failed to store oversized tool output");
            format!(
                "(Tool output truncated; exceeded {max_chars} characters.)\n\
                 Full output was not stored (storage failed).\nPreview:\n{preview}"
            )
        }
    }
}
