//! Request/response types for the provider boundary.

use foreman_types::{ChatMessage, TokenUsage};
use serde::{Deserialize, Serialize};

/// Schema for one tool offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: serde_json::Value,
}

/// Constraint on the model's tool selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides whether to call tools.
    #[default]
    Auto,
    /// The model must call at least one tool. Used by the empty-response
    /// retry.
    Required,
}

/// One chat-completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier.
    pub model: String,
    /// Full message history, system prompt included.
    pub messages: Vec<ChatMessage>,
    /// Tool schemas the model may call.
    pub tools: Vec<ToolSchema>,
    /// Tool selection constraint.
    pub tool_choice: ToolChoice,
    /// Reasoning effort hint for models that support it.
    pub reasoning_effort: Option<String>,
}

impl CompletionRequest {
    /// Create a request with defaults for the optional fields.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            reasoning_effort: None,
        }
    }
}

/// One chat-completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// The assistant message, possibly carrying tool calls.
    pub message: ChatMessage,
    /// Token usage reported by the provider for this call.
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// A plain-text assistant response with the given usage.
    pub fn text(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            message: ChatMessage::assistant(content),
            usage,
        }
    }
}
