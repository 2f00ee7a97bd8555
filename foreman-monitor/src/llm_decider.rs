//! LLM-backed roundabout decisions.
//!
//! The default decision mode: a small model reads the status snapshot
//! and answers wait/exit/cancel/peek. Budget and interval gates keep the
//! cost bounded; every failure degrades to Wait.

use std::sync::Arc;
use std::time::Duration;

use foreman_provider::{CompletionRequest, Provider};
use foreman_types::ChatMessage;
use serde_json::Value;
use tracing::{debug, warn};

use crate::decision::{Decision, DecisionContext};

/// Default polls between LLM calls.
pub const DEFAULT_LLM_POLL_INTERVAL: u32 = 5;
/// Default LLM call budget per monitoring session.
pub const DEFAULT_LLM_MAX_CALLS: u32 = 10;
/// Default per-call timeout.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(5);

/// Call/skip counters for one monitoring session.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlmDeciderStats {
    /// LLM calls made.
    pub calls: u32,
    /// Calls skipped because the budget was exhausted.
    pub skipped_budget: u32,
    /// Calls skipped by the poll-interval gate.
    pub skipped_interval: u32,
}

/// Budgeted LLM decider.
pub struct LlmDecider {
    provider: Arc<dyn Provider>,
    model: String,
    poll_interval: u32,
    max_calls: u32,
    timeout: Duration,
    calls_made: u32,
    stats: LlmDeciderStats,
}

impl LlmDecider {
    /// Create a decider over a provider.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            poll_interval: DEFAULT_LLM_POLL_INTERVAL,
            max_calls: DEFAULT_LLM_MAX_CALLS,
            timeout: DEFAULT_LLM_TIMEOUT,
            calls_made: 0,
            stats: LlmDeciderStats::default(),
        }
    }

    /// Override the poll-interval gate.
    #[must_use]
    pub fn with_poll_interval(mut self, polls: u32) -> Self {
        self.poll_interval = polls.max(1);
        self
    }

    /// Override the call budget.
    #[must_use]
    pub fn with_max_calls(mut self, max_calls: u32) -> Self {
        self.max_calls = max_calls;
        self
    }

    /// Session stats.
    #[must_use]
    pub fn stats(&self) -> LlmDeciderStats {
        self.stats
    }

    /// Decide for one tick. `check_count` is the monitor's poll counter,
    /// used by the interval gate.
    pub async fn decide(&mut self, ctx: &DecisionContext, check_count: u64) -> (Decision, String) {
        if self.calls_made >= self.max_calls {
            self.stats.skipped_budget += 1;
            debug!(job_id = %ctx.job_id, "llm decision budget exhausted");
            return (Decision::Wait, "LLM budget exhausted, continuing to monitor".into());
        }
        if check_count % u64::from(self.poll_interval) != 0 {
            self.stats.skipped_interval += 1;
            return (Decision::Wait, "Continuing to monitor".into());
        }

        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "You monitor a background worker. Reply with a JSON object \
                     {\"action\": \"wait\"|\"exit\"|\"cancel\"|\"peek\", \"reason\": \"...\"}. \
                     Prefer wait unless the worker clearly finished or produced a final answer.",
                ),
                ChatMessage::user(render_status(ctx)),
            ],
        );

        let response =
            tokio::time::timeout(self.timeout, self.provider.complete(request)).await;
        self.calls_made += 1;
        self.stats.calls += 1;

        match response {
            Ok(Ok(completion)) => parse_decision(&completion.message.content),
            Ok(Err(err)) => {
                warn!(job_id = %ctx.job_id, %err, "llm decision error");
                (Decision::Wait, format!("LLM error ({err}), continuing to monitor"))
            }
            Err(_) => {
                warn!(job_id = %ctx.job_id, "llm decision timed out");
                (Decision::Wait, "LLM decision timed out, continuing to monitor".into())
            }
        }
    }
}

fn render_status(ctx: &DecisionContext) -> String {
    let mut lines = vec![
        format!("Task: {}", ctx.task),
        format!("Status: {:?}", ctx.status),
        format!("Elapsed: {:.0}s", ctx.elapsed_seconds),
        format!("Polls without progress: {}", ctx.polls_without_progress),
    ];
    if let Some(op) = &ctx.current_operation {
        lines.push(format!(
            "Current operation: {} (running {:.0}s{})",
            op.tool_name,
            ctx.stuck_seconds,
            if ctx.is_stuck { ", stuck" } else { "" }
        ));
    }
    for activity in ctx.tool_activities.iter().rev().take(5) {
        lines.push(format!("Recent tool: {} {:?}", activity.tool_name, activity.status));
    }
    if let Some(output) = &ctx.last_tool_output {
        lines.push(format!("Last output: {output}"));
    }
    lines.join("\n")
}

/// Parse the decider's reply. Accepts the JSON shape or a bare action
/// word; anything unparseable waits.
fn parse_decision(content: &str) -> (Decision, String) {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content.trim()) {
        let action = map.get("action").and_then(Value::as_str).unwrap_or("wait");
        let reason = map
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("no reason given")
            .to_string();
        return (action_from_str(action), reason);
    }
    let first_word = content
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("wait")
        .to_lowercase();
    (action_from_str(&first_word), content.trim().to_string())
}

fn action_from_str(action: &str) -> Decision {
    match action {
        "exit" => Decision::Exit,
        "cancel" => Decision::Cancel,
        "peek" => Decision::Peek,
        _ => Decision::Wait,
    }
}
