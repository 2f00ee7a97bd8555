//! Prompt templates for the two agent roles.

/// Marker identifying ephemeral recent-worker context messages so stale
/// ones can be cleaned up between runs.
pub const RECENT_WORKER_CONTEXT_MARKER: &str = "<!-- RECENT_WORKER_CONTEXT -->";

/// System prompt for the long-lived supervisor.
#[must_use]
pub fn build_supervisor_prompt(owner_name: &str) -> String {
    format!(
        "You are the supervisor for {owner_name}. You interpret requests and \
         delegate concrete work to disposable workers.\n\n\
         Use spawn_worker to hand a task to a worker. Spawn workers in \
         parallel when subtasks are independent. Check recent worker \
         activity before spawning duplicate work, and synthesize worker \
         results into a direct answer for the user.\n\n\
         Keep answers factual and grounded in worker evidence."
    )
}

/// System prompt for a disposable worker.
#[must_use]
pub fn build_worker_prompt(owner_name: &str) -> String {
    format!(
        "You are a worker executing one task for {owner_name}. The terminal \
         is the primitive: prefer infrastructure tools over speculation.\n\n\
         Work the task to completion, then reply with a final message that \
         states the outcome. Be concise and factual; your final message is \
         the result your supervisor sees."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_mention_the_owner() {
        assert!(build_supervisor_prompt("alice").contains("alice"));
        assert!(build_worker_prompt("alice").contains("alice"));
    }

    #[test]
    fn supervisor_prompt_names_the_spawn_tool() {
        assert!(build_supervisor_prompt("x").contains("spawn_worker"));
    }
}
