//! Shared harness for the end-to-end orchestration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use foreman_artifacts::{ArtifactStore, GetToolOutputTool, ToolOutputStore};
use foreman_events::EventStore;
use foreman_orch::{
    GetWorkerMetadataTool, ListWorkersTool, Orchestrator, ReadWorkerResultTool, SpawnWorkerTool,
    WaitForWorkerTool,
};
use foreman_provider::{
    CompletionRequest, CompletionResponse, Provider, ProviderError,
};
use foreman_store::Database;
use foreman_tool::builtin::CurrentTimeTool;
use foreman_tool::{ToolRegistry, ToolResolver};
use foreman_types::{
    ChatMessage, DecisionMode, RunId, RunStatus, Settings, TokenUsage, ToolCall,
};

/// One scripted reply for a route.
pub enum Reply {
    /// Final assistant text.
    Text(&'static str),
    /// Assistant tool calls.
    ToolCalls(Vec<ToolCall>),
    /// Provider failure.
    Fail(&'static str),
}

struct Route {
    pattern: &'static str,
    delay: Duration,
    replies: StdMutex<VecDeque<Reply>>,
}

/// Routes completions by message content: the first route whose pattern
/// appears anywhere in the request and still has replies queued answers.
/// Parallel workers hit their own routes regardless of scheduling order.
pub struct RouterProvider {
    routes: Vec<Route>,
}

impl RouterProvider {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    #[must_use]
    pub fn route(self, pattern: &'static str, replies: Vec<Reply>) -> Self {
        self.route_delayed(pattern, Duration::ZERO, replies)
    }

    #[must_use]
    pub fn route_delayed(
        mut self,
        pattern: &'static str,
        delay: Duration,
        replies: Vec<Reply>,
    ) -> Self {
        self.routes.push(Route {
            pattern,
            delay,
            replies: StdMutex::new(replies.into()),
        });
        self
    }
}

fn usage() -> TokenUsage {
    TokenUsage {
        prompt_tokens: 5,
        completion_tokens: 5,
        total_tokens: 10,
        reasoning_tokens: 0,
    }
}

#[async_trait::async_trait]
impl Provider for RouterProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        for route in &self.routes {
            let matched = request
                .messages
                .iter()
                .any(|m| m.content.contains(route.pattern));
            if !matched {
                continue;
            }
            let reply = route.replies.lock().unwrap().pop_front();
            let Some(reply) = reply else {
                continue;
            };
            if route.delay > Duration::ZERO {
                tokio::time::sleep(route.delay).await;
            }
            return match reply {
                Reply::Text(text) => Ok(CompletionResponse::text(text, usage())),
                Reply::ToolCalls(calls) => Ok(CompletionResponse {
                    message: ChatMessage::assistant_with_tool_calls("", calls),
                    usage: usage(),
                }),
                Reply::Fail(message) => Err(ProviderError::Failed(message.into())),
            };
        }
        Err(ProviderError::Failed(
            "no route matched the request".into(),
        ))
    }
}

pub struct TestHarness {
    pub orch: Orchestrator,
    pub db: Database,
    pub events: EventStore,
    pub artifacts: ArtifactStore,
    _dir: tempfile::TempDir,
}

pub fn test_settings() -> Settings {
    Settings {
        run_timeout: Duration::from_secs(2),
        worker_timeout: Duration::from_secs(2),
        roundabout_poll_interval: Duration::from_millis(10),
        decision_mode: DecisionMode::Heuristic,
        ..Settings::default()
    }
}

pub fn harness(provider: Arc<dyn Provider>) -> TestHarness {
    harness_with_settings(provider, test_settings())
}

pub fn harness_with_settings(provider: Arc<dyn Provider>, settings: Settings) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new();
    let events = EventStore::new();
    let artifacts = ArtifactStore::new(&dir.path().join("workers"));
    let tool_outputs = ToolOutputStore::new(dir.path());

    let registry = ToolRegistry::build(
        vec![
            Arc::new(CurrentTimeTool),
            Arc::new(GetToolOutputTool::new(tool_outputs.clone())),
        ],
        vec![
            Arc::new(SpawnWorkerTool),
            Arc::new(ListWorkersTool::new(db.clone())),
            Arc::new(ReadWorkerResultTool::new(db.clone(), artifacts.clone())),
            Arc::new(GetWorkerMetadataTool::new(db.clone(), artifacts.clone())),
            Arc::new(WaitForWorkerTool::new(
                db.clone(),
                events.clone(),
                artifacts.clone(),
                Arc::clone(&provider),
                Arc::new(settings.clone()),
                "default-model",
            )),
        ],
    )
    .unwrap();
    let resolver = ToolResolver::from_registry(&registry);

    let orch = Orchestrator::new(
        provider,
        resolver,
        db.clone(),
        events.clone(),
        artifacts.clone(),
        tool_outputs,
        settings,
        "default-model",
    );
    TestHarness {
        orch,
        db,
        events,
        artifacts,
        _dir: dir,
    }
}

/// Poll until the run reaches the status, panicking after five seconds.
pub async fn wait_for_run_status(db: &Database, run_id: RunId, status: RunStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(run) = db.get_run(run_id).await {
            if run.status == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} stuck in {:?}, wanted {status:?}",
                run.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
