//! The shared orchestrator handle.

use std::sync::Arc;

use foreman_artifacts::{ArtifactError, ArtifactStore, ToolOutputStore};
use foreman_provider::{Provider, ProviderError};
use foreman_react::{EngineError, ReactEngine};
use foreman_store::{Database, StoreError};
use foreman_tool::ToolResolver;
use foreman_types::Settings;
use thiserror::Error;

/// Errors from orchestration.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OrchError {
    /// Engine failure (fails the run).
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Store failure on a primary path.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Artifact failure on a primary path.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Provider failure outside the engine (summary extraction).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Message array builder misuse.
    #[error("builder: {0}")]
    Builder(String),

    /// The referenced entity is missing or in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Cloneable handle over every shared dependency of the orchestration
/// layer. All fields are cheap clones of shared state.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) db: Database,
    pub(crate) events: foreman_events::EventStore,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) resolver: ToolResolver,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) engine: ReactEngine,
    pub(crate) settings: Arc<Settings>,
    pub(crate) default_model: String,
}

impl Orchestrator {
    /// Wire an orchestrator over its dependencies.
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        resolver: ToolResolver,
        db: Database,
        events: foreman_events::EventStore,
        artifacts: ArtifactStore,
        tool_outputs: ToolOutputStore,
        settings: Settings,
        default_model: impl Into<String>,
    ) -> Self {
        let settings = Arc::new(settings);
        let engine = ReactEngine::new(
            Arc::clone(&provider),
            db.clone(),
            artifacts.clone(),
            tool_outputs,
            Arc::clone(&settings),
        );
        Self {
            db,
            events,
            artifacts,
            resolver,
            provider,
            engine,
            settings,
            default_model: default_model.into(),
        }
    }

    /// The database handle.
    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// The event store.
    #[must_use]
    pub fn events(&self) -> &foreman_events::EventStore {
        &self.events
    }

    /// The artifact store.
    #[must_use]
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// The shared settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
