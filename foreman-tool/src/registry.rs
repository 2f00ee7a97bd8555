//! Object-safe tool trait and the startup-time registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::resolver::ToolError;

/// Boxed future returned by [`ToolDyn::call`].
pub type ToolFuture<'a> =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + 'a>>;

/// Object-safe trait for tool implementations.
///
/// Any tool source (local function, connector, artifact reader) implements
/// this trait. Tools are stored as `Arc<dyn ToolDyn>` in [`ToolRegistry`].
/// Structured errors should be returned as `{ok: false, user_message: …}`
/// rather than raised; see [`crate::envelope`].
pub trait ToolDyn: Send + Sync {
    /// The tool's unique name.
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    fn call(&self, input: serde_json::Value) -> ToolFuture<'_>;
}

/// Errors from registry construction.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two tools were registered under the same name.
    #[error("duplicate tool name: {0}")]
    Duplicate(String),
}

/// Registry of all tools known to the process.
///
/// Built once at startup by merging the built-in list with runtime
/// registrations; duplicate names fail construction. Read-only afterwards.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolDyn>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Build a registry from built-in and runtime-registered sources.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if any two tools share a name.
    pub fn build(
        builtins: Vec<Arc<dyn ToolDyn>>,
        registered: Vec<Arc<dyn ToolDyn>>,
    ) -> Result<Self, RegistryError> {
        let mut tools: HashMap<String, Arc<dyn ToolDyn>> = HashMap::new();
        for tool in builtins.into_iter().chain(registered) {
            let name = tool.name().to_string();
            if tools.insert(name.clone(), tool).is_some() {
                return Err(RegistryError::Duplicate(name));
            }
        }
        Ok(Self { tools })
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolDyn>> {
        self.tools.get(name)
    }

    /// Iterate over all registered tools.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ToolDyn>> {
        self.tools.values()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
