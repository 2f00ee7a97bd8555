//! Out-of-band storage for oversized tool outputs.

use std::path::PathBuf;

use foreman_tool::{ToolDyn, ToolError, ToolFuture};
use foreman_types::OwnerId;
use serde_json::Value;
use uuid::Uuid;

use crate::bundle::ArtifactError;

/// Render the inline reference marker for an externalized output.
#[must_use]
pub fn format_marker(artifact_id: &str, tool_name: &str, bytes: usize) -> String {
    format!("[TOOL_OUTPUT:artifact_id={artifact_id},tool={tool_name},bytes={bytes}]")
}

/// Owner-scoped store for tool outputs too large to keep inline.
///
/// Outputs live at `<base>/tool_outputs/<owner>/<artifact_id>`; the
/// owner directory boundary is the access-control boundary.
#[derive(Clone)]
pub struct ToolOutputStore {
    base: PathBuf,
}

impl ToolOutputStore {
    /// Create a store rooted at `base`.
    #[must_use]
    pub fn new(base: &std::path::Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    fn owner_dir(&self, owner_id: OwnerId) -> PathBuf {
        self.base.join("tool_outputs").join(owner_id.to_string())
    }

    /// Store one output and return its generated artifact id.
    pub async fn save_output(
        &self,
        owner_id: OwnerId,
        content: &str,
    ) -> Result<String, ArtifactError> {
        let artifact_id = Uuid::new_v4().simple().to_string();
        let dir = self.owner_dir(owner_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&artifact_id), content).await?;
        Ok(artifact_id)
    }

    /// Load one output. Scoped to the owner: an id stored for another
    /// owner is simply not found.
    pub async fn load_output(
        &self,
        owner_id: OwnerId,
        artifact_id: &str,
    ) -> Result<String, ArtifactError> {
        // Reject path separators so an id can never escape the owner dir.
        if artifact_id.contains('/') || artifact_id.contains('\\') || artifact_id.contains("..") {
            return Err(ArtifactError::NotFound(artifact_id.to_string()));
        }
        let path = self.owner_dir(owner_id).join(artifact_id);
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound(artifact_id.to_string())
            } else {
                ArtifactError::Io(e)
            }
        })
    }
}

/// Fetches a stored tool output by artifact id.
///
/// The engine injects `_owner_id` into the arguments before dispatch,
/// the same way it injects `_tool_call_id` into spawn calls; the model
/// only supplies `artifact_id`.
pub struct GetToolOutputTool {
    store: ToolOutputStore,
}

impl GetToolOutputTool {
    /// Tool name, also used by the engine for the externalization
    /// exemption.
    pub const NAME: &'static str = "get_tool_output";

    /// Create the tool over a store.
    #[must_use]
    pub fn new(store: ToolOutputStore) -> Self {
        Self { store }
    }
}

impl ToolDyn for GetToolOutputTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Fetch the full content of a tool output that was stored out of band."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "artifact_id": {
                    "type": "string",
                    "description": "Artifact id from a [TOOL_OUTPUT:…] marker"
                }
            },
            "required": ["artifact_id"]
        })
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let artifact_id = input
                .get("artifact_id")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidInput("artifact_id is required".into()))?;
            let owner_id = input
                .get("_owner_id")
                .and_then(Value::as_i64)
                .ok_or_else(|| ToolError::InvalidInput("no owner context".into()))?;
            let content = self
                .store
                .load_output(OwnerId::new(owner_id), artifact_id)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            Ok(Value::String(content))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_and_load_are_owner_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolOutputStore::new(dir.path());

        let artifact_id = store
            .save_output(OwnerId::new(1), "big output")
            .await
            .unwrap();
        assert_eq!(
            store.load_output(OwnerId::new(1), &artifact_id).await.unwrap(),
            "big output"
        );
        // Another owner cannot read it.
        let err = store.load_output(OwnerId::new(2), &artifact_id).await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[tokio::test]
    async fn path_escapes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolOutputStore::new(dir.path());
        let err = store
            .load_output(OwnerId::new(1), "../2/secret")
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[test]
    fn marker_has_the_fixed_format() {
        assert_eq!(
            format_marker("abc123", "ssh_exec", 200_000),
            "[TOOL_OUTPUT:artifact_id=abc123,tool=ssh_exec,bytes=200000]"
        );
    }

    #[tokio::test]
    async fn tool_fetches_by_artifact_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolOutputStore::new(dir.path());
        let artifact_id = store.save_output(OwnerId::new(5), "contents").await.unwrap();

        let tool = GetToolOutputTool::new(store);
        let result = tool
            .call(json!({"artifact_id": artifact_id, "_owner_id": 5}))
            .await
            .unwrap();
        assert_eq!(result, Value::String("contents".into()));

        let err = tool.call(json!({"artifact_id": "nope", "_owner_id": 5})).await;
        assert!(err.is_err());
    }
}
