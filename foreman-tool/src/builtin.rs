//! Built-in utility tools available to every agent.

use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use crate::registry::{ToolDyn, ToolFuture};
use crate::resolver::ToolError;

/// Arguments for [`CurrentTimeTool`].
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CurrentTimeArgs {
    /// Optional strftime-style format; defaults to RFC 3339.
    #[serde(default)]
    pub format: Option<String>,
}

/// Returns the current UTC time.
pub struct CurrentTimeTool;

impl ToolDyn for CurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC."
    }

    fn input_schema(&self) -> serde_json::Value {
        schema_for::<CurrentTimeArgs>()
    }

    fn call(&self, input: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: CurrentTimeArgs = serde_json::from_value(input)
                .map_err(|e| ToolError::InvalidInput(e.to_string()))?;
            let now = Utc::now();
            let rendered = match args.format.as_deref() {
                Some(format) => now.format(format).to_string(),
                None => now.to_rfc3339(),
            };
            Ok(json!({"ok": true, "data": {"now": rendered}}))
        })
    }
}

/// Derive a JSON Schema value for a tool argument struct.
pub fn schema_for<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_time_returns_ok_envelope() {
        let result = CurrentTimeTool.call(json!({})).await.unwrap();
        assert_eq!(result["ok"], true);
        assert!(result["data"]["now"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn current_time_honors_format() {
        let result = CurrentTimeTool
            .call(json!({"format": "%Y"}))
            .await
            .unwrap();
        let year = result["data"]["now"].as_str().unwrap();
        assert_eq!(year.len(), 4);
    }

    #[test]
    fn schema_is_object() {
        let schema = CurrentTimeTool.input_schema();
        assert!(schema.is_object());
    }
}
