//! Immutable tool resolver with allowlist filtering and test stubs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::registry::{ToolDyn, ToolFuture, ToolRegistry};

/// Errors from tool resolution and execution.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ToolError {
    /// The requested tool was not found.
    #[error("unknown tool: {0}")]
    NotFound(String),

    /// Tool execution failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The input provided to the tool was invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Stubs were requested outside of test mode.
    #[error("tool stubs are only permitted in test mode")]
    StubsForbidden,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A stub function consulted before the real tool.
///
/// Returns `Some(result)` to short-circuit the call, `None` to fall
/// through to the wrapped tool.
pub type StubMatcher =
    Arc<dyn Fn(&str, &serde_json::Value) -> Option<serde_json::Value> + Send + Sync>;

/// Immutable resolver with pre-computed name lookups.
///
/// Built once from the registry, then shared read-only across every run.
/// Allowlist filtering supports exact names and `prefix*` wildcards.
#[derive(Clone)]
pub struct ToolResolver {
    by_name: Arc<HashMap<String, Arc<dyn ToolDyn>>>,
    all: Arc<Vec<Arc<dyn ToolDyn>>>,
}

impl std::fmt::Debug for ToolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolResolver")
            .field("by_name", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolResolver {
    /// Build a resolver from the registry.
    #[must_use]
    pub fn from_registry(registry: &ToolRegistry) -> Self {
        let all: Vec<Arc<dyn ToolDyn>> = registry.all().map(Arc::clone).collect();
        let by_name = all
            .iter()
            .map(|tool| (tool.name().to_string(), Arc::clone(tool)))
            .collect();
        Self {
            by_name: Arc::new(by_name),
            all: Arc::new(all),
        }
    }

    /// Look up a single tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolDyn>> {
        self.by_name.get(name).map(Arc::clone)
    }

    /// Whether the tool exists.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All tools, unfiltered.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn ToolDyn>> {
        self.all.as_ref().clone()
    }

    /// Resolve names, failing fast on the first unknown one.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] for an unknown name.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn ToolDyn>>, ToolError> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| ToolError::NotFound(name.clone()))
            })
            .collect()
    }

    /// Filter tools by an allowlist. `None` means all tools; each pattern
    /// is either an exact name or a `prefix*` wildcard.
    #[must_use]
    pub fn filter_by_allowlist(&self, allowed: Option<&[String]>) -> Vec<Arc<dyn ToolDyn>> {
        let Some(patterns) = allowed else {
            return self.all();
        };

        let mut seen: HashSet<&str> = HashSet::new();
        let mut result = Vec::new();
        for pattern in patterns {
            if let Some(prefix) = pattern.strip_suffix('*') {
                for tool in self.all.iter() {
                    if tool.name().starts_with(prefix) && seen.insert(tool.name()) {
                        result.push(Arc::clone(tool));
                    }
                }
            } else if let Some(tool) = self.by_name.get(pattern) {
                if seen.insert(tool.name()) {
                    result.push(Arc::clone(tool));
                }
            }
        }
        result
    }

    /// Build a resolver with selected tools wrapped by a stub.
    ///
    /// The stub runs before the real tool and may short-circuit with its
    /// own result. Only tools named in `stubbed_names` are wrapped; the
    /// rest pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::StubsForbidden`] unless `test_mode` is set.
    pub fn with_stubs(
        &self,
        matcher: StubMatcher,
        stubbed_names: &HashSet<String>,
        test_mode: bool,
    ) -> Result<Self, ToolError> {
        if !test_mode {
            return Err(ToolError::StubsForbidden);
        }

        let all: Vec<Arc<dyn ToolDyn>> = self
            .all
            .iter()
            .map(|tool| {
                if stubbed_names.contains(tool.name()) {
                    Arc::new(StubbedTool {
                        inner: Arc::clone(tool),
                        matcher: Arc::clone(&matcher),
                    }) as Arc<dyn ToolDyn>
                } else {
                    Arc::clone(tool)
                }
            })
            .collect();

        let by_name = all
            .iter()
            .map(|tool| (tool.name().to_string(), Arc::clone(tool)))
            .collect();

        Ok(Self {
            by_name: Arc::new(by_name),
            all: Arc::new(all),
        })
    }
}

/// A tool wrapped by a stub matcher. Constructed once at resolver build
/// time, not per call.
struct StubbedTool {
    inner: Arc<dyn ToolDyn>,
    matcher: StubMatcher,
}

impl ToolDyn for StubbedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> serde_json::Value {
        self.inner.input_schema()
    }

    fn call(&self, input: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            if let Some(stubbed) = (self.matcher)(self.inner.name(), &input) {
                return Ok(stubbed);
            }
            self.inner.call(input).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NamedTool(&'static str);

    impl ToolDyn for NamedTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn call(&self, _input: serde_json::Value) -> ToolFuture<'_> {
            let name = self.0;
            Box::pin(async move { Ok(json!({"ran": name})) })
        }
    }

    fn resolver() -> ToolResolver {
        let registry = ToolRegistry::build(
            vec![
                Arc::new(NamedTool("web_search")),
                Arc::new(NamedTool("web_fetch")),
                Arc::new(NamedTool("spawn_worker")),
            ],
            vec![],
        )
        .unwrap();
        ToolResolver::from_registry(&registry)
    }

    #[test]
    fn allowlist_none_returns_all() {
        assert_eq!(resolver().filter_by_allowlist(None).len(), 3);
    }

    #[test]
    fn allowlist_exact_and_wildcard() {
        let resolver = resolver();
        let filtered =
            resolver.filter_by_allowlist(Some(&["spawn_worker".to_string(), "web_*".to_string()]));
        let mut names: Vec<&str> = filtered.iter().map(|t| t.name()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["spawn_worker", "web_fetch", "web_search"]);
    }

    #[test]
    fn allowlist_unknown_names_are_skipped() {
        let filtered = resolver().filter_by_allowlist(Some(&["nope".to_string()]));
        assert!(filtered.is_empty());
    }

    #[test]
    fn resolve_fails_fast_on_unknown() {
        let result = resolver().resolve(&["web_search".to_string(), "nope".to_string()]);
        assert!(
            matches!(result, Err(ToolError::NotFound(ref name)) if name == "nope"),
            "expected NotFound(\"nope\")"
        );
    }

    #[test]
    fn stubs_rejected_outside_test_mode() {
        let matcher: StubMatcher = Arc::new(|_, _| None);
        let err = resolver()
            .with_stubs(matcher, &HashSet::new(), false)
            .unwrap_err();
        assert!(matches!(err, ToolError::StubsForbidden));
    }

    #[tokio::test]
    async fn stub_short_circuits_only_named_tools() {
        let matcher: StubMatcher = Arc::new(|name, _args| {
            if name == "web_search" {
                Some(json!({"stubbed": true}))
            } else {
                None
            }
        });
        let stubbed_names: HashSet<String> =
            ["web_search".to_string(), "web_fetch".to_string()].into();
        let stubbed = resolver().with_stubs(matcher, &stubbed_names, true).unwrap();

        let search = stubbed.get("web_search").unwrap();
        assert_eq!(search.call(json!({})).await.unwrap(), json!({"stubbed": true}));

        // Matcher returns None for web_fetch, so the real tool runs.
        let fetch = stubbed.get("web_fetch").unwrap();
        assert_eq!(fetch.call(json!({})).await.unwrap(), json!({"ran": "web_fetch"}));

        // spawn_worker was not wrapped at all.
        let spawn = stubbed.get("spawn_worker").unwrap();
        assert_eq!(spawn.call(json!({})).await.unwrap(), json!({"ran": "spawn_worker"}));
    }
}
