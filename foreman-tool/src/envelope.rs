//! Result conventions shared by the engine and emitters.
//!
//! Tools return either plain text, a JSON envelope `{ok, data, error,
//! user_message}`, or raise. The helpers here classify error bodies,
//! decide which errors are critical, redact sensitive argument keys, and
//! produce previews for events.

use serde_json::Value;

/// Marker wrapped around tool exceptions surfaced inline.
pub const TOOL_ERROR_MARKER: &str = "<tool-error>";

/// Argument keys whose values are redacted before previews are emitted.
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "password",
    "secret",
    "authorization",
    "credential",
    "credentials",
    "private_key",
];

/// Substrings that classify a tool error as critical. Critical errors
/// mark the run context so the outer runner can fail fast.
const CRITICAL_ERROR_MARKERS: &[&str] = &[
    "unauthorized",
    "401",
    "invalid api key",
    "invalid_api_key",
    "authentication failed",
    "permission denied",
    "forbidden",
    "account suspended",
    "service permanently unavailable",
];

/// Classify a raw tool result string.
///
/// Returns `Some(error_message)` when the result is an error: either a
/// `<tool-error>` body or a JSON envelope with `ok == false` (whose
/// `user_message`/`error` field becomes the message).
#[must_use]
pub fn check_tool_error(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with(TOOL_ERROR_MARKER) {
        let body = trimmed
            .trim_start_matches(TOOL_ERROR_MARKER)
            .trim_end_matches("</tool-error>")
            .trim();
        return Some(body.to_string());
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        if map.get("ok").and_then(Value::as_bool) == Some(false) {
            let message = map
                .get("user_message")
                .or_else(|| map.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("tool returned ok=false");
            return Some(message.to_string());
        }
    }

    None
}

/// Whether a tool error should fail the whole run.
///
/// Fixed predicate over tool name + error text: auth failures and
/// permanent upstream outages are critical; everything else is a normal
/// inline tool error the loop can continue past.
#[must_use]
pub fn is_critical_tool_error(tool_name: &str, error: &str) -> bool {
    // Spawn bookkeeping failures are handled by the barrier path, never
    // via the critical-error override.
    if tool_name == "spawn_worker" {
        return false;
    }
    let lowered = error.to_lowercase();
    CRITICAL_ERROR_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Redact sensitive keys from tool arguments before preview/storage.
///
/// Recurses into nested objects; arrays are passed through element-wise.
#[must_use]
pub fn redact_sensitive_args(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let redacted = map
                .iter()
                .map(|(key, value)| {
                    let lowered = key.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|s| lowered.contains(s)) {
                        (key.clone(), Value::String("[REDACTED]".into()))
                    } else {
                        (key.clone(), redact_sensitive_args(value))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_args).collect()),
        other => other.clone(),
    }
}

/// Truncate a string to a preview on a char boundary.
#[must_use]
pub fn safe_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}

/// Default preview length for tool args/results in events.
pub const DEFAULT_PREVIEW_CHARS: usize = 300;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_tool_error_marker() {
        assert_eq!(
            check_tool_error("<tool-error> boom </tool-error>"),
            Some("boom".to_string())
        );
        assert_eq!(check_tool_error("all good"), None);
    }

    #[test]
    fn detects_ok_false_envelope() {
        let raw = r#"{"ok": false, "user_message": "ssh key rejected"}"#;
        assert_eq!(check_tool_error(raw), Some("ssh key rejected".to_string()));

        let raw = r#"{"ok": true, "data": {"exit_code": 0}}"#;
        assert_eq!(check_tool_error(raw), None);

        let raw = r#"{"ok": false, "error": "timeout"}"#;
        assert_eq!(check_tool_error(raw), Some("timeout".to_string()));
    }

    #[test]
    fn critical_predicate_matches_auth_failures() {
        assert!(is_critical_tool_error("http_request", "401 Unauthorized"));
        assert!(is_critical_tool_error("ssh_exec", "Permission denied (publickey)"));
        assert!(!is_critical_tool_error("ssh_exec", "connection reset by peer"));
        // spawn bookkeeping errors never fail the run via this path
        assert!(!is_critical_tool_error("spawn_worker", "401 Unauthorized"));
    }

    #[test]
    fn redacts_sensitive_keys_recursively() {
        let args = json!({
            "url": "https://example.com",
            "api_key": "sk-secret",
            "nested": {"password": "hunter2", "user": "alice"},
        });
        let redacted = redact_sensitive_args(&args);
        assert_eq!(redacted["api_key"], "[REDACTED]");
        assert_eq!(redacted["nested"]["password"], "[REDACTED]");
        assert_eq!(redacted["nested"]["user"], "alice");
        assert_eq!(redacted["url"], "https://example.com");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(safe_preview("short", 300), "short");
        let long = "x".repeat(400);
        let preview = safe_preview(&long, 300);
        assert_eq!(preview.chars().count(), 300);
        assert!(preview.ends_with('…'));
        // Multi-byte content must not panic
        let emoji = "🎉".repeat(100);
        let _ = safe_preview(&emoji, 10);
    }
}
