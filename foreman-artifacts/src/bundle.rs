//! Per-worker artifact bundles.
//!
//! Directory layout:
//! ```text
//! <base>/<worker_id>/
//!    config.json
//!    status.json
//!    messages.jsonl
//!    tool_calls/NNN_<tool>.txt
//!    result.txt
//!    summary.json
//!    monitoring/check_NNNNs.json
//!    metrics.jsonl
//! ```
//! Bundles are append-only within a worker's lifetime and owner-scoped
//! via the job table; this store never reads across worker ids.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use foreman_types::WorkerId;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

/// Errors from artifact operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Filesystem failure.
    #[error("artifact io: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("artifact serialization: {0}")]
    Serialization(String),

    /// The referenced bundle or file does not exist.
    #[error("artifact not found: {0}")]
    NotFound(String),
}

/// System status of a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleStatus {
    /// created | running | success | failed
    pub status: String,
    /// When the bundle was created.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error message on failure.
    pub error: Option<String>,
}

/// Merged view of status.json + summary.json.
#[derive(Debug, Clone)]
pub struct WorkerMetadata {
    /// System status.
    pub status: BundleStatus,
    /// Compressed summary, when extracted.
    pub summary: Option<String>,
}

/// Execution metadata for one numbered tool call file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallIndexEntry {
    /// 1-based call order.
    pub sequence: u32,
    /// Tool name parsed from the filename.
    pub tool_name: String,
    /// File size in bytes.
    pub output_bytes: u64,
    /// Exit code when the output is an `{ok, data: {exit_code}}` envelope.
    pub exit_code: Option<i64>,
    /// Whether the envelope reported `ok: false` or a non-zero exit code.
    pub failed: bool,
}

/// Store for worker artifact bundles.
#[derive(Clone)]
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `base`. Directories are created lazily.
    #[must_use]
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    /// The directory of one bundle.
    #[must_use]
    pub fn worker_dir(&self, worker_id: &WorkerId) -> PathBuf {
        self.base.join(worker_id.as_str())
    }

    /// Create a fresh bundle for a task, returning the new worker id.
    pub async fn create_worker(&self, task: &str, config: &Value) -> Result<WorkerId, ArtifactError> {
        let worker_id = WorkerId::new(format!("worker-{}", Uuid::new_v4().simple()));
        let dir = self.worker_dir(&worker_id);
        tokio::fs::create_dir_all(dir.join("tool_calls")).await?;
        tokio::fs::create_dir_all(dir.join("monitoring")).await?;

        let config_body = json!({"task": task, "config": config});
        write_json(&dir.join("config.json"), &config_body).await?;

        let status = BundleStatus {
            status: "created".into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        write_json(&dir.join("status.json"), &status).await?;
        Ok(worker_id)
    }

    /// Mark a bundle as running.
    pub async fn start_worker(&self, worker_id: &WorkerId) -> Result<(), ArtifactError> {
        let mut status = self.read_status(worker_id).await?;
        status.status = "running".into();
        status.started_at = Some(Utc::now());
        write_json(&self.worker_dir(worker_id).join("status.json"), &status).await
    }

    /// Mark a bundle terminal. `status` is `success` or `failed`.
    pub async fn complete_worker(
        &self,
        worker_id: &WorkerId,
        status_name: &str,
        error: Option<&str>,
    ) -> Result<(), ArtifactError> {
        let mut status = self.read_status(worker_id).await?;
        status.status = status_name.into();
        status.finished_at = Some(Utc::now());
        status.error = error.map(str::to_string);
        write_json(&self.worker_dir(worker_id).join("status.json"), &status).await
    }

    /// Append one message to the conversation log.
    pub async fn save_message(
        &self,
        worker_id: &WorkerId,
        message: &Value,
    ) -> Result<(), ArtifactError> {
        append_jsonl(&self.worker_dir(worker_id).join("messages.jsonl"), message).await
    }

    /// Save one tool call output as a numbered file.
    pub async fn save_tool_output(
        &self,
        worker_id: &WorkerId,
        tool_name: &str,
        output: &str,
        sequence: u32,
    ) -> Result<(), ArtifactError> {
        let file = self
            .worker_dir(worker_id)
            .join("tool_calls")
            .join(format!("{sequence:03}_{tool_name}.txt"));
        tokio::fs::write(&file, output).await?;
        Ok(())
    }

    /// Save the final result text.
    pub async fn save_result(&self, worker_id: &WorkerId, result: &str) -> Result<(), ArtifactError> {
        tokio::fs::write(self.worker_dir(worker_id).join("result.txt"), result).await?;
        Ok(())
    }

    /// Read the final result text.
    pub async fn worker_result(&self, worker_id: &WorkerId) -> Result<String, ArtifactError> {
        let path = self.worker_dir(worker_id).join("result.txt");
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound(format!("{worker_id}/result.txt"))
            } else {
                ArtifactError::Io(e)
            }
        })
    }

    /// Write summary.json. Called only after the bundle status is marked.
    pub async fn update_summary(
        &self,
        worker_id: &WorkerId,
        summary: &str,
        meta: &Value,
    ) -> Result<(), ArtifactError> {
        let mut body = json!({"summary": summary});
        if let (Value::Object(target), Value::Object(extra)) = (&mut body, meta) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        write_json(&self.worker_dir(worker_id).join("summary.json"), &body).await
    }

    /// Merged status + summary view.
    pub async fn worker_metadata(&self, worker_id: &WorkerId) -> Result<WorkerMetadata, ArtifactError> {
        let status = self.read_status(worker_id).await?;
        let summary_path = self.worker_dir(worker_id).join("summary.json");
        let summary = match tokio::fs::read_to_string(&summary_path).await {
            Ok(body) => serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("summary").and_then(Value::as_str).map(str::to_string)),
            Err(_) => None,
        };
        Ok(WorkerMetadata { status, summary })
    }

    /// Write one monitoring snapshot, named by elapsed whole seconds.
    pub async fn save_monitoring_check(
        &self,
        worker_id: &WorkerId,
        elapsed_seconds: u64,
        data: &Value,
    ) -> Result<(), ArtifactError> {
        let file = self
            .worker_dir(worker_id)
            .join("monitoring")
            .join(format!("check_{elapsed_seconds:04}s.json"));
        write_json(&file, data).await
    }

    /// Append one metric record.
    pub async fn append_metric(&self, worker_id: &WorkerId, metric: &Value) -> Result<(), ArtifactError> {
        append_jsonl(&self.worker_dir(worker_id).join("metrics.jsonl"), metric).await
    }

    /// Execution metadata for every numbered tool call file, in order.
    pub async fn tool_call_index(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Vec<ToolCallIndexEntry>, ArtifactError> {
        let dir = self.worker_dir(worker_id).join("tool_calls");
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(ArtifactError::Io(e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((sequence, tool_name)) = parse_tool_file_name(name) else {
                tracing::warn!(file = name, "skipping malformed tool output filename");
                continue;
            };
            let output_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            let content = tokio::fs::read_to_string(entry.path()).await.unwrap_or_default();
            let (exit_code, failed) = extract_envelope_metadata(&content);
            entries.push(ToolCallIndexEntry {
                sequence,
                tool_name,
                output_bytes,
                exit_code,
                failed,
            });
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn read_status(&self, worker_id: &WorkerId) -> Result<BundleStatus, ArtifactError> {
        let path = self.worker_dir(worker_id).join("status.json");
        let body = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound(format!("{worker_id}/status.json"))
            } else {
                ArtifactError::Io(e)
            }
        })?;
        serde_json::from_str(&body).map_err(|e| ArtifactError::Serialization(e.to_string()))
    }
}

/// Parse `NNN_<tool>.txt` into (sequence, tool name).
fn parse_tool_file_name(name: &str) -> Option<(u32, String)> {
    let stem = name.strip_suffix(".txt")?;
    let (seq, tool) = stem.split_once('_')?;
    let sequence = seq.parse().ok()?;
    Some((sequence, tool.to_string()))
}

/// Extract exit code + failure flag from an `{ok, data}` envelope.
/// Non-JSON output is assumed not failed.
fn extract_envelope_metadata(content: &str) -> (Option<i64>, bool) {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return (None, false);
    };
    if value.get("ok").and_then(Value::as_bool) == Some(false) {
        return (None, true);
    }
    let exit_code = value
        .get("data")
        .and_then(|d| d.get("exit_code"))
        .and_then(Value::as_i64);
    match exit_code {
        Some(code) => (Some(code), code != 0),
        None => (None, false),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| ArtifactError::Serialization(e.to_string()))?;
    tokio::fs::write(path, body).await?;
    Ok(())
}

async fn append_jsonl(path: &Path, value: &Value) -> Result<(), ArtifactError> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| ArtifactError::Serialization(e.to_string()))?;
    line.push('\n');
    let existing = tokio::fs::read_to_string(path).await.unwrap_or_default();
    tokio::fs::write(path, existing + &line).await?;
    Ok(())
}
