use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use super::{log_filter, short_id, ExecutionBackend, ExecutionDescriptor, JobRef, RawLogRecord};
use crate::error::AppError;

/// How many recent executions to ask gcloud for. The newest active one is
/// always among the most recent.
const EXECUTION_LIST_LIMIT: u32 = 5;

#[cfg(windows)]
const DEFAULT_BINARY: &str = "gcloud.cmd";
#[cfg(not(windows))]
const DEFAULT_BINARY: &str = "gcloud";

// ============================================================================
// gcloud JSON shapes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionMetadata {
    name: Option<String>,
    creation_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionStatus {
    completion_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CliExecution {
    #[serde(default)]
    metadata: ExecutionMetadata,
    #[serde(default)]
    status: ExecutionStatus,
}

fn parse_time(value: &str, raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::malformed(format!("Invalid timestamp '{value}': {e}"), raw))
}

/// Parse `gcloud run jobs executions list --format=json` output.
pub fn parse_executions(stdout: &str) -> Result<Vec<ExecutionDescriptor>, AppError> {
    let text = if stdout.trim().is_empty() { "[]" } else { stdout };
    let executions: Vec<CliExecution> = serde_json::from_str(text).map_err(|e| {
        tracing::error!(first_chars = %stdout.chars().take(500).collect::<String>(), "gcloud executions JSON parse error");
        AppError::malformed(format!("Failed to parse executions list from gcloud: {e}"), stdout)
    })?;

    executions
        .into_iter()
        .map(|e| {
            let name = e.metadata.name.unwrap_or_else(|| "unknown".into());
            let create_time = match e.metadata.creation_timestamp.as_deref() {
                Some(t) => parse_time(t, stdout)?,
                None => DateTime::<Utc>::UNIX_EPOCH,
            };
            let completion_time = match e.status.completion_time.as_deref() {
                Some(t) => Some(parse_time(t, stdout)?),
                None => None,
            };
            Ok(ExecutionDescriptor {
                id: short_id(&name).to_string(),
                create_time,
                completion_time,
            })
        })
        .collect()
}

/// Parse `gcloud logging read --format=json` output.
pub fn parse_log_entries(stdout: &str) -> Result<Vec<RawLogRecord>, AppError> {
    let text = if stdout.trim().is_empty() { "[]" } else { stdout };
    serde_json::from_str(text)
        .map_err(|e| AppError::malformed(format!("Failed to parse log entries from gcloud: {e}"), stdout))
}

/// Parse `gcloud run jobs execute --format=json` output into the short
/// execution id.
pub fn parse_operation(stdout: &str) -> Result<String, AppError> {
    let text = if stdout.trim().is_empty() { "{}" } else { stdout };
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| AppError::malformed(format!("Failed to parse gcloud execute output: {e}"), stdout))?;
    value
        .pointer("/metadata/name")
        .and_then(|n| n.as_str())
        .map(|n| short_id(n).to_string())
        .ok_or_else(|| AppError::malformed("gcloud execute output has no metadata.name", stdout))
}

// ============================================================================
// GcloudBackend
// ============================================================================

/// Fronts the `gcloud` CLI. Used where the managed API is unavailable or
/// slow to authenticate (developer machines, Windows).
pub struct GcloudBackend {
    binary: String,
}

impl GcloudBackend {
    pub fn new(binary: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| DEFAULT_BINARY.to_string()),
        }
    }

    /// Run gcloud with `args` and return stdout. Non-zero exit is an error
    /// carrying stderr (or stdout when stderr is empty).
    async fn run(&self, args: &[String]) -> Result<String, AppError> {
        tracing::debug!(binary = %self.binary, args = ?args, "Running gcloud");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // On Windows, use CREATE_NO_WINDOW flag to prevent console window popup
        #[cfg(windows)]
        {
            #[allow(unused_imports)]
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::ProcessSpawn(format!(
                    "{} not found. Install the Google Cloud SDK or set GCLOUD_PATH.",
                    self.binary
                ))
            } else {
                AppError::ProcessSpawn(format!("Failed to spawn {}: {e}", self.binary))
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        tracing::debug!(
            code = ?output.status.code(),
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "gcloud exited"
        );

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(AppError::Backend(format!(
                "gcloud failed (code {}): {}",
                output.status.code().map_or("signal".to_string(), |c| c.to_string()),
                detail.trim()
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl ExecutionBackend for GcloudBackend {
    fn name(&self) -> &'static str {
        "gcloud"
    }

    async fn list_executions(&self, job: &JobRef) -> Result<Vec<ExecutionDescriptor>, AppError> {
        let stdout = self
            .run(&[
                "run".into(),
                "jobs".into(),
                "executions".into(),
                "list".into(),
                format!("--job={}", job.name),
                format!("--region={}", job.region),
                format!("--project={}", job.project),
                "--format=json".into(),
                format!("--limit={EXECUTION_LIST_LIMIT}"),
                "--sort-by=~creationTimestamp".into(),
            ])
            .await?;
        parse_executions(&stdout)
    }

    async fn get_logs(
        &self,
        job: &JobRef,
        execution_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawLogRecord>, AppError> {
        let stdout = self
            .run(&[
                "logging".into(),
                "read".into(),
                log_filter(job, execution_id, since),
                format!("--project={}", job.project),
                "--format=json".into(),
                format!("--limit={limit}"),
                "--order=desc".into(),
                "--freshness=24h".into(),
            ])
            .await?;
        parse_log_entries(&stdout)
    }

    async fn run_job(&self, job: &JobRef) -> Result<String, AppError> {
        tracing::info!(job = %job.name, "Triggering job via gcloud");
        let stdout = self
            .run(&[
                "run".into(),
                "jobs".into(),
                "execute".into(),
                job.name.clone(),
                format!("--region={}", job.region),
                format!("--project={}", job.project),
                "--format=json".into(),
            ])
            .await?;
        parse_operation(&stdout)
    }
}
