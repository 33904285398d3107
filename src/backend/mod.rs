pub mod auth;
pub mod cloud_run;
pub mod gcloud;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MonitorConfig;
use crate::error::AppError;

// =============================================================================
// JobRef / ExecutionDescriptor
// =============================================================================

/// The single Cloud Run job this process monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub project: String,
    pub region: String,
    pub name: String,
}

impl JobRef {
    /// Fully-qualified resource name, e.g. `projects/p/locations/r/jobs/j`.
    pub fn resource_name(&self) -> String {
        format!(
            "projects/{}/locations/{}/jobs/{}",
            self.project, self.region, self.name
        )
    }
}

/// One run instance of the job. Active while `completion_time` is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDescriptor {
    pub id: String,
    pub create_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl ExecutionDescriptor {
    pub fn is_active(&self) -> bool {
        self.completion_time.is_none()
    }
}

/// A log record exactly as the backend returned it (a Cloud Logging
/// `LogEntry` object, or occasionally a bare string).
pub type RawLogRecord = serde_json::Value;

/// Last path segment of a resource name (`.../executions/abc` -> `abc`).
pub fn short_id(resource_name: &str) -> &str {
    resource_name
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(resource_name)
}

/// Cloud Logging filter scoped to one execution's stdout/stderr.
pub fn log_filter(job: &JobRef, execution_id: &str, since: Option<DateTime<Utc>>) -> String {
    let mut filter = format!(
        "resource.type=\"cloud_run_job\" AND resource.labels.job_name=\"{}\" AND resource.labels.location=\"{}\" AND labels.\"run.googleapis.com/execution_name\"=\"{}\"",
        job.name, job.region, execution_id
    );
    if let Some(since) = since {
        filter.push_str(&format!(
            " AND timestamp > \"{}\"",
            since.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        ));
    }
    filter.push_str(&format!(
        " AND (logName=\"projects/{p}/logs/run.googleapis.com%2Fstdout\" OR logName=\"projects/{p}/logs/run.googleapis.com%2Fstderr\")",
        p = job.project
    ));
    filter
}

// =============================================================================
// ExecutionBackend trait
// =============================================================================

/// Abstraction over the two ways of talking to Cloud Run.
///
/// Both implementations honour the same output contract so the status
/// resolver and trigger guard never know which one is in use.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;

    /// List recent executions of `job`. Order is unspecified; callers sort.
    async fn list_executions(&self, job: &JobRef) -> Result<Vec<ExecutionDescriptor>, AppError>;

    /// Fetch up to `limit` raw log records for one execution, newest first,
    /// optionally only those strictly after `since`.
    async fn get_logs(
        &self,
        job: &JobRef,
        execution_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawLogRecord>, AppError>;

    /// Start a new execution and return the backend's operation id.
    async fn run_job(&self, job: &JobRef) -> Result<String, AppError>;
}

// =============================================================================
// BackendKind + factory
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Managed REST API (production).
    CloudRun,
    /// Local `gcloud` CLI (developer machines, Windows).
    Gcloud,
}

impl BackendKind {
    /// An explicit override always wins; otherwise Windows defaults to the
    /// CLI and everything else to the managed API.
    pub fn select(use_gcloud_cli: Option<bool>, is_windows: bool) -> Self {
        match use_gcloud_cli {
            Some(true) => BackendKind::Gcloud,
            Some(false) => BackendKind::CloudRun,
            None if is_windows => BackendKind::Gcloud,
            None => BackendKind::CloudRun,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::select(config.use_gcloud_cli, cfg!(windows))
    }

    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::CloudRun => "Native API (Production)",
            BackendKind::Gcloud => "Local CLI (gcloud)",
        }
    }
}

/// Create the backend for `kind`. Called once at startup; the result is
/// shared immutably for the life of the process.
pub fn build_backend(
    kind: BackendKind,
    config: &MonitorConfig,
) -> Result<Arc<dyn ExecutionBackend>, AppError> {
    tracing::info!(strategy = kind.label(), "Execution backend selected");
    let backend: Arc<dyn ExecutionBackend> = match kind {
        BackendKind::CloudRun => {
            let tokens = auth::token_source_from_config(config)?;
            Arc::new(cloud_run::CloudRunBackend::new(config.endpoints.clone(), tokens)?)
        }
        BackendKind::Gcloud => Arc::new(gcloud::GcloudBackend::new(config.gcloud_path.clone())),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> JobRef {
        JobRef {
            project: "proj".into(),
            region: "europe-west2".into(),
            name: "nightly".into(),
        }
    }

    #[test]
    fn test_select_override_wins() {
        assert_eq!(BackendKind::select(Some(true), false), BackendKind::Gcloud);
        assert_eq!(BackendKind::select(Some(false), true), BackendKind::CloudRun);
    }

    #[test]
    fn test_select_platform_default() {
        assert_eq!(BackendKind::select(None, true), BackendKind::Gcloud);
        assert_eq!(BackendKind::select(None, false), BackendKind::CloudRun);
    }

    #[test]
    fn test_resource_name() {
        assert_eq!(
            job().resource_name(),
            "projects/proj/locations/europe-west2/jobs/nightly"
        );
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("namespaces/p/executions/nightly-abc12"), "nightly-abc12");
        assert_eq!(short_id("plain"), "plain");
        assert_eq!(short_id("trailing/"), "trailing/");
    }

    #[test]
    fn test_log_filter_without_since() {
        let filter = log_filter(&job(), "nightly-x1", None);
        assert!(filter.contains("resource.labels.job_name=\"nightly\""));
        assert!(filter.contains("labels.\"run.googleapis.com/execution_name\"=\"nightly-x1\""));
        assert!(filter.contains("projects/proj/logs/run.googleapis.com%2Fstderr"));
        assert!(!filter.contains("timestamp >"));
    }

    #[test]
    fn test_log_filter_with_since() {
        let since = Utc.with_ymd_and_hms(2026, 1, 2, 10, 0, 0).unwrap();
        let filter = log_filter(&job(), "nightly-x1", Some(since));
        assert!(filter.contains("timestamp > \"2026-01-02T10:00:00Z\""));
    }

    #[test]
    fn test_log_filter_keeps_sub_millisecond_since() {
        let since: DateTime<Utc> = "2026-01-02T10:00:00.123456789Z".parse().unwrap();
        let filter = log_filter(&job(), "nightly-x1", Some(since));
        assert!(filter.contains("timestamp > \"2026-01-02T10:00:00.123456789Z\""), "{filter}");
    }

    #[test]
    fn test_execution_activity() {
        let created = Utc.with_ymd_and_hms(2026, 1, 2, 10, 0, 0).unwrap();
        let running = ExecutionDescriptor { id: "a".into(), create_time: created, completion_time: None };
        let done = ExecutionDescriptor { completion_time: Some(created), ..running.clone() };
        assert!(running.is_active());
        assert!(!done.is_active());
    }
}
