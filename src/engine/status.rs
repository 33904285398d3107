use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::logs::LogRetriever;
use super::stage::infer_stage;
use super::types::JobStatus;
use crate::backend::{ExecutionBackend, JobRef};
use crate::error::AppError;

/// Anything that can produce a fresh [`JobStatus`].
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn job_status(&self, since: Option<DateTime<Utc>>) -> Result<JobStatus, AppError>;
}

/// Composes execution listing, log retrieval and stage inference into one
/// status snapshot.
pub struct StatusResolver {
    backend: Arc<dyn ExecutionBackend>,
    job: JobRef,
    logs: LogRetriever,
}

impl StatusResolver {
    pub fn new(backend: Arc<dyn ExecutionBackend>, job: JobRef, log_page_size: usize) -> Self {
        let logs = LogRetriever::new(backend.clone(), job.clone(), log_page_size);
        Self { backend, job, logs }
    }

    pub fn job(&self) -> &JobRef {
        &self.job
    }

    /// Resolve the job's current status.
    ///
    /// Listing failures propagate so callers can tell "confirmed idle" from
    /// "status unknown". Log failures only leave `logs` empty.
    pub async fn get_active_execution(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<JobStatus, AppError> {
        let mut executions = self.backend.list_executions(&self.job).await.map_err(|e| {
            tracing::error!(backend = self.backend.name(), "Failed to check status: {}", e);
            e
        })?;
        executions.sort_by(|a, b| b.create_time.cmp(&a.create_time));

        let Some(active) = executions.into_iter().find(|e| e.is_active()) else {
            return Ok(JobStatus::idle(Utc::now()));
        };

        tracing::debug!(backend = self.backend.name(), execution_id = %active.id, "Active execution found");

        let logs = self.logs.fetch(&active.id, since).await;
        let stage = infer_stage(&logs).or_first();

        Ok(JobStatus::active(
            active.id,
            active.create_time,
            stage,
            logs,
            since,
            Utc::now(),
        ))
    }
}

#[async_trait]
impl StatusSource for StatusResolver {
    async fn job_status(&self, since: Option<DateTime<Utc>>) -> Result<JobStatus, AppError> {
        self.get_active_execution(since).await
    }
}
