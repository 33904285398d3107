//! Single-flight start of the batch job.
//!
//! The guard checks for an active execution and only then asks the backend to
//! run the job. There is no check-and-run primitive on the backend, so two
//! callers racing within the same window can both observe "idle" and both
//! start an execution. Triggers are human-initiated and rare; the window is
//! accepted rather than closed with a distributed lock.

use std::sync::Arc;

use chrono::SecondsFormat;

use super::status::StatusSource;
use super::types::TriggerOutcome;
use crate::backend::{ExecutionBackend, JobRef};
use crate::error::AppError;

pub struct TriggerGuard {
    status: Arc<dyn StatusSource>,
    backend: Arc<dyn ExecutionBackend>,
    job: JobRef,
}

impl TriggerGuard {
    pub fn new(status: Arc<dyn StatusSource>, backend: Arc<dyn ExecutionBackend>, job: JobRef) -> Self {
        Self { status, backend, job }
    }

    /// Start the job unless an execution is already running.
    ///
    /// Returns `AppError::Conflict` carrying the running execution's id and
    /// start time when one is active; the backend is not called in that case.
    pub async fn trigger_job(&self) -> Result<TriggerOutcome, AppError> {
        let current = self.status.job_status(None).await?;
        if current.is_active {
            let execution_id = current.execution_id.unwrap_or_default();
            tracing::warn!(execution_id = %execution_id, "Trigger blocked: job is already running");
            return Err(AppError::Conflict {
                execution_id,
                start_time: current
                    .start_time
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            });
        }

        let operation = self.backend.run_job(&self.job).await?;
        tracing::info!(
            backend = self.backend.name(),
            operation = %operation,
            "Job triggered"
        );
        Ok(TriggerOutcome {
            operation,
            job: self.job.resource_name(),
        })
    }
}
