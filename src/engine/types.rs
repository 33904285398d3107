use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::StageId;

/// Reported `state` for an active execution.
pub const STATE_RUNNING: &str = "RUNNING";

/// One normalized log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Local wall-clock display time (`HH:MM:SS`).
    pub time: String,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Snapshot of the monitored job, computed fresh on every request.
///
/// Build with [`JobStatus::idle`] or [`JobStatus::active`]; an idle status
/// never carries an execution id, start time, stage or logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub is_active: bool,
    pub execution_id: Option<String>,
    pub state: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_checked: DateTime<Utc>,
    pub current_stage: Option<StageId>,
    /// Newest first.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub latest_log_timestamp: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn idle(last_checked: DateTime<Utc>) -> Self {
        Self {
            is_active: false,
            execution_id: None,
            state: None,
            start_time: None,
            last_checked,
            current_stage: None,
            logs: Vec::new(),
            latest_log_timestamp: None,
        }
    }

    pub fn active(
        execution_id: String,
        start_time: DateTime<Utc>,
        current_stage: StageId,
        logs: Vec<LogEntry>,
        since: Option<DateTime<Utc>>,
        last_checked: DateTime<Utc>,
    ) -> Self {
        let latest_log_timestamp = logs.first().map(|l| l.timestamp).or(since);
        Self {
            is_active: true,
            execution_id: Some(execution_id),
            state: Some(STATE_RUNNING.to_string()),
            start_time: Some(start_time),
            last_checked,
            current_stage: Some(current_stage),
            logs,
            latest_log_timestamp,
        }
    }
}

/// Result of a successful trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    pub operation: String,
    pub job: String,
}
