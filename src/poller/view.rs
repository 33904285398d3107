//! Client-side view model: what the terminal watcher renders.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use super::machine::PollState;
use crate::engine::stage::{first_stage, progress, StepProgress, StepStatus};
use crate::engine::{infer_stage, InferredStage, JobStatus, LogEntry, StageId};

/// Most log lines kept in the view.
pub const MAX_VIEW_LOGS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct PollerView {
    pub state: PollState,
    pub execution_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub current_stage: Option<StageId>,
    /// Newest first.
    pub logs: Vec<LogEntry>,
    pub error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for PollerView {
    fn default() -> Self {
        Self {
            state: PollState::Checking,
            execution_id: None,
            start_time: None,
            current_stage: None,
            logs: Vec::new(),
            error: None,
            last_checked: None,
        }
    }
}

impl PollerView {
    /// Fold a status snapshot into the view.
    ///
    /// Logs from the same execution are merged (the snapshot only holds lines
    /// newer than the checkpoint). A different execution or an idle job
    /// starts from an empty log.
    pub fn apply_status(&mut self, status: &JobStatus) {
        self.last_checked = Some(status.last_checked);

        if !status.is_active {
            self.execution_id = None;
            self.start_time = None;
            self.current_stage = None;
            self.logs.clear();
            return;
        }

        if self.execution_id != status.execution_id {
            self.logs.clear();
            self.current_stage = None;
            self.execution_id = status.execution_id.clone();
        }
        self.start_time = status.start_time;
        self.merge_logs(&status.logs);

        // Without a marker in the window, keep the last known stage.
        self.current_stage = match infer_stage(&self.logs) {
            InferredStage::Stage(stage) => Some(stage),
            InferredStage::Unknown => self.current_stage.or(status.current_stage),
        };
    }

    fn merge_logs(&mut self, incoming: &[LogEntry]) {
        let fresh: Vec<LogEntry> = incoming
            .iter()
            .filter(|e| {
                !self
                    .logs
                    .iter()
                    .any(|have| have.timestamp == e.timestamp && have.message == e.message)
            })
            .cloned()
            .collect();
        if fresh.is_empty() {
            return;
        }
        let mut merged = fresh;
        merged.append(&mut self.logs);
        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        merged.truncate(MAX_VIEW_LOGS);
        self.logs = merged;
    }

    pub fn steps(&self) -> Vec<StepProgress> {
        progress(self.current_stage.unwrap_or_else(first_stage))
    }

    /// Time since the execution started, as `"{m}m {s}s"`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> String {
        let secs = self
            .start_time
            .map(|start| (now - start).num_seconds().max(0))
            .unwrap_or(0);
        format!("{}m {}s", secs / 60, secs % 60)
    }

    /// Plain-text rendering for the terminal watcher.
    pub fn render(&self, now: DateTime<Utc>, max_log_lines: usize) -> String {
        let mut out = String::new();

        match self.state {
            PollState::Checking => out.push_str("Checking status...\n"),
            PollState::Idle => {
                out.push_str("Idle: no execution running\n");
            }
            PollState::Active => {
                let id = self.execution_id.as_deref().unwrap_or("UNKNOWN");
                let short = id.char_indices().rev().nth(5).map_or(id, |(i, _)| &id[i..]);
                let _ = writeln!(out, "Processing: job #{short}, started {} ago", self.elapsed(now));

                let line: Vec<String> = self
                    .steps()
                    .iter()
                    .map(|step| {
                        let mark = match step.status {
                            StepStatus::Completed => "x",
                            StepStatus::Active => ">",
                            StepStatus::Pending => " ",
                        };
                        format!("[{mark}] {} {}", step.stage.id, step.stage.label)
                    })
                    .collect();
                let _ = writeln!(out, "{}", line.join("  "));

                for entry in self.logs.iter().take(max_log_lines) {
                    let _ = writeln!(out, "{} {:<7} {}", entry.time, entry.level, entry.message);
                }
            }
        }

        if let Some(error) = &self.error {
            let _ = writeln!(out, "Error: {error}");
        }
        if let Some(checked) = self.last_checked {
            let _ = writeln!(out, "Last checked {}", checked.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        }
        out
    }
}
