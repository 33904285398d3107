//! Pipeline stage inference from free-text job logs.
//!
//! The batch job prints `Starting Stage <n>` when each stage begins. Everything
//! that depends on the marker format lives in this module; consumers only see
//! [`StageId`] and [`InferredStage`].

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::types::LogEntry;

/// One stage of the batch pipeline, identified by its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage{}", self.0)
    }
}

impl StageId {
    /// Parse the `stage<n>` wire form.
    pub fn parse(s: &str) -> Option<Self> {
        s.strip_prefix("stage")?.parse().ok().map(StageId)
    }
}

impl Serialize for StageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StageId::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid stage id: {s}")))
    }
}

/// A displayable pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDef {
    pub id: StageId,
    pub label: &'static str,
}

/// The fixed display order of the pipeline. There is no stage 2.
pub const PIPELINE: &[StageDef] = &[
    StageDef { id: StageId(1), label: "S3->BQ" },
    StageDef { id: StageId(3), label: "TyreScore" },
    StageDef { id: StageId(4), label: "Batch/Override" },
    StageDef { id: StageId(5), label: "Dashboard" },
    StageDef { id: StageId(6), label: "Insights" },
    StageDef { id: StageId(7), label: "Analysis" },
    StageDef { id: StageId(8), label: "Merchandising" },
    StageDef { id: StageId(9), label: "Size File" },
];

/// First displayable stage; what an `Unknown` inference is shown as.
pub fn first_stage() -> StageId {
    PIPELINE[0].id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferredStage {
    Stage(StageId),
    Unknown,
}

impl InferredStage {
    /// Resolve to a concrete stage, treating `Unknown` as the first stage.
    pub fn or_first(self) -> StageId {
        match self {
            InferredStage::Stage(id) => id,
            InferredStage::Unknown => first_stage(),
        }
    }
}

impl fmt::Display for InferredStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferredStage::Stage(id) => id.fmt(f),
            InferredStage::Unknown => f.write_str("unknown"),
        }
    }
}

fn stage_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?i)starting\s+stage\s+(\d+)").expect("stage marker regex is valid")
    })
}

/// Extract the stage number from a single log message, if it is a stage-start marker.
pub fn match_stage_marker(message: &str) -> Option<StageId> {
    stage_marker()
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .map(StageId)
}

/// Infer the currently running stage.
///
/// `logs` may be in any order (the retriever hands them over newest first).
/// They are re-sorted oldest first by timestamp and the last stage marker
/// wins. Entries with equal timestamps keep their reversed input order.
pub fn infer_stage(logs: &[LogEntry]) -> InferredStage {
    let mut chronological: Vec<&LogEntry> = logs.iter().rev().collect();
    chronological.sort_by_key(|entry| entry.timestamp);

    chronological
        .into_iter()
        .filter_map(|entry| match_stage_marker(&entry.message))
        .last()
        .map_or(InferredStage::Unknown, InferredStage::Stage)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Active,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    pub stage: StageDef,
    pub status: StepStatus,
}

/// Mark each pipeline step relative to `current`: earlier steps completed,
/// the current one active, later ones pending. A stage outside the pipeline
/// leaves every step pending.
pub fn progress(current: StageId) -> Vec<StepProgress> {
    let current_index = PIPELINE.iter().position(|s| s.id == current);
    PIPELINE
        .iter()
        .enumerate()
        .map(|(index, stage)| {
            let status = match current_index {
                Some(ci) if index < ci => StepStatus::Completed,
                Some(ci) if index == ci => StepStatus::Active,
                _ => StepStatus::Pending,
            };
            StepProgress { stage: *stage, status }
        })
        .collect()
}
