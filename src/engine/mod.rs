pub mod logs;
pub mod stage;
pub mod status;
pub mod trigger;
pub mod types;

pub use stage::{infer_stage, InferredStage, StageId};
pub use status::{StatusResolver, StatusSource};
pub use trigger::TriggerGuard;
pub use types::{JobStatus, LogEntry, TriggerOutcome};
