//! Event types for the Run timeline (Section 3, Event entity).
//!
//! Every event has a stable `event_type` string used both as the `events.type`
//! column and as the serde tag of [`EventPayload`].

use crate::id::Id;
use crate::types::Verdict;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    StepCommitted,
    Verdict,
    ReconciledStep,
    WorktreeMounted,
    WorktreeRemoved,
    Escalated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::StepCommitted => "step_committed",
            Self::Verdict => "verdict",
            Self::ReconciledStep => "reconciled_step",
            Self::WorktreeMounted => "worktree_mounted",
            Self::WorktreeRemoved => "worktree_removed",
            Self::Escalated => "escalated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
    pub task_id: Id,
    pub goal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCommittedPayload {
    pub run_id: Id,
    pub step_index: u32,
    pub role: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictPayload {
    pub run_id: Id,
    /// `None` when the run stopped (e.g. a role returned `status: "stop"`)
    /// before Check ever produced a verdict.
    pub verdict: Option<Verdict>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledStepPayload {
    pub run_id: Id,
    pub step_index: u32,
    pub step_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeMountedPayload {
    pub run_id: Id,
    pub task_id: Id,
    pub branch: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRemovedPayload {
    pub run_id: Id,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalatedPayload {
    pub run_id: Id,
    pub reason: String,
}

/// Union of all event payload shapes. Serialized/deserialized untagged so the
/// `events.payload` JSON column round-trips without a wrapper object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    StepCommitted(StepCommittedPayload),
    Verdict(VerdictPayload),
    ReconciledStep(ReconciledStepPayload),
    WorktreeMounted(WorktreeMountedPayload),
    WorktreeRemoved(WorktreeRemovedPayload),
    Escalated(EscalatedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted(_) => EventType::RunStarted,
            Self::StepCommitted(_) => EventType::StepCommitted,
            Self::Verdict(_) => EventType::Verdict,
            Self::ReconciledStep(_) => EventType::ReconciledStep,
            Self::WorktreeMounted(_) => EventType::WorktreeMounted,
            Self::WorktreeRemoved(_) => EventType::WorktreeRemoved,
            Self::Escalated(_) => EventType::Escalated,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("event payload always serializes")
    }
}
