//! Core data model: Run, Step, Event, Task, `TaskState`, Worktree.
//!
//! See Section 3 (Data Model) and Section 4.6 (Role Contracts) of the design
//! document for the authoritative shape of each type.

use crate::id::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Authoritative task id pattern: `norma-<segment>(.<segment>)*`.
pub const TASK_ID_REGEX: &str = r"^norma-[a-z0-9]+(\.[a-z0-9]+)*$";

/// Status of a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// The four PDCA roles, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Plan,
    Do,
    Check,
    Act,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Do => "do",
            Self::Check => "check",
            Self::Act => "act",
        }
    }

    /// The role that follows this one in a PDCA iteration, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Plan => Some(Self::Do),
            Self::Do => Some(Self::Check),
            Self::Check => Some(Self::Act),
            Self::Act => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "do" => Ok(Self::Do),
            "check" => Ok(Self::Check),
            "act" => Ok(Self::Act),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Status of a single Step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Fail,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "fail" => Ok(Self::Fail),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// The Check role's verdict, per the rule in Section 4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Partial,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Partial => "PARTIAL",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            "PARTIAL" => Ok(Self::Partial),
            other => Err(format!("unknown verdict: {other}")),
        }
    }
}

/// The Act role's decision, and the derived escalation the loop controller applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Close,
    Replan,
    Rollback,
    Continue,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Replan => "replan",
            Self::Rollback => "rollback",
            Self::Continue => "continue",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "close" => Ok(Self::Close),
            "replan" => Ok(Self::Replan),
            "rollback" => Ok(Self::Rollback),
            "continue" => Ok(Self::Continue),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// Tracker task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Task,
    Bug,
    Epic,
    Feature,
    Spike,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Epic => "epic",
            Self::Feature => "feature",
            Self::Spike => "spike",
        }
    }

    pub fn is_parent_only(self) -> bool {
        matches!(self, Self::Epic | Self::Feature)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "epic" => Ok(Self::Epic),
            "feature" => Ok(Self::Feature),
            "spike" => Ok(Self::Spike),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// Orchestrator-internal task workflow status, distinct from the tracker's own
/// open/in_progress/closed/deferred vocabulary (see Section 4.3 status mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Planning,
    Doing,
    Checking,
    Acting,
    Done,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Planning => "planning",
            Self::Doing => "doing",
            Self::Checking => "checking",
            Self::Acting => "acting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// The tracker-side status this orchestrator status is mirrored as.
    pub fn tracker_status(self) -> &'static str {
        match self {
            Self::Todo => "open",
            Self::Planning | Self::Doing | Self::Checking | Self::Acting => "in_progress",
            Self::Done => "closed",
            Self::Failed => "open",
            Self::Stopped => "deferred",
        }
    }

    /// The label applied alongside the tracker status for statuses that the
    /// tracker's own vocabulary cannot distinguish (in_progress/open are both
    /// many-to-one). Returns `None` when the tracker status alone is unambiguous.
    pub fn tracker_label(self) -> Option<&'static str> {
        match self {
            Self::Planning => Some("planning"),
            Self::Doing => Some("doing"),
            Self::Checking => Some("checking"),
            Self::Acting => Some("acting"),
            Self::Failed => Some("failed"),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One orchestrated attempt at a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub task_id: Id,
    pub goal: String,
    pub status: RunStatus,
    pub iteration: u32,
    pub current_step_index: u32,
    pub verdict: Option<Verdict>,
    pub run_dir: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

/// One role execution within a Run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub run_id: Id,
    pub step_index: u32,
    pub role: Role,
    pub iteration: u32,
    pub status: StepStatus,
    pub step_dir: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub summary: String,
}

/// Append-only timeline entry for a Run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: Id,
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
}

/// Read-only mirror of a Tracker Gateway task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub task_type: TaskType,
    pub parent_id: Option<Id>,
    pub priority: u32,
    pub status: String,
    pub labels: Vec<String>,
    pub notes: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Whether the task description contains a Ready Contract: all of
    /// `Objective:`, `Artifact:`, and `Verify:` markers.
    pub fn has_ready_contract(&self) -> bool {
        self.description.contains("Objective:")
            && self.description.contains("Artifact:")
            && self.description.contains("Verify:")
    }

    /// Whether the description carries a `Verify:` marker, used as a secondary
    /// selection-policy sort key.
    pub fn has_verify_marker(&self) -> bool {
        self.description.contains("Verify:")
    }
}

/// One Journal entry inside a `TaskState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: Id,
    pub iteration: u32,
    pub step_index: u32,
    pub role: Role,
    pub status: StepStatus,
    pub stop_reason: Option<String>,
    pub title: String,
    pub details: Vec<String>,
}

/// Per-role output blocks, persisted inside `TaskState`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOutputs {
    pub plan: Option<serde_json::Value>,
    pub do_: Option<serde_json::Value>,
    pub check: Option<serde_json::Value>,
    pub act: Option<serde_json::Value>,
}

/// Per-task persistent workflow memory, stored as JSON inside the task's notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub outputs: RoleOutputs,
    pub journal: Vec<JournalEntry>,
}

impl TaskState {
    /// Append a Journal entry and merge the role output into `outputs`.
    pub fn record(&mut self, role: Role, output: serde_json::Value, entry: JournalEntry) {
        match role {
            Role::Plan => self.outputs.plan = Some(output),
            Role::Do => self.outputs.do_ = Some(output),
            Role::Check => self.outputs.check = Some(output),
            Role::Act => self.outputs.act = Some(output),
        }
        self.journal.push(entry);
    }

    /// Most recent Journal entry for the given role, if any.
    pub fn last_entry_for(&self, role: Role) -> Option<&JournalEntry> {
        self.journal.iter().rev().find(|e| e.role == role)
    }
}

/// Ephemeral git checkout for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub task_id: Id,
    pub branch: String,
    pub base_branch: String,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_cycle_order() {
        assert_eq!(Role::Plan.next(), Some(Role::Do));
        assert_eq!(Role::Do.next(), Some(Role::Check));
        assert_eq!(Role::Check.next(), Some(Role::Act));
        assert_eq!(Role::Act.next(), None);
    }

    #[test]
    fn task_status_tracker_mapping() {
        assert_eq!(TaskStatus::Todo.tracker_status(), "open");
        assert_eq!(TaskStatus::Planning.tracker_status(), "in_progress");
        assert_eq!(TaskStatus::Planning.tracker_label(), Some("planning"));
        assert_eq!(TaskStatus::Done.tracker_status(), "closed");
        assert_eq!(TaskStatus::Failed.tracker_status(), "open");
        assert_eq!(TaskStatus::Failed.tracker_label(), Some("failed"));
        assert_eq!(TaskStatus::Stopped.tracker_status(), "deferred");
        assert_eq!(TaskStatus::Todo.tracker_label(), None);
    }

    #[test]
    fn ready_contract_requires_all_markers() {
        let mut task = Task {
            id: Id::from_string("norma-x"),
            task_type: TaskType::Task,
            parent_id: None,
            priority: 0,
            status: "todo".into(),
            labels: vec![],
            notes: String::new(),
            title: "x".into(),
            description: "Objective: do it\nArtifact: a file".into(),
            acceptance_criteria: vec![],
            created_at: Utc::now(),
        };
        assert!(!task.has_ready_contract());
        task.description.push_str("\nVerify: it exists");
        assert!(task.has_ready_contract());
        assert!(task.has_verify_marker());
    }

    #[test]
    fn task_state_records_outputs_and_journal() {
        let mut state = TaskState::default();
        let entry = JournalEntry {
            timestamp: Utc::now(),
            run_id: Id::from_string("20260101-000000-aaaaaa"),
            iteration: 1,
            step_index: 1,
            role: Role::Plan,
            status: StepStatus::Ok,
            stop_reason: None,
            title: "planned".into(),
            details: vec![],
        };
        state.record(Role::Plan, serde_json::json!({"x": 1}), entry);
        assert!(state.outputs.plan.is_some());
        assert_eq!(state.journal.len(), 1);
        assert!(state.last_entry_for(Role::Plan).is_some());
        assert!(state.last_entry_for(Role::Do).is_none());
    }

    #[test]
    fn serde_round_trips_task_state() {
        let mut state = TaskState::default();
        state.record(
            Role::Check,
            serde_json::json!({"verdict": {"status": "PASS"}}),
            JournalEntry {
                timestamp: Utc::now(),
                run_id: Id::from_string("20260101-000000-aaaaaa"),
                iteration: 1,
                step_index: 3,
                role: Role::Check,
                status: StepStatus::Ok,
                stop_reason: None,
                title: "checked".into(),
                details: vec!["all green".into()],
            },
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
