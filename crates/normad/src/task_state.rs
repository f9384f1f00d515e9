//! Persistence of `TaskState` into and out of a task's notes blob.
//!
//! Section 9 calls for a back-compat reader: an older layout flattened the
//! role outputs directly onto the top-level object instead of nesting them
//! under `outputs`. Both shapes deserialize to the same [`TaskState`].

use norma_core::TaskState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskStateError {
    #[error("invalid task state json: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskStateError>;

/// Parse a task's notes blob into a [`TaskState`], defaulting to empty state
/// for blank notes (a task that has never been run).
pub fn from_notes(notes: &str) -> Result<TaskState> {
    let trimmed = notes.trim();
    if trimmed.is_empty() {
        return Ok(TaskState::default());
    }

    if let Ok(state) = serde_json::from_str::<TaskState>(trimmed) {
        return Ok(state);
    }

    // Legacy layout: role outputs flattened onto the top level instead of
    // nested under `outputs`.
    let raw: serde_json::Value = serde_json::from_str(trimmed)?;
    let outputs = norma_core::RoleOutputs {
        plan: raw.get("plan").cloned(),
        do_: raw.get("do").cloned(),
        check: raw.get("check").cloned(),
        act: raw.get("act").cloned(),
    };
    let journal = raw
        .get("journal")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    Ok(TaskState { outputs, journal })
}

/// Serialize a [`TaskState`] back into the notes blob, current layout.
pub fn to_notes(state: &TaskState) -> String {
    serde_json::to_string(state).expect("task state always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use norma_core::{Id, JournalEntry, Role, StepStatus};

    #[test]
    fn empty_notes_default_to_empty_state() {
        let state = from_notes("").unwrap();
        assert!(state.journal.is_empty());
        assert!(state.outputs.plan.is_none());
    }

    #[test]
    fn round_trips_current_layout() {
        let mut state = TaskState::default();
        state.record(
            Role::Plan,
            serde_json::json!({"work_plan": {}}),
            JournalEntry {
                timestamp: chrono::Utc::now(),
                run_id: Id::from_string("20260101-000000-aaaaaa"),
                iteration: 1,
                step_index: 1,
                role: Role::Plan,
                status: StepStatus::Ok,
                stop_reason: None,
                title: "planned".into(),
                details: vec![],
            },
        );
        let notes = to_notes(&state);
        let back = from_notes(&notes).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn reads_legacy_flattened_layout() {
        let legacy = r#"{
            "plan": {"work_plan": {}},
            "journal": [{
                "timestamp": "2026-01-01T00:00:00Z",
                "run_id": "20260101-000000-aaaaaa",
                "iteration": 1,
                "step_index": 1,
                "role": "plan",
                "status": "ok",
                "stop_reason": null,
                "title": "planned",
                "details": []
            }]
        }"#;
        let state = from_notes(legacy).unwrap();
        assert!(state.outputs.plan.is_some());
        assert_eq!(state.journal.len(), 1);
    }
}
