//! Step Executor (C7): composes the Tracker Gateway, Workspace Manager,
//! Subprocess Runner, and Role Contracts into one role invocation, and
//! commits the result to the journal.
//!
//! The ten-step sequence in Section 4.7 is implemented as straight-line code
//! in [`StepExecutor::execute`]; the worktree is torn down by a guard so
//! every return path — success, agent failure, or response validation
//! failure — removes it exactly once.

use crate::progress;
use crate::runner::{Runner, RunnerConfig, RunnerError, TerminalMode};
use crate::store::{event_from_payload, Store, StoreError};
use crate::task_state;
use crate::tracker::{Tracker, TrackerError};
use crate::workspace::{self, WorkspaceError};
use chrono::Utc;
use norma_core::events::{
    EventPayload, StepCommittedPayload, WorktreeMountedPayload, WorktreeRemovedPayload,
};
use norma_core::roles::{
    self, BudgetsBlock, ContextBlock, PathsBlock, PriorOutputs, ResponseStatus, RoleResponse,
    RunContext, StepContext, TaskContext,
};
use norma_core::{Config, Id, JournalEntry, Role, Run, Step, StepStatus, Task, TaskState};
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default vocabulary of stop reasons offered to every role; a role may use
/// any subset of these when returning `status: "stop"`.
const DEFAULT_STOP_REASONS: &[&str] = &[
    "blocked",
    "needs_clarification",
    "unsafe",
    "budget_exceeded",
    "out_of_scope",
];

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Mount(#[from] WorkspaceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("role {role} requires a prior {missing} output that is not in task state")]
    MissingPrior { role: Role, missing: &'static str },
    #[error("step execution cancelled")]
    Cancelled,
    #[error("step {step_index} ({role}) failed: {reason}")]
    StepFailed {
        step: Box<Step>,
        response: Option<Box<RoleResponse>>,
        step_index: u32,
        role: Role,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, StepError>;

/// Outcome of a successful (status=ok) step.
pub struct StepOutcome {
    pub step: Step,
    pub response: RoleResponse,
}

/// Removes the step's worktree exactly once, however `execute` returns.
struct WorktreeGuard {
    repo_root: PathBuf,
    workspace_dir: PathBuf,
}

impl Drop for WorktreeGuard {
    fn drop(&mut self) {
        if let Err(e) = workspace::remove(&self.repo_root, &self.workspace_dir) {
            tracing::warn!(
                workspace_dir = %self.workspace_dir.display(),
                error = %e,
                "worktree removal failed during step cleanup"
            );
        }
    }
}

pub struct StepExecutor<'a> {
    pub store: &'a Store,
    pub tracker: &'a Tracker,
    pub config: &'a Config,
}

impl<'a> StepExecutor<'a> {
    pub fn new(store: &'a Store, tracker: &'a Tracker, config: &'a Config) -> Self {
        Self { store, tracker, config }
    }

    /// Execute one role invocation within `run` for `task`, mutating
    /// `task_state` with the recorded output and Journal entry. Returns
    /// `Ok` only when the agent's response has `status: "ok"`; any other
    /// outcome (non-ok status, agent error, invalid response) still commits
    /// a `fail` step row and is surfaced as `Err(StepError::StepFailed)`.
    pub async fn execute(
        &self,
        run: &Run,
        task: &Task,
        task_state: &mut TaskState,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        require_prior(role, task_state)?;

        let step_index = run.current_step_index + 1;
        let run_dir = PathBuf::from(&run.run_dir);
        let step_dir = run_dir.join("steps").join(format!("{step_index:03}-{role}"));
        std::fs::create_dir_all(step_dir.join("logs"))?;
        std::fs::create_dir_all(step_dir.join("artifacts"))?;

        let workspace_dir = step_dir.join("workspace");
        let branch = workspace::branch_for_task(&task.id);
        workspace::mount(&self.config.repo_root, &workspace_dir, &task.id, &run.base_branch)?;
        let _guard = WorktreeGuard {
            repo_root: self.config.repo_root.clone(),
            workspace_dir: workspace_dir.clone(),
        };
        self.emit_worktree_event(
            &run.id,
            EventPayload::WorktreeMounted(WorktreeMountedPayload {
                run_id: run.id.clone(),
                task_id: task.id.clone(),
                branch,
                path: workspace_dir.to_string_lossy().to_string(),
            }),
        )
        .await;

        let progress_path = step_dir.join("artifacts/progress.md");
        std::fs::write(&progress_path, progress::render(&task.id, &task_state.journal))?;

        let request = self.build_request(run, task, step_index, role, task_state, &step_dir, &workspace_dir);
        let request_json = serde_json::to_string_pretty(&request)?;

        let runner_config = self.runner_config(role);
        let started_at = Utc::now();
        let run_outcome =
            Runner::run(&runner_config, role, &step_dir, &workspace_dir, &request_json, cancel).await;
        let ended_at = Utc::now();

        let (status, response, summary, raw_json) = interpret_outcome(role, run_outcome);
        std::fs::write(step_dir.join("output.json"), raw_json.as_deref().unwrap_or("{}"))?;

        if role == Role::Do && status == StepStatus::Ok {
            workspace::commit_workspace(&workspace_dir, &run.id, &task.id, step_index)?;
        }

        let step = Step {
            run_id: run.id.clone(),
            step_index,
            role,
            iteration: run.iteration,
            status,
            step_dir: step_dir.to_string_lossy().to_string(),
            started_at,
            ended_at,
            summary: summary.clone(),
        };
        let seq = self.store.next_event_seq(&run.id).await?;
        let event = event_from_payload(
            run.id.clone(),
            seq,
            format!("{role} step committed"),
            EventPayload::StepCommitted(StepCommittedPayload {
                run_id: run.id.clone(),
                step_index,
                role: role.as_str().to_string(),
                status: status.as_str().to_string(),
            }),
        );
        self.store.commit_step(&step, &event).await?;

        let stop_reason = response.as_ref().and_then(|r| r.stop_reason.clone());
        let details = response
            .as_ref()
            .map(|r| r.progress.details.clone())
            .unwrap_or_default();
        let title = response
            .as_ref()
            .map(|r| r.progress.title.clone())
            .unwrap_or_else(|| summary.clone());

        if let Some(resp) = &response {
            if let Some(output) = &resp.output {
                let output_json = serde_json::to_value(output)?;
                task_state.record(
                    role,
                    output_json,
                    JournalEntry {
                        timestamp: ended_at,
                        run_id: run.id.clone(),
                        iteration: run.iteration,
                        step_index,
                        role,
                        status,
                        stop_reason: stop_reason.clone(),
                        title,
                        details,
                    },
                );
            } else {
                task_state.journal.push(JournalEntry {
                    timestamp: ended_at,
                    run_id: run.id.clone(),
                    iteration: run.iteration,
                    step_index,
                    role,
                    status,
                    stop_reason: stop_reason.clone(),
                    title,
                    details,
                });
            }
        } else {
            task_state.journal.push(JournalEntry {
                timestamp: ended_at,
                run_id: run.id.clone(),
                iteration: run.iteration,
                step_index,
                role,
                status,
                stop_reason: stop_reason.clone(),
                title,
                details,
            });
        }

        self.tracker
            .set_notes(&task.id, &task_state::to_notes(task_state))
            .await?;

        if status == StepStatus::Ok {
            if let Some(label) = has_label_for(role) {
                self.tracker.add_label(&task.id, label).await?;
            }
            self.emit_worktree_event(
                &run.id,
                EventPayload::WorktreeRemoved(WorktreeRemovedPayload {
                    run_id: run.id.clone(),
                    path: workspace_dir.to_string_lossy().to_string(),
                }),
            )
            .await;
            Ok(StepOutcome {
                step,
                response: response.expect("ok status always carries a response"),
            })
        } else {
            self.emit_worktree_event(
                &run.id,
                EventPayload::WorktreeRemoved(WorktreeRemovedPayload {
                    run_id: run.id.clone(),
                    path: workspace_dir.to_string_lossy().to_string(),
                }),
            )
            .await;
            Err(StepError::StepFailed {
                step: Box::new(step),
                response: response.map(Box::new),
                step_index,
                role,
                reason: summary,
            })
        }
    }

    /// Best-effort event append for worktree lifecycle bookkeeping: failure to
    /// record the event never fails the step, since the filesystem-level
    /// mount/removal (the part that matters for correctness) already happened.
    async fn emit_worktree_event(&self, run_id: &Id, payload: EventPayload) {
        let seq = match self.store.next_event_seq(run_id).await {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(error = %e, "failed to allocate event seq for worktree event");
                return;
            }
        };
        let message = match &payload {
            EventPayload::WorktreeMounted(_) => "worktree mounted".to_string(),
            EventPayload::WorktreeRemoved(_) => "worktree removed".to_string(),
            _ => "worktree event".to_string(),
        };
        let event = event_from_payload(run_id.clone(), seq, message, payload);
        if let Err(e) = self.store.append_event(&event).await {
            tracing::warn!(error = %e, "failed to append worktree event");
        }
    }

    fn build_request(
        &self,
        run: &Run,
        task: &Task,
        step_index: u32,
        role: Role,
        task_state: &TaskState,
        step_dir: &std::path::Path,
        workspace_dir: &std::path::Path,
    ) -> roles::RoleRequest {
        let prior = PriorOutputs {
            plan: task_state.outputs.plan.clone().and_then(|v| serde_json::from_value(v).ok()),
            do_: task_state.outputs.do_.clone().and_then(|v| serde_json::from_value(v).ok()),
            check: task_state.outputs.check.clone().and_then(|v| serde_json::from_value(v).ok()),
        };

        roles::build_request(
            RunContext { id: run.id.clone(), iteration: run.iteration },
            TaskContext {
                id: task.id.clone(),
                title: task.title.clone(),
                description: task.description.clone(),
                acceptance_criteria: task.acceptance_criteria.clone(),
            },
            StepContext { index: step_index, name: role.as_str().to_string() },
            PathsBlock {
                workspace_dir: workspace_dir.to_string_lossy().to_string(),
                run_dir: run.run_dir.clone(),
                progress: step_dir.join("artifacts/progress.md").to_string_lossy().to_string(),
            },
            BudgetsBlock {
                max_iterations: self.config.max_iterations,
                max_wall_time_minutes: self.config.max_wall_time_minutes,
                max_failed_checks: self.config.max_failed_checks,
            },
            DEFAULT_STOP_REASONS.iter().map(|s| s.to_string()).collect(),
            ContextBlock { facts: vec![], links: vec![], attempt: run.iteration },
            role,
            prior,
        )
    }

    fn runner_config(&self, role: Role) -> RunnerConfig {
        let command = self
            .config
            .agent_commands
            .get(role.as_str())
            .cloned()
            .unwrap_or_else(|| role.as_str().to_string());
        RunnerConfig {
            command,
            timeout_sec: self.config.max_wall_time_minutes.map(|m| m * 60).unwrap_or(0),
            terminal_mode: TerminalMode::Piped,
            debug: self.config.debug,
        }
    }
}

fn require_prior(role: Role, task_state: &TaskState) -> Result<()> {
    let missing: Option<&'static str> = match role {
        Role::Plan => None,
        Role::Do if task_state.outputs.plan.is_none() => Some("plan"),
        Role::Check if task_state.outputs.plan.is_none() => Some("plan"),
        Role::Check if task_state.outputs.do_.is_none() => Some("do"),
        Role::Act if task_state.outputs.check.is_none() => Some("check"),
        _ => None,
    };
    match missing {
        Some(missing) => Err(StepError::MissingPrior { role, missing }),
        None => Ok(()),
    }
}

fn has_label_for(role: Role) -> Option<&'static str> {
    match role {
        Role::Plan => Some("norma-has-plan"),
        Role::Do => Some("norma-has-do"),
        Role::Check => Some("norma-has-check"),
        Role::Act => None,
    }
}

/// Turn a subprocess outcome into (status, parsed response, human summary,
/// raw extracted JSON for `output.json`). Any failure along the way —
/// spawn/timeout error, non-zero exit, malformed JSON, schema validation —
/// yields `status=fail` and `response=None` rather than propagating, so the
/// caller can still commit a journal row for it.
fn interpret_outcome(
    role: Role,
    outcome: std::result::Result<crate::runner::RunOutcome, RunnerError>,
) -> (StepStatus, Option<RoleResponse>, String, Option<String>) {
    let run_outcome = match outcome {
        Err(e) => return (StepStatus::Fail, None, format!("agent invocation failed: {e}"), None),
        Ok(o) => o,
    };

    if run_outcome.exit_code != 0 {
        return (
            StepStatus::Fail,
            None,
            format!("agent exited with code {}", run_outcome.exit_code),
            None,
        );
    }

    let stdout = String::from_utf8_lossy(&run_outcome.stdout).to_string();
    let Some(raw_json) = roles::extract_response_json(&stdout) else {
        return (StepStatus::Fail, None, "agent stdout had no JSON object".to_string(), None);
    };
    let raw_json = raw_json.to_string();

    match roles::validate_response(role, &raw_json) {
        Ok(response) => {
            let status = match response.status {
                ResponseStatus::Ok => StepStatus::Ok,
                ResponseStatus::Stop | ResponseStatus::Error => StepStatus::Fail,
            };
            let summary = if response.summary.text.is_empty() {
                format!("{role} returned status={:?}", response.status)
            } else {
                response.summary.text.clone()
            };
            (status, Some(response), summary, Some(raw_json))
        }
        Err(e) => (StepStatus::Fail, None, format!("invalid response: {e}"), Some(raw_json)),
    }
}
