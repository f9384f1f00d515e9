//! Loop Controller (C9): the outer driver. Reconciles whatever an unclean
//! shutdown left behind, then repeatedly selects the next ready task and
//! drives it through the PDCA Controller until the task closes, fails, or
//! escalates.
//!
//! Propagation policy (Section 7): a single task's failure never aborts the
//! daemon — it is caught here, the task is marked `failed`, and the loop
//! continues. `StoreError`, `LockError`, and cancellation are the exceptions:
//! they propagate to the caller as fatal.

use crate::git;
use crate::lock::{LockError, RunLock};
use crate::pdca::PdcaController;
use crate::reconciler;
use crate::selection::{self, SelectionError};
use crate::step_executor::{StepError, StepExecutor};
use crate::store::{event_from_payload, Store, StoreError};
use crate::task_state;
use crate::tracker::{Tracker, TrackerError};
use crate::workspace::{self, WorkspaceError};
use chrono::Utc;
use norma_core::events::{EventPayload, RunStartedPayload, VerdictPayload};
use norma_core::{Id, Run, RunStatus, Task, TaskStatus};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Sub-status labels the Tracker Gateway mirrors alongside `in_progress`,
/// used to spot tasks an unclean shutdown left mid-run.
const IN_PROGRESS_LABELS: &[&str] = &["planning", "doing", "checking", "acting"];

#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("orchestrator cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, LoopError>;

/// Non-fatal task-dispatch errors: logged, the task is marked `failed`, and
/// the outer loop continues (Section 7).
#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task state error: {0}")]
    TaskState(#[from] task_state::TaskStateError),
    #[error("cancelled")]
    Cancelled,
}

impl From<StepError> for DispatchError {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Store(e) => Self::Store(e),
            StepError::Tracker(e) => Self::Tracker(e),
            StepError::Mount(e) => Self::Workspace(e),
            StepError::Io(e) => Self::Io(e),
            StepError::Cancelled => Self::Cancelled,
            // MissingPrior/Serialization/StepFailed are either orchestrator
            // bugs or already handled inside the PdcaController; surface them
            // as an opaque io error so a single bad journal entry doesn't
            // crash the daemon.
            other => Self::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub struct LoopController {
    store: Store,
    tracker: Tracker,
    config: norma_core::Config,
}

impl LoopController {
    pub fn new(store: Store, tracker: Tracker, config: norma_core::Config) -> Self {
        Self { store, tracker, config }
    }

    /// Run the outer loop until `cancel` fires or the defensive iteration cap
    /// is reached. Returns `Err` only for the fatal cases the propagation
    /// policy carves out: a Store failure, a Run Lock conflict, or explicit
    /// cancellation mid-dispatch.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.recover_stale_runs(cancel).await?;

        let mut iterations: u64 = 0;
        while iterations < self.config.max_loop_iterations {
            iterations += 1;
            if cancel.is_cancelled() {
                return Ok(());
            }

            let selected = match selection::select_next_ready(&self.tracker, &self.config).await {
                Ok(selected) => selected,
                Err(err) => {
                    log_selection_error(&err);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    }
                    continue;
                }
            };

            let Some((task, reason)) = selected else {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
                continue;
            };
            tracing::info!(task_id = %task.id, %reason, "selected task for dispatch");

            // Non-blocking: a second orchestrator running against the same
            // repo must fail fast rather than queue up behind this one
            // (Section 8, scenario: a concurrent orchestrator start).
            let lock = match RunLock::try_acquire(&self.config.norma_dir) {
                Ok(lock) => lock,
                Err(LockError::AlreadyHeld) => return Err(LockError::AlreadyHeld.into()),
                Err(e) => return Err(e.into()),
            };

            let outcome = self.dispatch(&task, cancel).await;
            drop(lock);

            match outcome {
                Ok(()) => {}
                Err(DispatchError::Store(e)) => return Err(LoopError::Store(e)),
                Err(DispatchError::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "task dispatch failed, marking task failed");
                    self.tracker.mark_status(&task.id, TaskStatus::Failed).await.ok();
                }
            }
        }
        Ok(())
    }

    /// At startup, reconcile every run directory on disk against the journal
    /// and, if no other orchestrator holds the lock, fail any task an
    /// unclean shutdown left in a `planning|doing|checking|acting` state.
    async fn recover_stale_runs(&self, cancel: &CancellationToken) -> Result<()> {
        let runs_dir = self.config.norma_dir.join("runs");
        if runs_dir.exists() {
            for entry in std::fs::read_dir(&runs_dir)? {
                let entry = entry?;
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
                let run_id = Id::from_string(name);
                if self.store.get_run_status(&run_id).await?.is_none() {
                    continue;
                }
                if let Err(e) = reconciler::reconcile_run(&self.store, &run_id, &entry.path()).await {
                    tracing::warn!(run_id = %run_id, error = %e, "reconciliation failed for run");
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(());
        }

        match RunLock::try_acquire(&self.config.norma_dir) {
            Ok(lock) => {
                self.fail_stale_tasks().await?;
                drop(lock);
                Ok(())
            }
            // Another orchestrator is already running; leave its in-flight
            // tasks alone.
            Err(LockError::AlreadyHeld) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Tracker failures here are logged and skipped rather than propagated —
    /// a gateway hiccup during startup recovery is not one of the fatal
    /// cases (Store/Lock/Cancellation) the propagation policy carves out.
    async fn fail_stale_tasks(&self) -> Result<()> {
        let tasks = match self.tracker.list().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "listing tasks for stale-run recovery failed");
                return Ok(());
            }
        };
        for task in tasks {
            if task.status != "in_progress" {
                continue;
            }
            let Some(stale_label) = IN_PROGRESS_LABELS.iter().find(|l| task.labels.iter().any(|tl| tl == *l)) else {
                continue;
            };
            tracing::warn!(task_id = %task.id, label = stale_label, "recovering task left in progress by an unclean shutdown");
            self.tracker.remove_label(&task.id, stale_label).await.ok();
            if let Err(e) = self.tracker.mark_status(&task.id, TaskStatus::Failed).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to mark stale task as failed");
            }
        }
        Ok(())
    }

    /// Dispatch one task: create its Run, drive PDCA to a terminal outcome,
    /// and apply or discard the result.
    async fn dispatch(&self, task: &Task, cancel: &CancellationToken) -> std::result::Result<(), DispatchError> {
        let run_id = Id::new_run_id(Utc::now());
        let base_branch = git::current_branch(&self.config.repo_root)?;
        let run_dir = self.config.norma_dir.join("runs").join(run_id.to_string());

        let mut task_state = task_state::from_notes(&task.notes)?;
        let mut run = Run {
            id: run_id.clone(),
            task_id: task.id.clone(),
            goal: task.title.clone(),
            status: RunStatus::Running,
            iteration: 1,
            current_step_index: 0,
            verdict: None,
            run_dir: run_dir.to_string_lossy().to_string(),
            base_branch,
            created_at: Utc::now(),
        };

        self.tracker.mark_status(&task.id, TaskStatus::Planning).await?;
        self.tracker.set_run(&task.id, &run.id).await?;

        let start_event = event_from_payload(
            run.id.clone(),
            1,
            format!("run started for {}", task.id),
            EventPayload::RunStarted(RunStartedPayload {
                run_id: run.id.clone(),
                task_id: task.id.clone(),
                goal: run.goal.clone(),
            }),
        );
        self.store.create_run(&run, &start_event).await?;

        let executor = StepExecutor::new(&self.store, &self.tracker, &self.config);
        let controller = PdcaController::new(&executor);

        let pdca_result = controller.run(&mut run, task, &mut task_state, self.config.max_iterations, cancel).await;

        let outcome = match pdca_result {
            Ok(outcome) => outcome,
            Err(err) => {
                let status = if matches!(err, StepError::Cancelled) { RunStatus::Stopped } else { RunStatus::Failed };
                self.finish_run(&run, status, None, &format!("step execution error: {err}")).await?;
                return Err(err.into());
            }
        };

        self.finish_run(&run, outcome.status, outcome.verdict, "pdca cycle reached a terminal state").await?;

        match outcome.status {
            RunStatus::Passed => match workspace::apply_changes(
                &self.config.repo_root,
                &task.id,
                &run.id,
                outcome.final_step_index,
                &task.title,
            ) {
                Ok(_applied) => {
                    self.tracker.mark_status(&task.id, TaskStatus::Done).await?;
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, run_id = %run.id, error = %e, "applying changes failed, marking task failed");
                    self.tracker.mark_status(&task.id, TaskStatus::Failed).await?;
                    Err(e.into())
                }
            },
            RunStatus::Failed => {
                self.tracker.mark_status(&task.id, TaskStatus::Failed).await?;
                Ok(())
            }
            RunStatus::Stopped => {
                self.tracker.mark_status(&task.id, TaskStatus::Stopped).await?;
                Ok(())
            }
            RunStatus::Running => unreachable!("PdcaController only returns a terminal status"),
        }
    }

    async fn finish_run(
        &self,
        run: &Run,
        status: RunStatus,
        verdict: Option<norma_core::Verdict>,
        message: &str,
    ) -> std::result::Result<(), StoreError> {
        let seq = self.store.next_event_seq(&run.id).await?;
        // Terminal event is always `verdict` (Section 3, 8): its `verdict`
        // field carries the Check role's outcome when one exists, and the
        // message always reports the Run's final status so a stopped run
        // without a verdict still leaves a legible final event.
        let payload = EventPayload::Verdict(VerdictPayload {
            run_id: run.id.clone(),
            verdict,
            message: format!("{message} (status={status})"),
        });
        let event = event_from_payload(run.id.clone(), seq, message.to_string(), payload);
        self.store.update_run(&run.id, status, run.iteration, verdict, &event).await
    }
}

/// `SelectionError` only wraps a `TrackerError` (a per-task gateway concern),
/// never a reason to stop the daemon; the caller treats this as a one-shot
/// idle cycle instead of tearing the loop down.
fn log_selection_error(err: &SelectionError) {
    tracing::error!(error = %err, "task selection failed, treating as no tasks ready this cycle");
}
