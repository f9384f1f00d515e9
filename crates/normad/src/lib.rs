//! normad - task orchestration daemon.
//!
//! Library components for the orchestrator process: the durable journal
//! (C1), crash reconciliation (C2), the Tracker Gateway (C3), the Workspace
//! Manager (C4), the Subprocess Runner (C5), Role Contracts (C6), the Step
//! Executor (C7), the PDCA Controller (C8), the Loop Controller (C9), and
//! the Run Lock (C10). See the design document for the authoritative
//! component breakdown.

pub mod git;
pub mod lock;
pub mod loop_controller;
pub mod pdca;
pub mod progress;
pub mod reconciler;
pub mod runner;
pub mod selection;
pub mod step_executor;
pub mod store;
pub mod task_state;
pub mod tracker;
pub mod workspace;

use loop_controller::LoopError;
use norma_core::{Config, ConfigError};
use std::path::Path;
use store::{Store, StoreError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracker::Tracker;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Top-level error composed at the C9/daemon boundary (Section 7). Carries
/// enough of the original kind for [`OrchestratorError::exit_code`] to map
/// back to the process exit codes in Section 6.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Loop(#[from] LoopError),
}

impl OrchestratorError {
    /// `2` for configuration/startup failure, `3` for a held Run Lock, `1`
    /// for any other fatal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Config(_) => 2,
            OrchestratorError::Loop(LoopError::Lock(_)) => 3,
            _ => 1,
        }
    }
}

/// The orchestrator process: owns the journal connection, the tracker
/// adapter, and the cancellation token the outer loop watches for shutdown.
pub struct Daemon {
    config: Config,
    controller: loop_controller::LoopController,
    cancel: CancellationToken,
}

impl Daemon {
    /// Load configuration from `repo_root`, open the journal, and construct
    /// the Loop Controller. Does not acquire the Run Lock or touch the
    /// tracker — that happens once [`Daemon::run`] starts.
    pub async fn new(repo_root: &Path) -> Result<Self, OrchestratorError> {
        let config = Config::load(repo_root)?;
        let db_path = config.norma_dir.join("norma.db");
        let store = Store::open(&db_path).await?;
        let tracker = Tracker::new(config.tracker_bin.clone());
        let controller = loop_controller::LoopController::new(store, tracker, config.clone());

        Ok(Self { config, controller, cancel: CancellationToken::new() })
    }

    /// Run the outer loop until cancelled or a fatal error occurs (Section 7:
    /// `StoreError`, `LockError` propagate; everything else is absorbed
    /// per-task).
    pub async fn run(&self) -> Result<(), OrchestratorError> {
        info!(repo_root = %self.config.repo_root.display(), norma_dir = %self.config.norma_dir.display(), "normad starting");
        self.controller.run(&self.cancel).await?;
        Ok(())
    }

    /// Request a graceful shutdown: the outer loop finishes its current
    /// dispatch (if any) and then returns rather than selecting another task.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.cancel.cancel();
    }
}
