//! Reconciler (C2): repairs the journal after a crash by scanning the
//! on-disk step directories and inserting any journal rows the daemon never
//! got to write.
//!
//! Idempotent: re-running against an already-consistent run is a no-op.

use crate::store::{event_from_payload, Store, StoreError};
use chrono::Utc;
use norma_core::events::{EventPayload, ReconciledStepPayload};
use norma_core::{Id, Role, Step, StepStatus};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReconcilerError>;

/// Reconcile a single run's on-disk step directories against its journal
/// rows, inserting synthetic `fail` steps for anything missing and advancing
/// the run's cursor to the highest observed step index.
pub async fn reconcile_run(store: &Store, run_id: &Id, run_dir: &Path) -> Result<u32> {
    cleanup_tmp_siblings(run_dir)?;

    let steps_dir = run_dir.join("steps");
    if !steps_dir.exists() {
        return Ok(0);
    }

    let on_disk = scan_step_dirs(&steps_dir)?;
    let known: BTreeSet<u32> = store
        .list_steps(run_id)
        .await?
        .into_iter()
        .map(|s| s.step_index)
        .collect();

    let mut inserted = 0;
    let mut max_index = known.iter().copied().max().unwrap_or(0);

    for (step_index, role, step_dir) in on_disk {
        max_index = max_index.max(step_index);
        if known.contains(&step_index) {
            continue;
        }

        let now = Utc::now();
        let step = Step {
            run_id: run_id.clone(),
            step_index,
            role,
            iteration: 0,
            status: StepStatus::Fail,
            step_dir: step_dir.to_string_lossy().to_string(),
            started_at: now,
            ended_at: now,
            summary: "reconciled missing step record".to_string(),
        };
        let seq = store.next_event_seq(run_id).await?;
        let event = event_from_payload(
            run_id.clone(),
            seq,
            "step reconciled from disk",
            EventPayload::ReconciledStep(ReconciledStepPayload {
                run_id: run_id.clone(),
                step_index,
                step_dir: step.step_dir.clone(),
            }),
        );
        store.commit_step(&step, &event).await?;
        inserted += 1;
    }

    Ok(inserted)
}

/// Scan `<run_dir>/steps` for `NNN-<role>` directories, returning them sorted
/// by step index. Orphaned entries that don't parse are ignored rather than
/// treated as an error, since unknown directories may belong to a future
/// format this binary doesn't understand yet.
fn scan_step_dirs(steps_dir: &Path) -> Result<Vec<(u32, Role, std::path::PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(steps_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((index_str, role_str)) = name.split_once('-') else {
            continue;
        };
        let Ok(step_index) = index_str.parse::<u32>() else {
            continue;
        };
        let Ok(role) = Role::from_str(role_str) else {
            continue;
        };
        found.push((step_index, role, entry.path()));
    }
    found.sort_by_key(|(index, ..)| *index);
    Ok(found)
}

/// Remove leftover `*.tmp-*` siblings left behind by an interrupted atomic
/// write (rename-after-write never completed).
fn cleanup_tmp_siblings(run_dir: &Path) -> Result<()> {
    if !run_dir.exists() {
        return Ok(());
    }
    for entry in walk_dirs(run_dir)? {
        for file in std::fs::read_dir(&entry)? {
            let file = file?;
            let name = file.file_name();
            if let Some(name) = name.to_str() {
                if name.contains(".tmp-") {
                    let path = file.path();
                    if file.file_type()?.is_dir() {
                        std::fs::remove_dir_all(&path).ok();
                    } else {
                        std::fs::remove_file(&path).ok();
                    }
                }
            }
        }
    }
    Ok(())
}

fn walk_dirs(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut dirs = vec![root.to_path_buf()];
    let mut queue = vec![root.to_path_buf()];
    while let Some(dir) = queue.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
                queue.push(entry.path());
            }
        }
    }
    Ok(dirs)
}
