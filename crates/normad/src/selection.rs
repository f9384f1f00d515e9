//! Selection Policy (part of the Loop Controller, C9 §4.9): picks the next
//! ready task deterministically so two orchestrators given the same tracker
//! state always choose the same task.

use crate::tracker::{Tracker, TrackerError};
use norma_core::{Config, Id, Task, TASK_ID_REGEX};
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

pub type Result<T> = std::result::Result<T, SelectionError>;

/// Choose the next task to dispatch, applying the filter-then-sort policy in
/// order: id regex, non-parent-only type; active feature/epic scope; leaf
/// preference; Ready Contract preference; then priority/verify/age/id sort.
/// Returns the chosen task alongside a human-readable explanation.
pub async fn select_next_ready(tracker: &Tracker, config: &Config) -> Result<Option<(Task, String)>> {
    let id_pattern = Regex::new(TASK_ID_REGEX).expect("TASK_ID_REGEX is a valid pattern");

    let candidates: Vec<Task> = tracker
        .ready()
        .await?
        .into_iter()
        .filter(|t| t.status == "open")
        .filter(|t| !t.task_type.is_parent_only())
        .filter(|t| id_pattern.is_match(t.id.as_ref()))
        .collect();

    if candidates.is_empty() {
        return Ok(None);
    }

    let (scoped, scope_reason) = scope_to_active_parent(tracker, &candidates, config).await?;

    let mut leaves = Vec::new();
    for task in &scoped {
        if tracker.children(&task.id).await?.is_empty() {
            leaves.push(task.clone());
        }
    }
    let (pool, leaf_reason) = if leaves.is_empty() {
        (scoped, "no leaf candidates in scope, considering parent-capable tasks")
    } else {
        (leaves, "prefers leaf tasks")
    };

    let with_contract: Vec<Task> = pool.iter().filter(|t| t.has_ready_contract()).cloned().collect();
    let (pool, contract_reason) = if with_contract.is_empty() {
        (pool, "no candidate carries a full Ready Contract")
    } else {
        (with_contract, "prefers tasks with a Ready Contract")
    };

    let mut sorted = pool;
    sorted.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.has_verify_marker().cmp(&a.has_verify_marker()))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.as_ref().cmp(b.id.as_ref()))
    });

    let chosen = sorted.into_iter().next().expect("pool was checked non-empty above");
    let reason = format!(
        "selected {} (priority {}): {scope_reason}; {leaf_reason}; {contract_reason}",
        chosen.id, chosen.priority
    );
    Ok(Some((chosen, reason)))
}

async fn scope_to_active_parent(
    tracker: &Tracker,
    candidates: &[Task],
    config: &Config,
) -> Result<(Vec<Task>, &'static str)> {
    if let Some(feature_id) = &config.active_feature_id {
        let under_feature = filter_under_ancestor(tracker, candidates, feature_id).await?;
        if !under_feature.is_empty() {
            return Ok((under_feature, "under active_feature_id"));
        }
    }
    if let Some(epic_id) = &config.active_epic_id {
        let under_epic = filter_under_ancestor(tracker, candidates, epic_id).await?;
        if !under_epic.is_empty() {
            return Ok((under_epic, "under active_epic_id"));
        }
    }
    Ok((candidates.to_vec(), "no active feature/epic scope matched"))
}

async fn filter_under_ancestor(tracker: &Tracker, candidates: &[Task], ancestor_id: &Id) -> Result<Vec<Task>> {
    let mut out = Vec::new();
    for task in candidates {
        if is_under_ancestor(tracker, &task.id, ancestor_id).await? {
            out.push(task.clone());
        }
    }
    Ok(out)
}

/// Walk `task_id`'s ancestry via `Tracker.task()`, stopping at a cycle
/// (a malformed tracker could otherwise loop forever).
async fn is_under_ancestor(tracker: &Tracker, task_id: &Id, ancestor_id: &Id) -> Result<bool> {
    let mut current = task_id.clone();
    let mut visited = HashSet::new();
    loop {
        if &current == ancestor_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            return Ok(false);
        }
        let task = tracker.task(&current).await?;
        match task.parent_id {
            Some(parent) => current = parent,
            None => return Ok(false),
        }
    }
}
