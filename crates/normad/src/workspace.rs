//! Workspace Manager (C4): mounts and retires the per-task git worktree that
//! every Step Executor invocation runs inside, and applies the final,
//! squash-merged result back onto the base branch with rollback on failure.

use crate::git;
use norma_core::{Id, Worktree};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error("working tree at {0} is not clean")]
    DirtyWorkingTree(PathBuf),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Branch name a task's workspace lives on: `norma/task/<id>`.
pub fn branch_for_task(task_id: &Id) -> String {
    format!("norma/task/{task_id}")
}

/// Mount (or re-mount) the workspace for `task_id`: ensure the task branch
/// exists off `base_branch`, evict any other worktree holding it, and check
/// it out at `workspace_dir`.
pub fn mount(
    repo_root: &Path,
    workspace_dir: &Path,
    task_id: &Id,
    base_branch: &str,
) -> Result<Worktree> {
    git::prune_worktrees(repo_root)?;

    let branch = branch_for_task(task_id);
    if let Some(stale_path) = git::worktree_holding_branch(repo_root, &branch)? {
        git::remove_worktree_force(repo_root, Path::new(&stale_path))?;
    }
    if workspace_dir.exists() {
        std::fs::remove_dir_all(workspace_dir).ok();
    }

    if !git::branch_exists(repo_root, &branch)? {
        git::create_branch(repo_root, &branch, base_branch)?;
    }

    git::add_worktree(repo_root, workspace_dir, &branch)?;

    let branch_head = git::rev_parse(workspace_dir, "HEAD")?;
    let base_head = git::rev_parse(repo_root, base_branch)?;
    if branch_head != base_head {
        if let Err(err) = git::merge_no_ff(workspace_dir, base_branch) {
            git::remove_worktree_force(repo_root, workspace_dir).ok();
            return Err(err.into());
        }
    }

    Ok(Worktree {
        task_id: task_id.clone(),
        branch,
        base_branch: base_branch.to_string(),
        path: workspace_dir.to_string_lossy().to_string(),
    })
}

/// Remove the worktree checkout for a task, keeping its branch intact so a
/// later run can re-mount and continue from the same history.
pub fn remove(repo_root: &Path, workspace_dir: &Path) -> Result<()> {
    if workspace_dir.exists() {
        git::remove_worktree_force(repo_root, workspace_dir)?;
    }
    Ok(())
}

/// Commit any pending changes inside a mounted workspace as a step checkpoint.
/// A no-op when the working tree is already clean.
pub fn commit_workspace(
    workspace_dir: &Path,
    run_id: &Id,
    task_id: &Id,
    step_index: u32,
) -> Result<bool> {
    if git::is_working_tree_clean(workspace_dir)? {
        return Ok(false);
    }
    git::add_all(workspace_dir)?;
    let message = format!("chore: do step {step_index:03}\n\nRun: {run_id}\nTask: {task_id}");
    git::commit(workspace_dir, &message)?;
    Ok(true)
}

/// Squash the task branch into `repo_root`'s current branch and commit with a
/// Conventional Commit message carrying `Run:`/`Task:` trailers. Restores
/// `repo_root` to its prior state (stash included) on any failure, or when
/// the squash merge yields no staged changes.
pub fn apply_changes(
    repo_root: &Path,
    task_id: &Id,
    run_id: &Id,
    step_index: u32,
    goal: &str,
) -> Result<bool> {
    let before = git::current_head(repo_root)?;
    let stashed = git::stash_push(repo_root)?;

    let branch = branch_for_task(task_id);
    let result = apply_changes_inner(repo_root, &branch, task_id, run_id, step_index, goal);

    match result {
        Ok(applied) => {
            if !applied && stashed {
                git::stash_pop(repo_root)?;
            }
            Ok(applied)
        }
        Err(err) => {
            git::reset_hard(repo_root, &before)?;
            if stashed {
                git::stash_pop(repo_root).ok();
            }
            Err(err)
        }
    }
}

fn apply_changes_inner(
    repo_root: &Path,
    branch: &str,
    task_id: &Id,
    run_id: &Id,
    step_index: u32,
    goal: &str,
) -> Result<bool> {
    git::merge_squash(repo_root, branch)?;
    if !git::has_staged_changes(repo_root)? {
        return Ok(false);
    }
    git::add_all(repo_root)?;
    let message = format!(
        "feat: {goal}\n\nRun: {run_id}\nTask: {task_id}\nStep: {step_index:03}"
    );
    git::commit(repo_root, &message)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::init_repo;

    #[test]
    fn mount_creates_branch_and_checkout() {
        let dir = init_repo();
        let task_id = Id::from_string("norma-hp");
        let workspace_dir = dir.path().join("ws");
        let worktree = mount(dir.path(), &workspace_dir, &task_id, "main").unwrap();
        assert_eq!(worktree.branch, "norma/task/norma-hp");
        assert!(workspace_dir.join("README.md").exists());
    }

    #[test]
    fn mount_is_idempotent_across_remounts() {
        let dir = init_repo();
        let task_id = Id::from_string("norma-hp");
        let workspace_dir = dir.path().join("ws");
        mount(dir.path(), &workspace_dir, &task_id, "main").unwrap();
        std::fs::write(workspace_dir.join("scratch.txt"), "x").unwrap();
        commit_workspace(&workspace_dir, &Id::from_string("20260101-000000-aaaaaa"), &task_id, 1).unwrap();
        remove(dir.path(), &workspace_dir).unwrap();
        let worktree = mount(dir.path(), &workspace_dir, &task_id, "main").unwrap();
        assert!(workspace_dir.join("scratch.txt").exists());
        assert_eq!(worktree.branch, "norma/task/norma-hp");
    }

    #[test]
    fn mount_merges_base_branch_advances_since_task_branch_created() {
        let dir = init_repo();
        let task_id = Id::from_string("norma-hp");
        let workspace_dir = dir.path().join("ws");
        mount(dir.path(), &workspace_dir, &task_id, "main").unwrap();
        remove(dir.path(), &workspace_dir).unwrap();

        std::fs::write(dir.path().join("upstream.txt"), "new on main").unwrap();
        crate::git::add_all(dir.path()).unwrap();
        crate::git::commit(dir.path(), "chore: advance main").unwrap();

        let worktree = mount(dir.path(), &workspace_dir, &task_id, "main").unwrap();
        assert_eq!(worktree.branch, "norma/task/norma-hp");
        assert!(workspace_dir.join("upstream.txt").exists());
    }

    #[test]
    fn commit_workspace_is_noop_on_clean_tree() {
        let dir = init_repo();
        let task_id = Id::from_string("norma-hp");
        let workspace_dir = dir.path().join("ws");
        mount(dir.path(), &workspace_dir, &task_id, "main").unwrap();
        let committed = commit_workspace(
            &workspace_dir,
            &Id::from_string("20260101-000000-aaaaaa"),
            &task_id,
            1,
        )
        .unwrap();
        assert!(!committed);
    }

    #[test]
    fn apply_changes_merges_workspace_commit_into_repo_root() {
        let dir = init_repo();
        let task_id = Id::from_string("norma-hp");
        let run_id = Id::from_string("20260101-000000-aaaaaa");
        let workspace_dir = dir.path().join("ws");
        mount(dir.path(), &workspace_dir, &task_id, "main").unwrap();
        std::fs::write(workspace_dir.join("feature.txt"), "done").unwrap();
        commit_workspace(&workspace_dir, &run_id, &task_id, 1).unwrap();

        let applied = apply_changes(dir.path(), &task_id, &run_id, 1, "add feature").unwrap();
        assert!(applied);
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn apply_changes_is_noop_when_nothing_staged() {
        let dir = init_repo();
        let task_id = Id::from_string("norma-hp");
        let run_id = Id::from_string("20260101-000000-aaaaaa");
        let workspace_dir = dir.path().join("ws");
        mount(dir.path(), &workspace_dir, &task_id, "main").unwrap();

        let applied = apply_changes(dir.path(), &task_id, &run_id, 1, "no-op").unwrap();
        assert!(!applied);
    }
}
