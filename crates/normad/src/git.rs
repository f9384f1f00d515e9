//! Low-level git command wrappers shared by the Workspace Manager (C4).
//!
//! Every function shells out to the system `git` binary; there is no git
//! library dependency, matching the reference daemon's approach to worktree
//! management.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run(repo_root: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .map_err(GitError::from)
}

fn run_ok(repo_root: &Path, args: &[&str]) -> Result<()> {
    let output = run(repo_root, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git {}: {stderr}", args.join(" "))));
    }
    Ok(())
}

pub fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let output = run(repo_root, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])?;
    Ok(output.status.success())
}

pub fn create_branch(repo_root: &Path, branch: &str, base: &str) -> Result<()> {
    run_ok(repo_root, &["branch", branch, base])
}

/// Path of the worktree currently holding `branch`, if any other than `repo_root`.
pub fn worktree_holding_branch(repo_root: &Path, branch: &str) -> Result<Option<String>> {
    let output = run(repo_root, &["worktree", "list", "--porcelain"])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git worktree list: {stderr}")));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut current_path: Option<&str> = None;
    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            current_path = Some(path);
        } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
            if b == branch {
                return Ok(current_path.map(str::to_string));
            }
        }
    }
    Ok(None)
}

pub fn prune_worktrees(repo_root: &Path) -> Result<()> {
    run_ok(repo_root, &["worktree", "prune"])
}

pub fn add_worktree(repo_root: &Path, worktree_path: &Path, branch: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    run_ok(
        repo_root,
        &["worktree", "add", &worktree_path.to_string_lossy(), branch],
    )
}

pub fn remove_worktree_force(repo_root: &Path, worktree_path: &Path) -> Result<()> {
    run_ok(
        repo_root,
        &["worktree", "remove", "--force", &worktree_path.to_string_lossy()],
    )
}

pub fn is_working_tree_clean(repo_root: &Path) -> Result<bool> {
    let output = run(repo_root, &["status", "--porcelain"])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git status: {stderr}")));
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().is_empty())
}

/// Resolve `rev` (a branch name, tag, or commit-ish) to its commit hash.
pub fn rev_parse(repo_root: &Path, rev: &str) -> Result<String> {
    let output = run(repo_root, &["rev-parse", rev])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git rev-parse {rev}: {stderr}")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn current_head(repo_root: &Path) -> Result<String> {
    let output = run(repo_root, &["rev-parse", "HEAD"])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git rev-parse HEAD: {stderr}")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Name of the currently checked-out branch in `repo_root`, used by the Loop
/// Controller to capture a run's base branch at dispatch time.
pub fn current_branch(repo_root: &Path) -> Result<String> {
    let output = run(repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git rev-parse --abbrev-ref HEAD: {stderr}")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn stash_push(repo_root: &Path) -> Result<bool> {
    if is_working_tree_clean(repo_root)? {
        return Ok(false);
    }
    run_ok(repo_root, &["stash", "push", "--include-untracked"])?;
    Ok(true)
}

pub fn stash_pop(repo_root: &Path) -> Result<()> {
    run_ok(repo_root, &["stash", "pop"])
}

pub fn reset_hard(repo_root: &Path, commit: &str) -> Result<()> {
    run_ok(repo_root, &["reset", "--hard", commit])
}

pub fn add_all(repo_root: &Path) -> Result<()> {
    run_ok(repo_root, &["add", "-A"])
}

pub fn has_staged_changes(repo_root: &Path) -> Result<bool> {
    let output = run(repo_root, &["diff", "--cached", "--quiet"])?;
    Ok(!output.status.success())
}

pub fn commit(repo_root: &Path, message: &str) -> Result<()> {
    run_ok(repo_root, &["commit", "-m", message])
}

pub fn merge_squash(repo_root: &Path, branch: &str) -> Result<()> {
    let output = run(repo_root, &["merge", "--squash", branch])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::MergeConflict(format!("squash merge from {branch} failed: {stderr}")));
    }
    Ok(())
}

pub fn merge_no_ff(repo_root: &Path, branch: &str) -> Result<()> {
    let output = run(repo_root, &["merge", branch, "--no-edit"])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::MergeConflict(format!("merge from {branch} failed: {stderr}")));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        Command::new("git").args(["init", "-b", "main"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["config", "user.email", "test@test.com"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["config", "user.name", "Test"]).current_dir(dir.path()).output().unwrap();
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "initial"]).current_dir(dir.path()).output().unwrap();
        dir
    }
}
