//! Tracker Gateway (C3): subprocess adapter over an external backlog process.
//!
//! Every verb is invoked as `<tracker_bin> <verb> --json --quiet [flags...]`;
//! stdout is parsed as JSON, a non-zero exit or invalid JSON becomes a
//! [`TrackerError`]. The gateway never assumes a specific tracker binary —
//! tests substitute a small fake script.

use norma_core::{Id, Task, TaskStatus, TaskType};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error invoking tracker: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracker exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
    #[error("invalid tracker json: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Adapter over the external tracker binary.
#[derive(Debug, Clone)]
pub struct Tracker {
    tracker_bin: PathBuf,
}

impl Tracker {
    pub fn new(tracker_bin: PathBuf) -> Self {
        Self { tracker_bin }
    }

    async fn invoke(&self, args: &[&str]) -> Result<serde_json::Value> {
        let mut full_args = args.to_vec();
        full_args.push("--json");
        full_args.push("--quiet");

        let output = Command::new(&self.tracker_bin)
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(TrackerError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn invoke_unit(&self, args: &[&str]) -> Result<()> {
        self.invoke(args).await?;
        Ok(())
    }

    pub async fn add(&self, task_type: TaskType, title: &str, description: &str) -> Result<Id> {
        let value = self
            .invoke(&["add", "--type", task_type.as_str(), "--title", title, "--description", description])
            .await?;
        Ok(Id::from_string(
            value["id"].as_str().unwrap_or_default().to_string(),
        ))
    }

    pub async fn add_epic(&self, title: &str, description: &str) -> Result<Id> {
        self.add(TaskType::Epic, title, description).await
    }

    pub async fn add_feature(&self, title: &str, description: &str, parent_id: &Id) -> Result<Id> {
        let value = self
            .invoke(&[
                "add",
                "--type",
                "feature",
                "--title",
                title,
                "--description",
                description,
                "--parent",
                parent_id.as_ref(),
            ])
            .await?;
        Ok(Id::from_string(
            value["id"].as_str().unwrap_or_default().to_string(),
        ))
    }

    pub async fn task(&self, task_id: &Id) -> Result<Task> {
        let value = self.invoke(&["task", task_id.as_ref()]).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        let value = self.invoke(&["list"]).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn children(&self, task_id: &Id) -> Result<Vec<Task>> {
        let value = self.invoke(&["children", task_id.as_ref()]).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Tasks whose dependencies are all closed and whose own status is open.
    pub async fn ready(&self) -> Result<Vec<Task>> {
        let value = self.invoke(&["ready"]).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Leaf (non epic/feature) tasks only, for the Selection Policy.
    pub async fn leaf_tasks(&self) -> Result<Vec<Task>> {
        let value = self.invoke(&["ready", "--leaf"]).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Apply the orchestrator-status → tracker-status(+label) mapping from
    /// `TaskStatus::tracker_status`/`tracker_label`.
    pub async fn mark_status(&self, task_id: &Id, status: TaskStatus) -> Result<()> {
        self.invoke_unit(&["update", task_id.as_ref(), "--status", status.tracker_status()])
            .await?;
        if let Some(label) = status.tracker_label() {
            self.add_label(task_id, label).await?;
        }
        Ok(())
    }

    pub async fn mark_done(&self, task_id: &Id) -> Result<()> {
        self.mark_status(task_id, TaskStatus::Done).await
    }

    pub async fn set_run(&self, task_id: &Id, run_id: &Id) -> Result<()> {
        self.invoke_unit(&["update", task_id.as_ref(), "--run", run_id.as_ref()])
            .await
    }

    pub async fn add_dependency(&self, task_id: &Id, depends_on: &Id) -> Result<()> {
        self.invoke_unit(&["update", task_id.as_ref(), "--depends-on", depends_on.as_ref()])
            .await
    }

    pub async fn add_label(&self, task_id: &Id, label: &str) -> Result<()> {
        self.invoke_unit(&["update", task_id.as_ref(), "--add-label", label])
            .await
    }

    pub async fn remove_label(&self, task_id: &Id, label: &str) -> Result<()> {
        self.invoke_unit(&["update", task_id.as_ref(), "--remove-label", label])
            .await
    }

    pub async fn set_notes(&self, task_id: &Id, notes: &str) -> Result<()> {
        self.invoke_unit(&["update", task_id.as_ref(), "--notes", notes])
            .await
    }

    pub async fn update(&self, task_id: &Id, field: &str, value: &str) -> Result<()> {
        self.invoke_unit(&["update", task_id.as_ref(), &format!("--{field}"), value])
            .await
    }

    pub async fn delete(&self, task_id: &Id) -> Result<()> {
        self.invoke_unit(&["delete", task_id.as_ref()]).await
    }
}

/// Write a tiny fake tracker script for tests: a shell script that echoes
/// canned JSON for the `ready` verb and succeeds (with empty JSON) for
/// everything else.
#[cfg(test)]
fn write_fake_tracker(dir: &Path, ready_json: &str) -> PathBuf {
    let script_path = dir.join("fake-tracker.sh");
    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "ready" ]; then
  echo '{ready_json}'
elif [ "$1" = "add" ]; then
  echo '{{"id": "norma-new"}}'
else
  echo '{{}}'
fi
"#
    );
    std::fs::write(&script_path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ready_parses_fake_tracker_output() {
        let dir = TempDir::new().unwrap();
        let script = write_fake_tracker(
            dir.path(),
            r#"[{"id":"norma-hp","task_type":"task","parent_id":null,"priority":1,"status":"todo","labels":[],"notes":"","title":"t","description":"Objective: x\nArtifact: y\nVerify: z","acceptance_criteria":[],"created_at":"2026-01-01T00:00:00Z"}]"#,
        );
        let tracker = Tracker::new(script);
        let tasks = tracker.ready().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, Id::from_string("norma-hp"));
        assert!(tasks[0].has_ready_contract());
    }

    #[tokio::test]
    async fn add_parses_returned_id() {
        let dir = TempDir::new().unwrap();
        let script = write_fake_tracker(dir.path(), "[]");
        let tracker = Tracker::new(script);
        let id = tracker.add(TaskType::Task, "title", "description").await.unwrap();
        assert_eq!(id, Id::from_string("norma-new"));
    }

    #[tokio::test]
    async fn nonexistent_binary_reports_io_error() {
        let tracker = Tracker::new(PathBuf::from("/no/such/tracker-binary"));
        let result = tracker.ready().await;
        assert!(matches!(result, Err(TrackerError::Io(_))));
    }
}
