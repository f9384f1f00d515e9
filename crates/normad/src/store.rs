//! Embedded SQLite journal (C1 Store).
//!
//! Single writer connection, WAL journal mode, foreign keys on. All time
//! columns are RFC-3339 UTC strings rather than epoch millis, so a plain
//! `sqlite3` shell can read the journal without conversion.

use chrono::{DateTime, Utc};
use norma_core::events::EventPayload;
use norma_core::{Event, Id, Run, RunStatus, Step, StepStatus, Verdict};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(Id),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const MIGRATIONS: &[(&str, &str)] = &[("0001_init.sql", include_str!("../../../migrations/0001_init.sql"))];

/// Journal handle. Cheaply cloneable; all clones share one connection pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        // A single writer connection avoids SQLITE_BUSY under WAL without
        // needing an external retry loop; readers can still use the pool
        // for concurrent queries.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Applies each embedded migration file in order, recording its name in
    /// `schema_migrations` so a later `open()` skips it. The first migration
    /// creates `schema_migrations` itself, so its own statements always run
    /// unconditionally.
    async fn migrate(&self) -> Result<()> {
        for (name, migration_sql) in MIGRATIONS {
            let already_applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM schema_migrations WHERE name = ?1")
                    .bind(*name)
                    .fetch_optional(&self.pool)
                    .await
                    .unwrap_or(None);
            if already_applied.is_some() {
                continue;
            }

            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                sqlx::query(trimmed).execute(&self.pool).await?;
            }

            sqlx::query("INSERT OR REPLACE INTO schema_migrations (name, applied_at) VALUES (?1, ?2)")
                .bind(*name)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Insert a newly started Run and its `run_started` event, as one
    /// transaction.
    pub async fn create_run(&self, run: &Run, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO runs (id, task_id, goal, status, iteration, current_step_index,
                               verdict, run_dir, base_branch, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(run.task_id.as_ref())
        .bind(&run.goal)
        .bind(run.status.as_str())
        .bind(run.iteration)
        .bind(run.current_step_index)
        .bind(run.verdict.map(|v| v.as_str()))
        .bind(&run.run_dir)
        .bind(&run.base_branch)
        .bind(run.created_at.to_rfc3339())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert a Step row and its paired event (`step_committed` or
    /// `verdict`), and advance `runs.current_step_index`.
    pub async fn commit_step(&self, step: &Step, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO steps (run_id, step_index, role, iteration, status, step_dir,
                                started_at, ended_at, summary)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(step.run_id.as_ref())
        .bind(step.step_index)
        .bind(step.role.as_str())
        .bind(step.iteration)
        .bind(step.status.as_str())
        .bind(&step.step_dir)
        .bind(step.started_at.to_rfc3339())
        .bind(step.ended_at.to_rfc3339())
        .bind(&step.summary)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE runs SET current_step_index = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(step.step_index)
        .bind(Utc::now().to_rfc3339())
        .bind(step.run_id.as_ref())
        .execute(&mut *tx)
        .await?;

        insert_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Update mutable Run fields (status, iteration, verdict) and append an
    /// accompanying event.
    pub async fn update_run(
        &self,
        run_id: &Id,
        status: RunStatus,
        iteration: u32,
        verdict: Option<Verdict>,
        event: &Event,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = ?1, iteration = ?2, verdict = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(iteration)
        .bind(verdict.map(|v| v.as_str()))
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.as_ref())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id.clone()));
        }

        insert_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append a standalone event with no accompanying step/run mutation
    /// (e.g. `worktree_mounted`, `worktree_removed`, `escalated`).
    pub async fn append_event(&self, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_run_status(&self, run_id: &Id) -> Result<Option<Run>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, goal, status, iteration, current_step_index, verdict,
                   run_dir, base_branch, created_at
            FROM runs WHERE id = ?1
            "#,
        )
        .bind(run_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(row_to_run(&row)?))
    }

    pub async fn list_steps(&self, run_id: &Id) -> Result<Vec<Step>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_index, role, iteration, status, step_dir, started_at,
                   ended_at, summary
            FROM steps WHERE run_id = ?1 ORDER BY step_index ASC
            "#,
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step).collect()
    }

    pub async fn list_events(&self, run_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, seq, timestamp, event_type, message, payload
            FROM events WHERE run_id = ?1 ORDER BY seq ASC
            "#,
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Next sequence number for an event on this run, used by the
    /// Reconciler and Step Executor to append without a read-modify-write
    /// race (the caller holds the Run Lock for the whole step).
    pub async fn next_event_seq(&self, run_id: &Id) -> Result<u32> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS max_seq FROM events WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .fetch_one(&self.pool)
            .await?;
        let max_seq: i64 = row.try_get("max_seq")?;
        Ok(max_seq as u32 + 1)
    }

    pub async fn set_kv(&self, run_id: &Id, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_run (run_id, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(run_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(run_id.as_ref())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_kv(&self, run_id: &Id, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_run WHERE run_id = ?1 AND key = ?2")
            .bind(run_id.as_ref())
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }
}

async fn insert_event(tx: &mut sqlx::Transaction<'_, Sqlite>, event: &Event) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO events (run_id, seq, timestamp, event_type, message, payload)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(event.run_id.as_ref())
    .bind(event.seq)
    .bind(event.timestamp.to_rfc3339())
    .bind(&event.event_type)
    .bind(&event.message)
    .bind(event.payload.as_ref().map(|p| p.to_string()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Build an [`Event`] row from an [`EventPayload`], filling `event_type` and
/// `payload` consistently so callers never hand-write the event_type string.
pub fn event_from_payload(run_id: Id, seq: u32, message: impl Into<String>, payload: EventPayload) -> Event {
    Event {
        run_id,
        seq,
        timestamp: Utc::now(),
        event_type: payload.event_type().as_str().to_string(),
        message: message.into(),
        payload: Some(payload.to_json()),
    }
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<Run> {
    let status: String = row.try_get("status")?;
    let verdict: Option<String> = row.try_get("verdict")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Run {
        id: Id::from_string(row.try_get::<String, _>("id")?),
        task_id: Id::from_string(row.try_get::<String, _>("task_id")?),
        goal: row.try_get("goal")?,
        status: RunStatus::from_str(&status).unwrap_or(RunStatus::Running),
        iteration: row.try_get::<i64, _>("iteration")? as u32,
        current_step_index: row.try_get::<i64, _>("current_step_index")? as u32,
        verdict: verdict.and_then(|v| Verdict::from_str(&v).ok()),
        run_dir: row.try_get("run_dir")?,
        base_branch: row.try_get("base_branch")?,
        created_at: parse_rfc3339(&created_at),
    })
}

fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<Step> {
    use norma_core::Role;
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let ended_at: String = row.try_get("ended_at")?;
    Ok(Step {
        run_id: Id::from_string(row.try_get::<String, _>("run_id")?),
        step_index: row.try_get::<i64, _>("step_index")? as u32,
        role: Role::from_str(&role).unwrap_or(Role::Plan),
        iteration: row.try_get::<i64, _>("iteration")? as u32,
        status: StepStatus::from_str(&status).unwrap_or(StepStatus::Fail),
        step_dir: row.try_get("step_dir")?,
        started_at: parse_rfc3339(&started_at),
        ended_at: parse_rfc3339(&ended_at),
        summary: row.try_get("summary")?,
    })
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
    let timestamp: String = row.try_get("timestamp")?;
    let payload: Option<String> = row.try_get("payload")?;
    Ok(Event {
        run_id: Id::from_string(row.try_get::<String, _>("run_id")?),
        seq: row.try_get::<i64, _>("seq")? as u32,
        timestamp: parse_rfc3339(&timestamp),
        event_type: row.try_get("event_type")?,
        message: row.try_get("message")?,
        payload: payload.map(|p| serde_json::from_str(&p)).transpose()?,
    })
}

fn parse_rfc3339(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use norma_core::events::{RunStartedPayload, StepCommittedPayload};
    use norma_core::Role;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("journal.db")).await.unwrap();
        (dir, store)
    }

    fn sample_run(id: &str, task_id: &str) -> Run {
        Run {
            id: Id::from_string(id),
            task_id: Id::from_string(task_id),
            goal: "add README section".into(),
            status: RunStatus::Running,
            iteration: 1,
            current_step_index: 0,
            verdict: None,
            run_dir: format!("runs/{id}"),
            base_branch: "main".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_run_then_get_run_status_round_trips() {
        let (_dir, store) = open_store().await;
        let run = sample_run("20260101-000000-aaaaaa", "norma-hp");
        let event = event_from_payload(
            run.id.clone(),
            1,
            "run started",
            EventPayload::RunStarted(RunStartedPayload {
                run_id: run.id.clone(),
                task_id: run.task_id.clone(),
                goal: run.goal.clone(),
            }),
        );
        store.create_run(&run, &event).await.unwrap();

        let fetched = store.get_run_status(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.status, RunStatus::Running);

        let events = store.list_events(&run.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run_started");
    }

    #[tokio::test]
    async fn commit_step_advances_current_step_index() {
        let (_dir, store) = open_store().await;
        let run = sample_run("20260101-000000-bbbbbb", "norma-hp");
        let start_event = event_from_payload(
            run.id.clone(),
            1,
            "run started",
            EventPayload::RunStarted(RunStartedPayload {
                run_id: run.id.clone(),
                task_id: run.task_id.clone(),
                goal: run.goal.clone(),
            }),
        );
        store.create_run(&run, &start_event).await.unwrap();

        let step = Step {
            run_id: run.id.clone(),
            step_index: 1,
            role: Role::Plan,
            iteration: 1,
            status: StepStatus::Ok,
            step_dir: "runs/20260101-000000-bbbbbb/steps/001-plan".into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            summary: "planned".into(),
        };
        let step_event = event_from_payload(
            run.id.clone(),
            2,
            "step committed",
            EventPayload::StepCommitted(StepCommittedPayload {
                run_id: run.id.clone(),
                step_index: 1,
                role: "plan".into(),
                status: "ok".into(),
            }),
        );
        store.commit_step(&step, &step_event).await.unwrap();

        let fetched = store.get_run_status(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.current_step_index, 1);

        let steps = store.list_steps(&run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].role, Role::Plan);
    }

    #[tokio::test]
    async fn update_run_on_missing_run_errors() {
        let (_dir, store) = open_store().await;
        let run_id = Id::from_string("20260101-000000-cccccc");
        let event = event_from_payload(
            run_id.clone(),
            1,
            "run failed",
            EventPayload::Verdict(norma_core::events::VerdictPayload {
                run_id: run_id.clone(),
                verdict: None,
                message: "missing".into(),
            }),
        );
        let result = store.update_run(&run_id, RunStatus::Failed, 1, None, &event).await;
        assert!(matches!(result, Err(StoreError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn kv_run_upserts_by_key() {
        let (_dir, store) = open_store().await;
        let run = sample_run("20260101-000000-dddddd", "norma-hp");
        let event = event_from_payload(
            run.id.clone(),
            1,
            "run started",
            EventPayload::RunStarted(RunStartedPayload {
                run_id: run.id.clone(),
                task_id: run.task_id.clone(),
                goal: run.goal.clone(),
            }),
        );
        store.create_run(&run, &event).await.unwrap();

        store.set_kv(&run.id, "last_reconciled_dir", "steps/001-plan").await.unwrap();
        store.set_kv(&run.id, "last_reconciled_dir", "steps/002-do").await.unwrap();
        let value = store.get_kv(&run.id, "last_reconciled_dir").await.unwrap();
        assert_eq!(value, Some("steps/002-do".to_string()));
    }

    #[tokio::test]
    async fn next_event_seq_increments() {
        let (_dir, store) = open_store().await;
        let run = sample_run("20260101-000000-eeeeee", "norma-hp");
        assert_eq!(store.next_event_seq(&run.id).await.unwrap(), 1);
        let event = event_from_payload(
            run.id.clone(),
            1,
            "run started",
            EventPayload::RunStarted(RunStartedPayload {
                run_id: run.id.clone(),
                task_id: run.task_id.clone(),
                goal: run.goal.clone(),
            }),
        );
        store.create_run(&run, &event).await.unwrap();
        assert_eq!(store.next_event_seq(&run.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn append_event_adds_a_standalone_row_without_touching_steps_or_run() {
        let (_dir, store) = open_store().await;
        let run = sample_run("20260101-000000-ffffff", "norma-hp");
        let start_event = event_from_payload(
            run.id.clone(),
            1,
            "run started",
            EventPayload::RunStarted(RunStartedPayload {
                run_id: run.id.clone(),
                task_id: run.task_id.clone(),
                goal: run.goal.clone(),
            }),
        );
        store.create_run(&run, &start_event).await.unwrap();

        let seq = store.next_event_seq(&run.id).await.unwrap();
        let mounted_event = event_from_payload(
            run.id.clone(),
            seq,
            "worktree mounted",
            EventPayload::WorktreeMounted(norma_core::events::WorktreeMountedPayload {
                run_id: run.id.clone(),
                task_id: run.task_id.clone(),
                branch: "norma/task/norma-hp".into(),
                path: "runs/20260101-000000-ffffff/steps/001-plan/workspace".into(),
            }),
        );
        store.append_event(&mounted_event).await.unwrap();

        let events = store.list_events(&run.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "worktree_mounted");

        let fetched = store.get_run_status(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.current_step_index, 0);
    }
}
