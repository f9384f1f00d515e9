//! PDCA Controller (C8): drives one task's Plan→Do→Check→Act cycle to a
//! terminal outcome, re-planning on anything short of `close` until the Act
//! decision closes the loop or the iteration budget runs out.

use crate::step_executor::{StepError, StepExecutor};
use crate::store::event_from_payload;
use norma_core::events::{EscalatedPayload, EventPayload};
use norma_core::roles::{ActOutput, CheckOutput, RoleOutputBlock};
use norma_core::{roles, Decision, Role, Run, RunStatus, Task, TaskState, Verdict};
use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, StepError>;

/// Terminal outcome of a PDCA run: the effective Run status/verdict and the
/// iteration/step cursor the Run row should be persisted with.
pub struct PdcaOutcome {
    pub status: RunStatus,
    pub verdict: Option<Verdict>,
    pub final_iteration: u32,
    pub final_step_index: u32,
}

pub struct PdcaController<'a> {
    executor: &'a StepExecutor<'a>,
}

impl<'a> PdcaController<'a> {
    pub fn new(executor: &'a StepExecutor<'a>) -> Self {
        Self { executor }
    }

    /// Run the PDCA cycle for `task` within `run` until it reaches `terminal`.
    /// `run.iteration`/`run.current_step_index` are advanced in place so the
    /// caller can persist progress after every step if it wants to; the
    /// returned [`PdcaOutcome`] reflects their final values.
    pub async fn run(
        &self,
        run: &mut Run,
        task: &Task,
        task_state: &mut TaskState,
        max_iterations: u32,
        cancel: &CancellationToken,
    ) -> Result<PdcaOutcome> {
        let mut latest_check_verdict = latest_check_verdict(task_state);
        let mut latest_decision = latest_act_decision(task_state);
        let mut first_iteration = true;

        loop {
            if run.iteration > max_iterations {
                return Ok(self.terminal_budget_exhausted(run, latest_check_verdict, latest_decision));
            }

            let start = if first_iteration { starting_stage(task, task_state) } else { Role::Plan };
            first_iteration = false;

            if role_rank(start) <= role_rank(Role::Plan) {
                if self.run_role(run, task, task_state, Role::Plan, cancel).await?.is_none() {
                    return Ok(self.terminal(run, latest_check_verdict, latest_decision));
                }
            }
            if role_rank(start) <= role_rank(Role::Do) {
                if self.run_role(run, task, task_state, Role::Do, cancel).await?.is_none() {
                    return Ok(self.terminal(run, latest_check_verdict, latest_decision));
                }
            }
            if role_rank(start) <= role_rank(Role::Check) {
                match self.run_role(run, task, task_state, Role::Check, cancel).await? {
                    Some(outcome) => {
                        if let Some(RoleOutputBlock::Check(check_output)) = &outcome.response.output {
                            latest_check_verdict = Some(verdict_of(check_output));
                        }
                    }
                    None => return Ok(self.terminal(run, latest_check_verdict, latest_decision)),
                }
            }
            match self.run_role(run, task, task_state, Role::Act, cancel).await? {
                Some(outcome) => {
                    if let Some(RoleOutputBlock::Act(act_output)) = &outcome.response.output {
                        latest_decision = Some(act_output.decision);
                    }
                }
                None => return Ok(self.terminal(run, latest_check_verdict, latest_decision)),
            }

            if latest_decision == Some(Decision::Close) {
                return Ok(self.terminal(run, latest_check_verdict, latest_decision));
            }
            run.iteration += 1;
        }
    }

    /// Execute one role step. `Ok(None)` means the step escalated (agent
    /// returned a non-ok status, or otherwise failed) and the caller should
    /// terminate; `Err` is a hard execution error that propagates to the
    /// Loop Controller.
    async fn run_role(
        &self,
        run: &mut Run,
        task: &Task,
        task_state: &mut TaskState,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<Option<crate::step_executor::StepOutcome>> {
        match self.executor.execute(run, task, task_state, role, cancel).await {
            Ok(outcome) => {
                run.current_step_index = outcome.step.step_index;
                Ok(Some(outcome))
            }
            Err(StepError::StepFailed { step, reason, .. }) => {
                run.current_step_index = step.step_index;
                self.emit_escalated(&run.id, &reason).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort event append for a step escalation (Section 7): never
    /// fails the caller, since the step's `fail` row is already committed.
    async fn emit_escalated(&self, run_id: &norma_core::Id, reason: &str) {
        let seq = match self.executor.store.next_event_seq(run_id).await {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(error = %e, "failed to allocate event seq for escalation");
                return;
            }
        };
        let event = event_from_payload(
            run_id.clone(),
            seq,
            "step escalated".to_string(),
            EventPayload::Escalated(EscalatedPayload { run_id: run_id.clone(), reason: reason.to_string() }),
        );
        if let Err(e) = self.executor.store.append_event(&event).await {
            tracing::warn!(error = %e, "failed to append escalation event");
        }
    }

    fn terminal(&self, run: &Run, verdict: Option<Verdict>, decision: Option<Decision>) -> PdcaOutcome {
        let effective = effective_verdict(verdict, decision);
        PdcaOutcome {
            status: status_for(effective),
            verdict: effective,
            final_iteration: run.iteration,
            final_step_index: run.current_step_index,
        }
    }

    /// Terminal outcome for `max_iterations` exhaustion (Section 4.8): always
    /// `stopped`, regardless of the last Check verdict — unlike the
    /// decision==close/escalation paths, a budget cutoff is not itself a
    /// verdict on the work. The verdict field still carries the last Check
    /// outcome, if any, for the terminal event's record.
    fn terminal_budget_exhausted(
        &self,
        run: &Run,
        verdict: Option<Verdict>,
        decision: Option<Decision>,
    ) -> PdcaOutcome {
        PdcaOutcome {
            status: RunStatus::Stopped,
            verdict: effective_verdict(verdict, decision),
            final_iteration: run.iteration,
            final_step_index: run.current_step_index,
        }
    }
}

fn role_rank(role: Role) -> u8 {
    match role {
        Role::Plan => 0,
        Role::Do => 1,
        Role::Check => 2,
        Role::Act => 3,
    }
}

/// Enforce the Verdict rule at the orchestrator layer (Section 4.6) rather
/// than trusting the agent's self-reported `verdict.status`.
fn verdict_of(check_output: &CheckOutput) -> Verdict {
    roles::derive_verdict(&check_output.acceptance_results, &check_output.plan_match)
}

fn latest_check_verdict(task_state: &TaskState) -> Option<Verdict> {
    task_state
        .outputs
        .check
        .clone()
        .and_then(|v| serde_json::from_value::<CheckOutput>(v).ok())
        .map(|c| verdict_of(&c))
}

fn latest_act_decision(task_state: &TaskState) -> Option<Decision> {
    task_state
        .outputs
        .act
        .clone()
        .and_then(|v| serde_json::from_value::<ActOutput>(v).ok())
        .map(|a| a.decision)
}

/// Effective verdict at termination: the latest Check verdict, uppercased
/// (the type already carries this); when there is none and the Act decision
/// was `close`, treat the outcome as PASS.
fn effective_verdict(verdict: Option<Verdict>, decision: Option<Decision>) -> Option<Verdict> {
    match verdict {
        Some(v) => Some(v),
        None if decision == Some(Decision::Close) => Some(Verdict::Pass),
        None => None,
    }
}

fn status_for(effective_verdict: Option<Verdict>) -> RunStatus {
    match effective_verdict {
        Some(Verdict::Pass) => RunStatus::Passed,
        Some(Verdict::Fail) => RunStatus::Failed,
        Some(Verdict::Partial) | None => RunStatus::Stopped,
    }
}

/// Restartability (Section 4.8): which role to resume at, based on the
/// `norma-has-plan|do|check` labels and what TaskState already holds. Only
/// consulted for the first iteration a [`PdcaController`] enters — every
/// later iteration in the same run starts fresh at `Plan`.
fn starting_stage(task: &Task, task_state: &TaskState) -> Role {
    let has_label = |label: &str| task.labels.iter().any(|l| l == label);

    if !has_label("norma-has-plan") || task_state.outputs.plan.is_none() {
        return Role::Plan;
    }
    if !has_label("norma-has-do") || task_state.outputs.do_.is_none() {
        return Role::Do;
    }
    if !has_label("norma-has-check") {
        return Role::Check;
    }

    // `norma-has-check` is set, but a Do since the last Check invalidates it:
    // re-run Check rather than trusting a stale verdict.
    match (task_state.last_entry_for(Role::Do), task_state.last_entry_for(Role::Check)) {
        (Some(do_entry), Some(check_entry)) if do_entry.timestamp > check_entry.timestamp => Role::Check,
        (Some(_), None) => Role::Check,
        _ => Role::Act,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::init_repo;
    use crate::store::Store;
    use crate::tracker::Tracker;
    use chrono::Utc;
    use norma_core::{Config, Id, TaskType};
    use std::path::PathBuf;

    fn sample_task(labels: Vec<&str>) -> Task {
        Task {
            id: Id::from_string("norma-hp"),
            task_type: TaskType::Task,
            parent_id: None,
            priority: 0,
            status: "open".into(),
            labels: labels.into_iter().map(String::from).collect(),
            notes: String::new(),
            title: "add readme section".into(),
            description: "Objective: x\nArtifact: y\nVerify: z".into(),
            acceptance_criteria: vec!["AC1: file exists".into()],
            created_at: Utc::now(),
        }
    }

    fn write_fake_agent(dir: &std::path::Path, name: &str, response_json: &str) -> PathBuf {
        let script_path = dir.join(name);
        let script = format!("#!/bin/sh\ncat >/dev/null\necho '{response_json}'\n");
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

    fn write_fake_tracker(dir: &std::path::Path) -> PathBuf {
        let script_path = dir.join("fake-tracker.sh");
        std::fs::write(&script_path, "#!/bin/sh\necho '{}'\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    const PLAN_OK: &str = r#"{
        "status": "ok",
        "summary": {"text": "planned"},
        "progress": {"title": "planned", "details": []},
        "plan": {
            "acceptance_criteria": [{"id": "AC1", "text": "x", "verify_cmd": "true", "expected_exit_codes": [0]}],
            "work_plan": {"timebox": "30m", "do_steps": [], "check_steps": [], "stop_triggers": []}
        }
    }"#;
    const DO_OK: &str = r#"{
        "status": "ok",
        "summary": {"text": "did it"},
        "progress": {"title": "did it", "details": []},
        "do": {"execution": {"executed_step_ids": [], "skipped_step_ids": [], "commands": []}, "blockers": []}
    }"#;
    fn check_response(status: &str) -> String {
        format!(
            r#"{{
            "status": "ok",
            "summary": {{"text": "checked"}},
            "progress": {{"title": "checked", "details": []}},
            "check": {{
                "plan_match": {{"do_steps": {{"planned_ids": [], "executed_ids": [], "missing_ids": [], "unexpected_ids": []}},
                                  "commands": {{"planned_ids": [], "executed_ids": [], "missing_ids": [], "unexpected_ids": []}}}},
                "acceptance_results": [{{"ac_id": "AC1", "result": "{status}", "notes": "", "log_ref": ""}}],
                "verdict": {{"status": "{status2}", "recommendation": "continue", "basis": ""}}
            }}
        }}"#,
            status = status,
            status2 = if status == "PASS" { "PASS" } else { "FAIL" }
        )
    }
    fn act_response(decision: &str) -> String {
        format!(
            r#"{{
            "status": "ok",
            "summary": {{"text": "acted"}},
            "progress": {{"title": "acted", "details": []}},
            "act": {{"decision": "{decision}", "rationale": "", "next": {{"recommended": "", "notes": ""}}}}
        }}"#
        )
    }

    fn make_run(repo_root: &std::path::Path) -> Run {
        Run {
            id: Id::from_string("20260101-000000-aaaaaa"),
            task_id: Id::from_string("norma-hp"),
            goal: "add readme section".into(),
            status: RunStatus::Running,
            iteration: 1,
            current_step_index: 0,
            verdict: None,
            run_dir: repo_root.join("runs/20260101-000000-aaaaaa").to_string_lossy().to_string(),
            base_branch: "main".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn happy_path_closes_on_first_iteration_with_pass_verdict() {
        let repo = init_repo();
        let store = Store::open(&repo.path().join(".norma/journal.db")).await.unwrap();
        let tracker = Tracker::new(write_fake_tracker(repo.path()));
        let mut config = Config::default();
        config.repo_root = repo.path().to_path_buf();
        config.agent_commands.insert("plan".into(), write_fake_agent(repo.path(), "plan.sh", PLAN_OK).to_string_lossy().to_string());
        config.agent_commands.insert("do".into(), write_fake_agent(repo.path(), "do.sh", DO_OK).to_string_lossy().to_string());
        config
            .agent_commands
            .insert("check".into(), write_fake_agent(repo.path(), "check.sh", &check_response("PASS")).to_string_lossy().to_string());
        config
            .agent_commands
            .insert("act".into(), write_fake_agent(repo.path(), "act.sh", &act_response("close")).to_string_lossy().to_string());

        let executor = StepExecutor::new(&store, &tracker, &config);
        let controller = PdcaController::new(&executor);

        let mut run = make_run(repo.path());
        let task = sample_task(vec![]);
        let mut task_state = TaskState::default();

        let outcome = controller
            .run(&mut run, &task, &mut task_state, 10, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Passed);
        assert_eq!(outcome.verdict, Some(Verdict::Pass));
        assert_eq!(outcome.final_iteration, 1);
        assert_eq!(run.current_step_index, 4);
    }

    #[tokio::test]
    async fn replan_loop_runs_a_second_iteration_then_closes() {
        let repo = init_repo();
        let store = Store::open(&repo.path().join(".norma/journal.db")).await.unwrap();
        let tracker = Tracker::new(write_fake_tracker(repo.path()));
        let mut config = Config::default();
        config.repo_root = repo.path().to_path_buf();
        config.agent_commands.insert("plan".into(), write_fake_agent(repo.path(), "plan.sh", PLAN_OK).to_string_lossy().to_string());
        config.agent_commands.insert("do".into(), write_fake_agent(repo.path(), "do.sh", DO_OK).to_string_lossy().to_string());
        config
            .agent_commands
            .insert("check".into(), write_fake_agent(repo.path(), "check.sh", &check_response("PASS")).to_string_lossy().to_string());

        // Act flips from replan to close on the second attempt: a shared
        // counter file tracks which invocation we're on.
        let act_script = repo.path().join("act.sh");
        std::fs::write(
            &act_script,
            format!(
                "#!/bin/sh\ncat >/dev/null\ncounter={}/act.count\nif [ ! -f \"$counter\" ]; then\n  echo x > \"$counter\"\n  echo '{}'\nelse\n  echo '{}'\nfi\n",
                repo.path().display(),
                act_response("replan"),
                act_response("close"),
            ),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&act_script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&act_script, perms).unwrap();
        }
        config.agent_commands.insert("act".into(), act_script.to_string_lossy().to_string());

        let executor = StepExecutor::new(&store, &tracker, &config);
        let controller = PdcaController::new(&executor);

        let mut run = make_run(repo.path());
        let task = sample_task(vec![]);
        let mut task_state = TaskState::default();

        let outcome = controller
            .run(&mut run, &task, &mut task_state, 10, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Passed);
        assert_eq!(outcome.final_iteration, 2);
        assert_eq!(run.current_step_index, 8);
    }

    #[tokio::test]
    async fn budget_exhaustion_stops_without_a_check_verdict() {
        let repo = init_repo();
        let store = Store::open(&repo.path().join(".norma/journal.db")).await.unwrap();
        let tracker = Tracker::new(write_fake_tracker(repo.path()));
        let mut config = Config::default();
        config.repo_root = repo.path().to_path_buf();
        config.agent_commands.insert("plan".into(), write_fake_agent(repo.path(), "plan.sh", PLAN_OK).to_string_lossy().to_string());
        config.agent_commands.insert("do".into(), write_fake_agent(repo.path(), "do.sh", DO_OK).to_string_lossy().to_string());
        config
            .agent_commands
            .insert("check".into(), write_fake_agent(repo.path(), "check.sh", &check_response("FAIL")).to_string_lossy().to_string());
        config
            .agent_commands
            .insert("act".into(), write_fake_agent(repo.path(), "act.sh", &act_response("replan")).to_string_lossy().to_string());

        let executor = StepExecutor::new(&store, &tracker, &config);
        let controller = PdcaController::new(&executor);

        let mut run = make_run(repo.path());
        let task = sample_task(vec![]);
        let mut task_state = TaskState::default();

        let outcome = controller
            .run(&mut run, &task, &mut task_state, 2, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert_eq!(outcome.verdict, Some(Verdict::Fail));
        assert_eq!(outcome.final_iteration, 3);
    }

    #[tokio::test]
    async fn non_ok_role_response_escalates_to_stopped() {
        let repo = init_repo();
        let store = Store::open(&repo.path().join(".norma/journal.db")).await.unwrap();
        let tracker = Tracker::new(write_fake_tracker(repo.path()));
        let mut config = Config::default();
        config.repo_root = repo.path().to_path_buf();
        let stop_response = r#"{"status": "stop", "stop_reason": "blocked", "summary": {"text": "blocked"}, "progress": {"title": "blocked", "details": []}}"#;
        config
            .agent_commands
            .insert("plan".into(), write_fake_agent(repo.path(), "plan.sh", stop_response).to_string_lossy().to_string());

        let executor = StepExecutor::new(&store, &tracker, &config);
        let controller = PdcaController::new(&executor);

        let mut run = make_run(repo.path());
        let task = sample_task(vec![]);
        let mut task_state = TaskState::default();

        let outcome = controller
            .run(&mut run, &task, &mut task_state, 10, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert_eq!(outcome.verdict, None);
    }

    #[test]
    fn starting_stage_skips_to_doing_when_plan_already_recorded() {
        let task = sample_task(vec!["norma-has-plan"]);
        let mut task_state = TaskState::default();
        task_state.outputs.plan = Some(serde_json::json!({}));
        assert_eq!(starting_stage(&task, &task_state), Role::Do);
    }

    #[test]
    fn starting_stage_reruns_check_when_do_postdates_it() {
        let task = sample_task(vec!["norma-has-plan", "norma-has-do", "norma-has-check"]);
        let mut task_state = TaskState::default();
        task_state.outputs.plan = Some(serde_json::json!({}));
        task_state.outputs.do_ = Some(serde_json::json!({}));
        let earlier = Utc::now() - chrono::Duration::minutes(5);
        task_state.journal.push(norma_core::JournalEntry {
            timestamp: earlier,
            run_id: Id::from_string("20260101-000000-aaaaaa"),
            iteration: 1,
            step_index: 3,
            role: Role::Check,
            status: norma_core::StepStatus::Ok,
            stop_reason: None,
            title: "checked".into(),
            details: vec![],
        });
        task_state.journal.push(norma_core::JournalEntry {
            timestamp: Utc::now(),
            run_id: Id::from_string("20260101-000000-aaaaaa"),
            iteration: 1,
            step_index: 4,
            role: Role::Do,
            status: norma_core::StepStatus::Ok,
            stop_reason: None,
            title: "redid it".into(),
            details: vec![],
        });
        assert_eq!(starting_stage(&task, &task_state), Role::Check);
    }

    #[test]
    fn starting_stage_skips_to_acting_when_check_is_current() {
        let task = sample_task(vec!["norma-has-plan", "norma-has-do", "norma-has-check"]);
        let mut task_state = TaskState::default();
        task_state.outputs.plan = Some(serde_json::json!({}));
        task_state.outputs.do_ = Some(serde_json::json!({}));
        task_state.journal.push(norma_core::JournalEntry {
            timestamp: Utc::now(),
            run_id: Id::from_string("20260101-000000-aaaaaa"),
            iteration: 1,
            step_index: 2,
            role: Role::Do,
            status: norma_core::StepStatus::Ok,
            stop_reason: None,
            title: "did it".into(),
            details: vec![],
        });
        task_state.journal.push(norma_core::JournalEntry {
            timestamp: Utc::now(),
            run_id: Id::from_string("20260101-000000-aaaaaa"),
            iteration: 1,
            step_index: 3,
            role: Role::Check,
            status: norma_core::StepStatus::Ok,
            stop_reason: None,
            title: "checked".into(),
            details: vec![],
        });
        assert_eq!(starting_stage(&task, &task_state), Role::Act);
    }
}
