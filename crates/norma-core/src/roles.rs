//! Role Contracts (C6): per-role request/response shapes, the request builder,
//! and response validation — including the Verdict derivation rule.
//!
//! "JSON Schema" per role is realized here as a `serde_json::Value` constant
//! (see [`input_schema`]/[`output_schema`]) rather than a generic schema
//! validator: the response shapes are statically known Rust types, so
//! validation is field-presence/variant checking, not generic schema
//! interpretation.

use crate::id::Id;
use crate::types::{Decision, Role, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoleError {
    #[error("malformed response JSON: {0}")]
    MalformedJson(String),
    #[error("unknown status value: {0}")]
    UnknownStatus(String),
    #[error("status=ok response is missing the {0} role output block")]
    MissingRoleBlock(&'static str),
    #[error("status={0} response is missing stop_reason")]
    MissingStopReason(&'static str),
}

// --- Request ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub id: Id,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub id: Id,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsBlock {
    pub workspace_dir: String,
    pub run_dir: String,
    pub progress: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetsBlock {
    pub max_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wall_time_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_failed_checks: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBlock {
    pub facts: Vec<String>,
    pub links: Vec<String>,
    pub attempt: u32,
}

/// Prior role outputs available to later roles in the same iteration (Do needs
/// Plan, Check needs Plan+Do, Act needs Check).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorOutputs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_: Option<DoOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRequest {
    pub run: RunContext,
    pub task: TaskContext,
    pub step: StepContext,
    pub paths: PathsBlock,
    pub budgets: BudgetsBlock,
    pub stop_reasons_allowed: Vec<String>,
    pub context: ContextBlock,
    pub role: Role,
    pub prior: PriorOutputs,
}

/// Build the request JSON for `role`, including whatever prior outputs that
/// role's contract requires (Section 4.7, step 5).
pub fn build_request(
    run: RunContext,
    task: TaskContext,
    step: StepContext,
    paths: PathsBlock,
    budgets: BudgetsBlock,
    stop_reasons_allowed: Vec<String>,
    context: ContextBlock,
    role: Role,
    prior: PriorOutputs,
) -> RoleRequest {
    RoleRequest {
        run,
        task,
        step,
        paths,
        budgets,
        stop_reasons_allowed,
        context,
        role,
        prior,
    }
}

// --- Response: common fields ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Stop,
    Error,
}

impl ResponseStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Stop => "stop",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub title: String,
    pub details: Vec<String>,
}

// --- Role-specific output blocks ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCriterionSpec {
    pub id: String,
    pub text: String,
    pub verify_cmd: String,
    pub expected_exit_codes: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCommand {
    pub id: String,
    pub cmd: String,
    pub expect_exit_codes: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoStepSpec {
    pub id: String,
    pub text: String,
    pub commands: Vec<PlanCommand>,
    pub targets_ac_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStepSpec {
    pub id: String,
    pub text: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPlan {
    pub timebox: String,
    pub do_steps: Vec<DoStepSpec>,
    pub check_steps: Vec<CheckStepSpec>,
    pub stop_triggers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutput {
    pub acceptance_criteria: Vec<AcceptanceCriterionSpec>,
    pub work_plan: WorkPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedCommand {
    pub id: String,
    pub cmd: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub executed_step_ids: Vec<String>,
    pub skipped_step_ids: Vec<String>,
    pub commands: Vec<ExecutedCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoOutput {
    pub execution: Execution,
    pub blockers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdSetMatch {
    pub planned_ids: Vec<String>,
    pub executed_ids: Vec<String>,
    pub missing_ids: Vec<String>,
    pub unexpected_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMatch {
    pub do_steps: IdSetMatch,
    pub commands: IdSetMatch,
}

impl PlanMatch {
    fn has_mismatch(&self) -> bool {
        !self.do_steps.missing_ids.is_empty()
            || !self.do_steps.unexpected_ids.is_empty()
            || !self.commands.missing_ids.is_empty()
            || !self.commands.unexpected_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AcceptanceResultStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceResult {
    pub ac_id: String,
    pub result: AcceptanceResultStatus,
    pub notes: String,
    pub log_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Standardize,
    Replan,
    Rollback,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictBlock {
    pub status: Verdict,
    pub recommendation: Recommendation,
    pub basis: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutput {
    pub plan_match: PlanMatch,
    pub acceptance_results: Vec<AcceptanceResult>,
    pub verdict: VerdictBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextBlock {
    pub recommended: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActOutput {
    pub decision: Decision,
    pub rationale: String,
    pub next: NextBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleOutputBlock {
    Plan(PlanOutput),
    Do(DoOutput),
    Check(CheckOutput),
    Act(ActOutput),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRoleResponse {
    pub status: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub plan: Option<PlanOutput>,
    #[serde(default)]
    pub do_: Option<DoOutput>,
    #[serde(default)]
    pub check: Option<CheckOutput>,
    #[serde(default)]
    pub act: Option<ActOutput>,
}

#[derive(Debug, Clone)]
pub struct RoleResponse {
    pub status: ResponseStatus,
    pub stop_reason: Option<String>,
    pub summary: Summary,
    pub progress: Progress,
    pub output: Option<RoleOutputBlock>,
}

/// Extract the agent response JSON from raw stdout: first `{` to last `}`,
/// per the agent invocation ABI (Section 6).
pub fn extract_response_json(stdout: &str) -> Option<&str> {
    let start = stdout.find('{')?;
    let end = stdout.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&stdout[start..=end])
}

/// Parse and validate a role response against the role it was produced for.
///
/// Rejects: unknown status values, `ok` without the matching role block, and
/// malformed JSON (Section 4.6, Response validation).
pub fn validate_response(role: Role, raw_json: &str) -> Result<RoleResponse, RoleError> {
    let raw: RawRoleResponse =
        serde_json::from_str(raw_json).map_err(|e| RoleError::MalformedJson(e.to_string()))?;

    let status = match raw.status.as_str() {
        "ok" => ResponseStatus::Ok,
        "stop" => ResponseStatus::Stop,
        "error" => ResponseStatus::Error,
        other => return Err(RoleError::UnknownStatus(other.to_string())),
    };

    if status != ResponseStatus::Ok && raw.stop_reason.is_none() {
        return Err(RoleError::MissingStopReason(status.as_str()));
    }

    let output = if status == ResponseStatus::Ok {
        let block = match role {
            Role::Plan => raw.plan.map(RoleOutputBlock::Plan).ok_or(RoleError::MissingRoleBlock("plan")),
            Role::Do => raw.do_.map(RoleOutputBlock::Do).ok_or(RoleError::MissingRoleBlock("do")),
            Role::Check => raw.check.map(RoleOutputBlock::Check).ok_or(RoleError::MissingRoleBlock("check")),
            Role::Act => raw.act.map(RoleOutputBlock::Act).ok_or(RoleError::MissingRoleBlock("act")),
        }?;
        Some(block)
    } else {
        None
    };

    Ok(RoleResponse {
        status,
        stop_reason: raw.stop_reason,
        summary: raw.summary,
        progress: raw.progress,
        output,
    })
}

/// Verdict rule (Section 4.6): any FAIL acceptance result wins; else any
/// missing/unexpected plan_match id set yields PARTIAL; else PASS.
pub fn derive_verdict(acceptance_results: &[AcceptanceResult], plan_match: &PlanMatch) -> Verdict {
    if acceptance_results
        .iter()
        .any(|r| r.result == AcceptanceResultStatus::Fail)
    {
        return Verdict::Fail;
    }
    if plan_match.has_mismatch() {
        return Verdict::Partial;
    }
    Verdict::Pass
}

/// Hand-authored input schema document for a role (not validated generically;
/// exposed so the Subprocess Runner can attach it to the request for agents
/// that introspect their own contract).
pub fn input_schema(role: Role) -> serde_json::Value {
    let mut required = vec!["run", "task", "step", "paths", "budgets", "context", "role"];
    let prior_required: &[&str] = match role {
        Role::Plan => &[],
        Role::Do => &["prior.plan"],
        Role::Check => &["prior.plan", "prior.do"],
        Role::Act => &["prior.check"],
    };
    required.extend_from_slice(prior_required);
    let mut schema = BTreeMap::new();
    schema.insert("type", serde_json::Value::String("object".into()));
    schema.insert(
        "required",
        serde_json::Value::Array(required.into_iter().map(|s| s.into()).collect()),
    );
    serde_json::to_value(schema).expect("schema document always serializes")
}

/// Hand-authored output schema document for a role, used only for documentation
/// purposes attached to the request; actual validation is [`validate_response`].
pub fn output_schema(role: Role) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["status", "summary", "progress"],
        "role_block": role.as_str(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_surrounding_text() {
        let stdout = "here you go\n{\"status\":\"ok\"}\nbye";
        assert_eq!(extract_response_json(stdout), Some("{\"status\":\"ok\"}"));
    }

    #[test]
    fn extract_returns_none_without_braces() {
        assert_eq!(extract_response_json("no json here"), None);
    }

    #[test]
    fn validate_rejects_unknown_status() {
        let err = validate_response(Role::Plan, r#"{"status":"weird"}"#).unwrap_err();
        assert_eq!(err, RoleError::UnknownStatus("weird".into()));
    }

    #[test]
    fn validate_rejects_ok_without_role_block() {
        let err = validate_response(Role::Plan, r#"{"status":"ok"}"#).unwrap_err();
        assert_eq!(err, RoleError::MissingRoleBlock("plan"));
    }

    #[test]
    fn validate_rejects_stop_without_reason() {
        let err = validate_response(Role::Do, r#"{"status":"stop"}"#).unwrap_err();
        assert_eq!(err, RoleError::MissingStopReason("stop"));
    }

    #[test]
    fn validate_rejects_malformed_json() {
        let err = validate_response(Role::Do, "not json").unwrap_err();
        assert!(matches!(err, RoleError::MalformedJson(_)));
    }

    #[test]
    fn validate_accepts_ok_check_with_verdict() {
        let json = r#"{
            "status": "ok",
            "summary": {"text": "checked"},
            "progress": {"title": "t", "details": []},
            "check": {
                "plan_match": {
                    "do_steps": {"planned_ids": [], "executed_ids": [], "missing_ids": [], "unexpected_ids": []},
                    "commands": {"planned_ids": [], "executed_ids": [], "missing_ids": [], "unexpected_ids": []}
                },
                "acceptance_results": [{"ac_id": "AC1", "result": "PASS", "notes": "", "log_ref": ""}],
                "verdict": {"status": "PASS", "recommendation": "continue", "basis": "all green"}
            }
        }"#;
        let resp = validate_response(Role::Check, json).unwrap();
        assert_eq!(resp.status, ResponseStatus::Ok);
        assert!(matches!(resp.output, Some(RoleOutputBlock::Check(_))));
    }

    #[test]
    fn verdict_rule_fail_wins() {
        let results = vec![AcceptanceResult {
            ac_id: "AC1".into(),
            result: AcceptanceResultStatus::Fail,
            notes: String::new(),
            log_ref: String::new(),
        }];
        let plan_match = PlanMatch::default();
        assert_eq!(derive_verdict(&results, &plan_match), Verdict::Fail);
    }

    #[test]
    fn verdict_rule_partial_on_mismatch() {
        let results = vec![AcceptanceResult {
            ac_id: "AC1".into(),
            result: AcceptanceResultStatus::Pass,
            notes: String::new(),
            log_ref: String::new(),
        }];
        let mut plan_match = PlanMatch::default();
        plan_match.commands.unexpected_ids.push("X".into());
        assert_eq!(derive_verdict(&results, &plan_match), Verdict::Partial);
    }

    #[test]
    fn verdict_rule_pass_when_clean() {
        let results = vec![AcceptanceResult {
            ac_id: "AC1".into(),
            result: AcceptanceResultStatus::Pass,
            notes: String::new(),
            log_ref: String::new(),
        }];
        let plan_match = PlanMatch::default();
        assert_eq!(derive_verdict(&results, &plan_match), Verdict::Pass);
    }

    #[test]
    fn input_schema_lists_prior_requirements_per_role() {
        let plan_schema = input_schema(Role::Plan);
        assert!(!plan_schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v.as_str().unwrap().starts_with("prior.")));

        let check_schema = input_schema(Role::Check);
        let required: Vec<&str> = check_schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(required.contains(&"prior.plan"));
        assert!(required.contains(&"prior.do"));
    }
}
