//! Plan types exchanged with the model and the observation payloads fed
//! back to it.
//!
//! Model-facing types (`PlanResponse` and friends) serialize camelCase to
//! match the function-call schema; observation payloads serialize
//! snake_case because they are the body of `tool` messages.

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Lifecycle status of a plan step.
///
/// The scheduler only ever moves a step `Pending -> Completed` or
/// `Pending -> Failed`; `Abandoned` is reserved for operator tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Abandoned,
}

/// The command a plan step wants executed.
///
/// `shell == "openagent"` (case-insensitive) routes `run` to the in-process
/// command registry; any other value is split on whitespace into an
/// executable and arguments, with `-lc` appended when no arguments are
/// given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDraft {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub timeout_sec: i64,
    #[serde(default)]
    pub filter_regex: String,
    #[serde(default)]
    pub tail_lines: i64,
    #[serde(default)]
    pub max_bytes: i64,
}

impl CommandDraft {
    /// True when the draft targets the in-process command registry.
    pub fn is_internal(&self) -> bool {
        self.shell.trim().eq_ignore_ascii_case("openagent")
    }
}

/// One step of the model's plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for_id: Option<Vec<String>>,
    #[serde(default)]
    pub command: CommandDraft,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    /// Transient scheduling flag owned by the plan manager; never sent to
    /// or received from the model.
    #[serde(skip)]
    pub executing: bool,
}

/// The arguments of the forced plan tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub require_human_input: bool,
}

/// Outcome of a single executed step, keyed by step id inside the
/// consolidated observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepObservation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// JSON body of every `tool` message appended after a pass.
///
/// The top-level `stdout`/`stderr`/`truncated`/`exit_code` fields mirror
/// the last step's buffers for in-process consumers only; they never
/// serialize. What the model sees is `plan_observation`, `summary`,
/// `details`, and the error/cancellation flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanObservationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_observation: Option<Vec<StepObservation>>,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
    #[serde(skip)]
    pub truncated: bool,
    #[serde(skip)]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub json_parse_error: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub schema_validation_error: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub response_validation_error: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub canceled_by_human: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub operation_canceled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn internal_shell_detection_is_case_insensitive() {
        let mut draft = CommandDraft::default();
        for shell in ["openagent", "OpenAgent", "  OPENAGENT  "] {
            draft.shell = shell.to_string();
            assert!(draft.is_internal(), "{shell} should route internally");
        }
        draft.shell = "/bin/sh".to_string();
        assert!(!draft.is_internal());
    }

    #[test]
    fn plan_response_decodes_camel_case() {
        let raw = r#"{
            "message": "run the tests",
            "reasoning": ["check the suite first"],
            "plan": [{
                "id": "s1",
                "title": "run tests",
                "status": "Pending",
                "waitingForId": ["s0"],
                "command": {
                    "reason": "verify",
                    "shell": "/bin/sh",
                    "run": "cargo test",
                    "cwd": ".",
                    "timeoutSec": 120,
                    "filterRegex": "",
                    "tailLines": 40,
                    "maxBytes": 0
                }
            }],
            "requireHumanInput": false
        }"#;
        let resp: PlanResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.plan.len(), 1);
        let step = &resp.plan[0];
        assert_eq!(step.waiting_for_id.as_deref(), Some(&["s0".to_string()][..]));
        assert_eq!(step.command.timeout_sec, 120);
        assert_eq!(step.command.tail_lines, 40);
        assert!(!step.executing);
    }

    #[test]
    fn observation_payload_hides_internal_fields() {
        let payload = PlanObservationPayload {
            plan_observation: Some(vec![StepObservation {
                id: "s1".into(),
                status: StepStatus::Completed,
                stdout: "hi\n".into(),
                exit_code: Some(0),
                ..Default::default()
            }]),
            stdout: "hi\n".into(),
            stderr: "oops".into(),
            truncated: true,
            exit_code: Some(0),
            summary: "Executed 1 plan step(s).".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("stdout").is_none());
        assert!(json.get("stderr").is_none());
        assert!(json.get("truncated").is_none());
        assert!(json.get("exit_code").is_none());
        assert_eq!(json["summary"], "Executed 1 plan step(s).");
        assert_eq!(json["plan_observation"][0]["stdout"], "hi\n");
    }

    #[test]
    fn observation_payload_round_trips_public_fields() {
        let payload = PlanObservationPayload {
            plan_observation: Some(vec![StepObservation {
                id: "a".into(),
                status: StepStatus::Failed,
                stderr: "boom".into(),
                exit_code: Some(2),
                details: "command exited with status 2".into(),
                truncated: true,
                ..Default::default()
            }]),
            summary: "Execution halted during step a.".into(),
            details: "command exited with status 2".into(),
            response_validation_error: false,
            ..Default::default()
        };
        let encoded = serde_json::to_string_pretty(&payload).unwrap();
        let decoded: PlanObservationPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.summary, payload.summary);
        assert_eq!(decoded.plan_observation, payload.plan_observation);
        assert_eq!(decoded.details, payload.details);
    }

    #[test]
    fn step_status_displays_as_variant_name() {
        assert_eq!(StepStatus::Pending.to_string(), "Pending");
        assert_eq!(StepStatus::Completed.to_string(), "Completed");
    }
}
