//! Validation failures must turn into feedback turns, not lost passes.

mod common;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use common::*;
use goagent_core::AgentRuntime;
use goagent_protocol::ChatMessage;
use goagent_protocol::OutputEventKind;
use goagent_protocol::PlanObservationPayload;
use goagent_protocol::Role;
use pretty_assertions::assert_eq;

fn read_history(path: &std::path::Path) -> Vec<ChatMessage> {
    let raw = std::fs::read_to_string(path).expect("history log exists");
    serde_json::from_str(&raw).expect("history log parses")
}

/// Every tool message must be preceded by an assistant message declaring
/// its tool_call_id.
fn assert_history_integrity(history: &[ChatMessage]) {
    assert_eq!(history[0].role, Role::System, "system message leads");
    for (idx, msg) in history.iter().enumerate() {
        if msg.role != Role::Tool {
            continue;
        }
        let id = msg.tool_call_id.as_deref().expect("tool messages carry an id");
        let declared = history[..idx].iter().any(|earlier| {
            earlier.role == Role::Assistant
                && earlier.tool_calls.iter().any(|call| call.id == id)
        });
        assert!(declared, "tool message {idx} references undeclared call {id}");
    }
}

#[tokio::test]
async fn malformed_json_is_retried_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("history.json");
    let mut config = test_config();
    config.history_log_path = Some(log.clone());

    let client = Arc::new(ScriptedClient::new(vec![
        Script::Call("{".to_string()),
        Script::Call("{".to_string()),
        Script::Call(empty_plan("finally valid")),
    ]));
    let runtime = AgentRuntime::spawn_with_client(config, client.clone()).expect("spawns");

    let started = Instant::now();
    let events = run_single_prompt(&runtime, "go").await;
    let elapsed = started.elapsed();

    let warnings = events
        .iter()
        .filter(|e| e.message.contains("Model response was not valid plan JSON."))
        .count();
    assert_eq!(warnings, 2, "one warning per rejected attempt");
    assert_eq!(client.call_count(), 3, "two retries then success");
    let metrics = runtime.metrics();
    assert_eq!(metrics.plan_requests, 3);
    assert_eq!(metrics.passes, 1, "all three requests belong to one pass");
    assert!(
        elapsed >= Duration::from_millis(750),
        "250ms + 500ms validation backoffs must elapse, took {elapsed:?}"
    );

    // The log written before the third attempt holds both feedback turns.
    let history = read_history(&log);
    assert_history_integrity(&history);

    let tool_messages: Vec<&ChatMessage> =
        history.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_messages.len(), 2);
    for msg in &tool_messages {
        let payload: PlanObservationPayload =
            serde_json::from_str(&msg.content).expect("payload parses");
        assert!(payload.json_parse_error);
        assert!(payload.response_validation_error);
        assert!(!payload.schema_validation_error);
    }

    let feedback: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| m.role == Role::User && m.content.contains("Please call update_plan again"))
        .collect();
    assert_eq!(feedback.len(), 2, "one synthetic user turn per rejection");
    assert!(feedback[0]
        .content
        .contains("Model response was not valid plan JSON."));
}

#[tokio::test]
async fn empty_arguments_count_as_json_errors() {
    let client = Arc::new(ScriptedClient::new(vec![
        Script::Call("   ".to_string()),
        Script::Call(empty_plan("ok")),
    ]));
    let runtime =
        AgentRuntime::spawn_with_client(test_config(), client.clone()).expect("spawns");
    let events = run_single_prompt(&runtime, "go").await;

    let warning = find_event(&events, "Model response was not valid plan JSON.")
        .expect("warning emitted");
    assert_eq!(events[warning].kind, OutputEventKind::Status);
    assert_eq!(
        events[warning].metadata["details"],
        "tool arguments were empty"
    );
    assert_eq!(client.call_count(), 2);
}

#[tokio::test]
async fn schema_violations_are_fed_back() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("history.json");
    let mut config = test_config();
    config.history_log_path = Some(log.clone());

    let bad_plan = serde_json::json!({
        "message": "missing command",
        "plan": [{ "id": "s1" }],
        "requireHumanInput": false,
    })
    .to_string();
    let client = Arc::new(ScriptedClient::new(vec![
        Script::Call(bad_plan),
        Script::Call(empty_plan("fixed")),
    ]));
    let runtime = AgentRuntime::spawn_with_client(config, client.clone()).expect("spawns");
    let events = run_single_prompt(&runtime, "go").await;

    assert!(find_event(&events, "Model plan failed schema validation.").is_some());
    assert_eq!(client.call_count(), 2);

    let history = read_history(&log);
    assert_history_integrity(&history);
    let payload: PlanObservationPayload = history
        .iter()
        .find(|m| m.role == Role::Tool)
        .map(|m| serde_json::from_str(&m.content).expect("payload parses"))
        .expect("feedback observation recorded");
    assert!(payload.schema_validation_error);
    assert!(payload.response_validation_error);
    assert!(!payload.json_parse_error);
}

#[tokio::test]
async fn valid_plans_skip_the_feedback_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("history.json");
    let mut config = test_config();
    config.history_log_path = Some(log.clone());

    let client = Arc::new(ScriptedClient::new(vec![
        Script::Call(empty_plan("nothing to do")),
    ]));
    let runtime = AgentRuntime::spawn_with_client(config, client.clone()).expect("spawns");
    let events = run_single_prompt(&runtime, "go").await;

    assert!(find_event(&events, "Model response was not valid plan JSON.").is_none());
    assert!(find_event(&events, "Model plan failed schema validation.").is_none());
    assert_eq!(client.call_count(), 1);

    let history = read_history(&log);
    assert_history_integrity(&history);
    assert_eq!(history.len(), 2, "system + user at the first request");
}
