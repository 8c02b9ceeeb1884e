//! The `run_research` internal command against a scripted sub-runtime.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use goagent_core::AgentErr;
use goagent_core::InternalCommand;
use goagent_core::InternalCommandRequest;
use goagent_core::RunResearchCommand;
use goagent_protocol::PlanStep;
use pretty_assertions::assert_eq;
use reqwest::StatusCode;

fn request(args: &[(&str, &str)]) -> InternalCommandRequest {
    InternalCommandRequest {
        name: "run_research".to_string(),
        raw: "run_research".to_string(),
        args: args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        positionals: Vec::new(),
        step: PlanStep::default(),
        cwd: std::env::temp_dir(),
    }
}

#[tokio::test]
async fn research_returns_the_last_assistant_message() {
    let client = Arc::new(ScriptedClient::new(vec![Script::Call(empty_plan(
        "the answer is 42",
    ))]));
    let command = RunResearchCommand::new(Arc::new(test_config()), client.clone());

    let outcome = command
        .run(request(&[("goal", "find the answer"), ("turns", "3")]))
        .await
        .expect("research runs");

    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout, "the answer is 42");
    assert_eq!(outcome.stderr, "");
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn research_failure_reports_exit_one() {
    let client = Arc::new(ScriptedClient::new(vec![Script::Fail(|| {
        AgentErr::UnexpectedStatus {
            status: StatusCode::UNAUTHORIZED,
            body: "no".to_string(),
        }
    })]));
    let command = RunResearchCommand::new(Arc::new(test_config()), client);

    let outcome = command
        .run(request(&[("goal", "doomed research")]))
        .await
        .expect("research itself does not error");

    assert_eq!(outcome.exit_code, Some(1));
    assert!(outcome.details.contains("did not complete"));
}

#[tokio::test]
async fn research_without_a_goal_is_rejected() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let command = RunResearchCommand::new(Arc::new(test_config()), client);

    let err = command.run(request(&[])).await.unwrap_err();
    assert!(err.to_string().contains("missing goal"));
}

#[tokio::test]
async fn positional_goal_is_accepted() {
    let client = Arc::new(ScriptedClient::new(vec![Script::Call(empty_plan("done"))]));
    let command = RunResearchCommand::new(Arc::new(test_config()), client);

    let mut req = request(&[]);
    req.positionals = vec!["summarize".to_string(), "the repo".to_string()];
    req.args = HashMap::new();

    let outcome = command.run(req).await.expect("research runs");
    assert_eq!(outcome.exit_code, Some(0));
}
