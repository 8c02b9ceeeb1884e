//! Shared helpers for runtime integration tests: a scripted model client
//! and event-draining utilities.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use goagent_core::AgentErr;
use goagent_core::Config;
use goagent_core::ModelClient;
use goagent_core::Prompt;
use goagent_core::ResponseEvent;
use goagent_core::Result;
use goagent_core::AgentRuntime;
use goagent_protocol::InputEvent;
use goagent_protocol::OutputEvent;
use goagent_protocol::OutputEventKind;
use goagent_protocol::ToolCall;
use serde_json::json;
use serde_json::Value;
use tokio::sync::mpsc;

/// One scripted model turn.
pub enum Script {
    /// Return a tool call with these raw arguments.
    Call(String),
    /// Stream these text deltas, then return the tool call.
    CallWithDeltas(Vec<&'static str>, String),
    /// Return no tool call at all.
    NoCall,
    /// Fail the request.
    Fail(fn() -> AgentErr),
}

/// Model client that replays a fixed script. Once the script runs dry it
/// keeps returning an empty plan so sessions wind down instead of hanging.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Script>>,
    pub calls: Mutex<Vec<usize>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream_plan(
        &self,
        prompt: &Prompt,
        deltas: mpsc::Sender<ResponseEvent>,
    ) -> Result<Option<ToolCall>> {
        self.calls.lock().unwrap().push(prompt.messages.len());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Call(arguments)) => Ok(Some(tool_call(&arguments))),
            Some(Script::CallWithDeltas(fragments, arguments)) => {
                for fragment in fragments {
                    let _ = deltas
                        .send(ResponseEvent::OutputTextDelta(fragment.to_string()))
                        .await;
                }
                Ok(Some(tool_call(&arguments)))
            }
            Some(Script::NoCall) => Ok(None),
            Some(Script::Fail(make)) => Err(make()),
            None => Ok(Some(tool_call(&empty_plan("nothing left to do")))),
        }
    }
}

static NEXT_CALL_ID: Mutex<u64> = Mutex::new(0);

pub fn tool_call(arguments: &str) -> ToolCall {
    let mut guard = NEXT_CALL_ID.lock().unwrap();
    *guard += 1;
    ToolCall {
        id: format!("call_{}", *guard),
        name: "update_plan".to_string(),
        arguments: arguments.to_string(),
    }
}

/// Arguments for a plan with the given steps.
pub fn plan(message: &str, steps: Vec<Value>) -> String {
    json!({
        "message": message,
        "plan": steps,
        "requireHumanInput": false,
    })
    .to_string()
}

pub fn empty_plan(message: &str) -> String {
    plan(message, vec![])
}

/// A shell step running `run` under `/bin/sh`.
pub fn shell_step(id: &str, run: &str, deps: &[&str]) -> Value {
    let mut step = json!({
        "id": id,
        "title": format!("run {id}"),
        "status": "Pending",
        "command": {
            "shell": "/bin/sh",
            "run": run,
        },
    });
    if !deps.is_empty() {
        step["waitingForId"] = json!(deps);
    }
    step
}

/// A plan that marks the given steps completed and nothing else.
pub fn completed_plan(message: &str, ids: &[&str]) -> String {
    let steps: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "title": format!("run {id}"),
                "status": "Completed",
                "command": { "shell": "/bin/sh", "run": "true" },
            })
        })
        .collect();
    plan(message, steps)
}

/// Test config: detached from the terminal, no history log by default.
pub fn test_config() -> Config {
    Config {
        disable_input_reader: true,
        history_log_path: None,
        ..Config::default()
    }
}

/// Submit one prompt when the runtime first asks for input, shut it down
/// the next time it goes idle, and return everything it emitted.
pub async fn run_single_prompt(runtime: &AgentRuntime, prompt: &str) -> Vec<OutputEvent> {
    let mut events = Vec::new();
    let mut submitted = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(20), runtime.next_event()).await {
            Ok(Ok(event)) => {
                let wants_input = event.kind == OutputEventKind::RequestInput;
                events.push(event);
                if wants_input {
                    if submitted {
                        let _ = runtime.shutdown("test complete").await;
                    } else {
                        submitted = true;
                        runtime
                            .submit(InputEvent::Prompt {
                                prompt: prompt.to_string(),
                            })
                            .await
                            .expect("runtime accepts the prompt");
                    }
                }
            }
            Ok(Err(_)) => break,
            Err(_) => panic!(
                "runtime did not close; got so far: {:?}",
                summaries(&events)
            ),
        }
    }
    events
}

/// Drain every event until the runtime closes, bounded by a deadline.
pub async fn drain_events(runtime: &AgentRuntime) -> Vec<OutputEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(20), runtime.next_event()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(_)) => break,
            Err(_) => panic!("runtime did not close; got so far: {:?}", summaries(&events)),
        }
    }
    events
}

pub fn summaries(events: &[OutputEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| format!("{:?}:{}", e.kind, e.message))
        .collect()
}

/// Index of the first event whose message contains `needle`.
pub fn find_event(events: &[OutputEvent], needle: &str) -> Option<usize> {
    events.iter().position(|e| e.message.contains(needle))
}
