//! Model client for the OpenAI-compatible Responses API.
//!
//! One plan request = one POST with `stream: true` and a single function
//! tool the model is forced to call. The SSE decoder accumulates the tool
//! call while progressively surfacing the plan's `message` text (and
//! finished `reasoning` entries) as deltas, so hosts can render output
//! before the JSON closes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use goagent_protocol::ToolCall;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::client_common::to_input_messages;
use crate::client_common::FunctionTool;
use crate::client_common::Prompt;
use crate::client_common::Reasoning;
use crate::client_common::ResponseEvent;
use crate::client_common::ResponsesApiRequest;
use crate::client_common::StreamedToolCall;
use crate::client_common::PLAN_TOOL_DESCRIPTION;
use crate::client_common::PLAN_TOOL_NAME;
use crate::config::Config;
use crate::error::AgentErr;
use crate::error::Result;
use crate::partial_json::closed_reasoning_elements;
use crate::partial_json::latest_message_value;
use crate::plan_schema::plan_parameters_schema;
use crate::util::backoff;

/// Seam between the runtime and the wire. The runtime only ever asks for
/// one thing: stream a plan request and hand back the accumulated tool
/// call. Tests substitute a scripted implementation.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_plan(
        &self,
        prompt: &Prompt,
        deltas: mpsc::Sender<ResponseEvent>,
    ) -> Result<Option<ToolCall>>;
}

/// Production client backed by `reqwest` against `<base_url>/responses`.
pub struct ResponsesClient {
    http: reqwest::Client,
    config: Arc<Config>,
    parameters: Value,
}

impl ResponsesClient {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            parameters: plan_parameters_schema(),
        })
    }

    fn request_body(&self, prompt: &Prompt) -> ResponsesApiRequest {
        ResponsesApiRequest {
            model: self.config.model.clone(),
            stream: true,
            input: to_input_messages(&prompt.messages),
            tools: vec![FunctionTool {
                kind: "function",
                name: PLAN_TOOL_NAME,
                description: PLAN_TOOL_DESCRIPTION,
                parameters: self.parameters.clone(),
            }],
            tool_choice: "required",
            reasoning: if self.config.reasoning_effort.is_empty() {
                None
            } else {
                Some(Reasoning {
                    effort: self.config.reasoning_effort.clone(),
                })
            },
        }
    }

    async fn attempt_stream(
        &self,
        body: &ResponsesApiRequest,
        deltas: &mpsc::Sender<ResponseEvent>,
    ) -> Result<Option<ToolCall>> {
        let url = format!("{}/responses", self.config.base_url.trim_end_matches('/'));
        debug!(model = %body.model, %url, "requesting plan");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(AgentErr::RateLimited { retry_after, body });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentErr::UnexpectedStatus { status, body });
        }
        process_sse(response.bytes_stream(), deltas, self.config.debug_stream).await
    }
}

#[async_trait]
impl ModelClient for ResponsesClient {
    async fn stream_plan(
        &self,
        prompt: &Prompt,
        deltas: mpsc::Sender<ResponseEvent>,
    ) -> Result<Option<ToolCall>> {
        let body = self.request_body(prompt);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt_stream(&body, &deltas).await {
                Ok(tool_call) => return Ok(tool_call),
                Err(err) if err.is_retryable() => {
                    if attempt > self.config.max_retries {
                        return Err(AgentErr::RetriesExhausted {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    // Honor a server-suggested delay over our own schedule.
                    let delay = err.suggested_delay().unwrap_or_else(|| backoff(attempt));
                    warn!(
                        "plan request failed (attempt {attempt}/{}): {err}; retrying in {delay:?}",
                        self.config.max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Default)]
struct StreamState {
    tool: StreamedToolCall,
    /// Last progressively-emitted `message` value, keyed by call id so an
    /// id change starts fresh.
    last_message: HashMap<String, String>,
    emitted_reasoning: usize,
    saw_terminal: bool,
}

/// Decode an SSE byte stream into the accumulated tool call, forwarding
/// display deltas as they materialize.
pub(crate) async fn process_sse<S>(
    mut stream: S,
    deltas: &mpsc::Sender<ResponseEvent>,
    debug_stream: bool,
) -> Result<Option<ToolCall>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut state = StreamState::default();
    let mut buf: Vec<u8> = Vec::new();
    'outer: while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| AgentErr::Stream(err.to_string()))?;
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if handle_sse_line(line.trim(), &mut state, deltas, debug_stream).await {
                break 'outer;
            }
        }
    }
    if !state.saw_terminal {
        return Err(AgentErr::Stream(
            "stream closed before response.completed".into(),
        ));
    }
    Ok(std::mem::take(&mut state.tool).into_tool_call())
}

/// Returns true when the stream is finished (`[DONE]`).
async fn handle_sse_line(
    line: &str,
    state: &mut StreamState,
    deltas: &mpsc::Sender<ResponseEvent>,
    debug_stream: bool,
) -> bool {
    if line.is_empty() || line.starts_with(':') {
        return false;
    }
    let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if data == "[DONE]" {
        state.saw_terminal = true;
        return true;
    }
    let event: Value = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(err) => {
            trace!("skipping unparseable SSE line: {err}");
            return false;
        }
    };
    if debug_stream {
        debug!(event = %event, "sse event");
    }

    let ty = event
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let is_tool_event = ty.contains("function_call") || ty.contains("tool_call");

    if ty.ends_with("output_text.delta") {
        if let Some(delta) = event.get("delta").and_then(Value::as_str) {
            forward_text(deltas, delta.to_string()).await;
        }
    } else if is_tool_event && ty.ends_with("arguments.delta") {
        if let Some(delta) = event.get("delta").and_then(Value::as_str) {
            state.tool.arguments.push_str(delta);
            emit_progressive(state, deltas).await;
        }
    } else if is_tool_event && ty.ends_with(".delta") {
        apply_tool_delta(&event, state);
        emit_progressive(state, deltas).await;
    } else if ty == "message.delta" || ty == "response.message.delta" {
        let mut nested = Vec::new();
        collect_nested_text_deltas(&event, &mut nested);
        for delta in nested {
            forward_text(deltas, delta).await;
        }
    } else if ty == "response.completed"
        || ty.ends_with("output_text.done")
        || (is_tool_event && ty.ends_with(".completed"))
    {
        let root = event.get("response").unwrap_or(&event);
        dfs_fill_tool_call(root, &mut state.tool);
        if ty == "response.completed" {
            state.saw_terminal = true;
        }
    }
    false
}

/// Apply a `response.function_call.delta`-family event: pick up the tool
/// name, track the call id (resetting accumulated arguments when it
/// changes), and append any argument text carried inline.
fn apply_tool_delta(event: &Value, state: &mut StreamState) {
    if let Some(name) = event.get("name").and_then(Value::as_str) {
        if !name.is_empty() {
            state.tool.name = name.to_string();
        }
    }
    if let Some(call_id) = event.get("call_id").and_then(Value::as_str) {
        if !call_id.is_empty() && call_id != state.tool.id {
            if !state.tool.id.is_empty() {
                state.tool.arguments.clear();
                state.emitted_reasoning = 0;
            }
            state.tool.id = call_id.to_string();
        }
    }
    if let Some(arguments) = event.get("arguments").and_then(Value::as_str) {
        state.tool.arguments.push_str(arguments);
    }
    if let Some(arguments) = event
        .get("delta")
        .and_then(|d| d.get("arguments"))
        .and_then(Value::as_str)
    {
        state.tool.arguments.push_str(arguments);
    }
}

/// Emit the newly visible suffix of the plan `message` and any newly
/// closed `reasoning` entries.
async fn emit_progressive(state: &mut StreamState, deltas: &mpsc::Sender<ResponseEvent>) {
    if let Some(message) = latest_message_value(&state.tool.arguments) {
        let previous = state
            .last_message
            .entry(state.tool.id.clone())
            .or_default();
        let delta = if message.starts_with(previous.as_str()) {
            message[previous.len()..].to_string()
        } else {
            message.clone()
        };
        *previous = message;
        if !delta.is_empty() {
            forward_text(deltas, delta).await;
        }
    }
    let closed = closed_reasoning_elements(&state.tool.arguments);
    while state.emitted_reasoning < closed.len() {
        let entry = format!("\n{}", closed[state.emitted_reasoning]);
        state.emitted_reasoning += 1;
        forward_text(deltas, entry).await;
    }
}

async fn forward_text(deltas: &mpsc::Sender<ResponseEvent>, text: String) {
    if deltas
        .send(ResponseEvent::OutputTextDelta(text))
        .await
        .is_err()
    {
        trace!("delta receiver dropped; continuing to accumulate");
    }
}

/// Depth-first search for `output_text.delta` fragments nested inside a
/// `message.delta` event.
fn collect_nested_text_deltas(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            let is_text_delta = map
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.ends_with("output_text.delta"));
            if is_text_delta {
                if let Some(delta) = map.get("delta").and_then(Value::as_str) {
                    out.push(delta.to_string());
                    return;
                }
            }
            if let Some(inner) = map.get("output_text") {
                if let Some(delta) = inner.get("delta").and_then(Value::as_str) {
                    out.push(delta.to_string());
                    return;
                }
            }
            for nested in map.values() {
                collect_nested_text_deltas(nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_nested_text_deltas(item, out);
            }
        }
        _ => {}
    }
}

/// Fill still-unset tool-call fields from the first matching string field
/// found anywhere under a terminal event.
fn dfs_fill_tool_call(value: &Value, tool: &mut StreamedToolCall) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if let Value::String(text) = nested {
                    match key.as_str() {
                        "name" if tool.name.is_empty() => tool.name = text.clone(),
                        "call_id" if tool.id.is_empty() => tool.id = text.clone(),
                        "arguments" if tool.arguments.is_empty() => tool.arguments = text.clone(),
                        _ => {}
                    }
                } else {
                    dfs_fill_tool_call(nested, tool);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                dfs_fill_tool_call(item, tool);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goagent_protocol::ChatMessage;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_body_matches_the_responses_contract() {
        let config = Arc::new(Config {
            model: "gpt-4o".to_string(),
            api_key: "sk-test".to_string(),
            reasoning_effort: "medium".to_string(),
            ..Config::default()
        });
        let client = ResponsesClient::new(config).expect("client builds");
        let prompt = Prompt {
            messages: vec![
                ChatMessage::system("sys"),
                ChatMessage::user("do the thing"),
                ChatMessage::tool("call_1", PLAN_TOOL_NAME, "{\"summary\":\"ok\"}"),
            ],
        };
        let body = serde_json::to_value(client.request_body(&prompt)).expect("serializes");

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tool_choice"], "required");
        assert_eq!(body["reasoning"]["effort"], "medium");
        assert_eq!(body["tools"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["name"], "update_plan");
        assert!(body["tools"][0]["parameters"].is_object());
        assert_eq!(body["input"][0]["role"], "system");
        assert_eq!(body["input"][1]["content"][0]["type"], "input_text");
        assert_eq!(body["input"][2]["role"], "developer");
    }

    #[test]
    fn reasoning_is_omitted_without_an_effort() {
        let config = Arc::new(Config {
            api_key: "sk-test".to_string(),
            ..Config::default()
        });
        let client = ResponsesClient::new(config).expect("client builds");
        let prompt = Prompt {
            messages: vec![ChatMessage::system("sys")],
        };
        let body = serde_json::to_value(client.request_body(&prompt)).expect("serializes");
        assert!(body.get("reasoning").is_none());
    }

    #[tokio::test]
    async fn transient_failures_retry_until_the_budget_is_spent() {
        // Nothing listens on this port: every attempt is a connect error,
        // which is retryable.
        let config = Arc::new(Config {
            api_key: "sk-test".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            max_retries: 1,
            http_timeout: std::time::Duration::from_secs(2),
            ..Config::default()
        });
        let client = ResponsesClient::new(config).expect("client builds");
        let prompt = Prompt {
            messages: vec![ChatMessage::system("sys")],
        };
        let (tx, _rx) = mpsc::channel(8);

        let started = std::time::Instant::now();
        let err = client
            .stream_plan(&prompt, tx)
            .await
            .expect_err("no server to talk to");
        let elapsed = started.elapsed();

        match err {
            AgentErr::RetriesExhausted { attempts, .. } => {
                assert_eq!(attempts, 2, "max_retries + 1 attempts");
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
        assert!(
            elapsed >= std::time::Duration::from_millis(500),
            "one 500ms backoff must elapse, took {elapsed:?}"
        );
    }

    fn sse_stream(lines: &[&str]) -> impl Stream<Item = reqwest::Result<Bytes>> + Unpin {
        let payload = lines.join("\n") + "\n";
        let chunks: Vec<reqwest::Result<Bytes>> = vec![Ok(Bytes::from(payload))];
        futures::stream::iter(chunks)
    }

    async fn drain(
        lines: &[&str],
    ) -> (Result<Option<ToolCall>>, Vec<String>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = process_sse(sse_stream(lines), &tx, false).await;
        drop(tx);
        let mut seen = Vec::new();
        while let Some(ResponseEvent::OutputTextDelta(delta)) = rx.recv().await {
            seen.push(delta);
        }
        (result, seen)
    }

    #[tokio::test]
    async fn accumulates_tool_call_across_argument_deltas() {
        let (result, _) = drain(&[
            r#"data: {"type":"response.function_call.delta","name":"update_plan","call_id":"call_1"}"#,
            r#"data: {"type":"response.function_call.arguments.delta","delta":"{\"message\":\"hi\","}"#,
            r#"data: {"type":"response.function_call.arguments.delta","delta":"\"plan\":[],\"requireHumanInput\":false}"}"#,
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        let tool_call = result.unwrap().unwrap();
        assert_eq!(tool_call.id, "call_1");
        assert_eq!(tool_call.name, "update_plan");
        assert_eq!(
            tool_call.arguments,
            r#"{"message":"hi","plan":[],"requireHumanInput":false}"#
        );
    }

    #[tokio::test]
    async fn emits_progressive_message_deltas() {
        let (_, seen) = drain(&[
            r#"data: {"type":"response.function_call.delta","name":"update_plan","call_id":"c1"}"#,
            r#"data: {"type":"response.function_call.arguments.delta","delta":"{\"message\":\"Hel"}"#,
            r#"data: {"type":"response.function_call.arguments.delta","delta":"lo world\""}"#,
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        assert_eq!(seen.join(""), "Hello world");
        // Strictly incremental: no fragment repeats the whole prefix.
        assert_eq!(seen, vec!["Hel".to_string(), "lo world".to_string()]);
    }

    #[tokio::test]
    async fn emits_closed_reasoning_entries_with_newline_prefix() {
        let (_, seen) = drain(&[
            r#"data: {"type":"response.function_call.delta","name":"update_plan","call_id":"c1"}"#,
            r#"data: {"type":"response.function_call.arguments.delta","delta":"{\"reasoning\":[\"first\",\"sec"}"#,
            r#"data: {"type":"response.function_call.arguments.delta","delta":"ond\"],\"message\":\"go\"}"}"#,
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        assert!(seen.contains(&"\nfirst".to_string()));
        assert!(seen.contains(&"\nsecond".to_string()));
        assert_eq!(seen.iter().filter(|d| d.as_str() == "\nfirst").count(), 1);
    }

    #[tokio::test]
    async fn forwards_raw_output_text_deltas() {
        let (_, seen) = drain(&[
            r#"data: {"type":"response.output_text.delta","delta":"thinking "}"#,
            r#"data: {"type":"response.output_text.delta","delta":"aloud"}"#,
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        assert_eq!(seen.join(""), "thinking aloud");
    }

    #[tokio::test]
    async fn call_id_change_resets_arguments() {
        let (result, _) = drain(&[
            r#"data: {"type":"response.tool_call.delta","name":"update_plan","call_id":"old"}"#,
            r#"data: {"type":"response.tool_call.arguments.delta","delta":"{\"stale\":true}"}"#,
            r#"data: {"type":"response.tool_call.delta","call_id":"new"}"#,
            r#"data: {"type":"response.tool_call.arguments.delta","delta":"{\"message\":\"fresh\",\"plan\":[],\"requireHumanInput\":false}"}"#,
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        let tool_call = result.unwrap().unwrap();
        assert_eq!(tool_call.id, "new");
        assert!(tool_call.arguments.contains("fresh"));
        assert!(!tool_call.arguments.contains("stale"));
    }

    #[tokio::test]
    async fn completed_event_backfills_via_dfs() {
        let (result, _) = drain(&[
            r#"data: {"type":"response.completed","response":{"output":[{"type":"function_call","name":"update_plan","call_id":"call_9","arguments":"{\"message\":\"m\",\"plan\":[],\"requireHumanInput\":false}"}]}}"#,
            "data: [DONE]",
        ])
        .await;
        let tool_call = result.unwrap().unwrap();
        assert_eq!(tool_call.id, "call_9");
        assert_eq!(tool_call.name, "update_plan");
        assert!(tool_call.arguments.contains("requireHumanInput"));
    }

    #[tokio::test]
    async fn stream_without_a_call_id_still_yields_a_correlatable_call() {
        let (result, _) = drain(&[
            r#"data: {"type":"response.function_call.delta","name":"update_plan"}"#,
            r#"data: {"type":"response.function_call.arguments.delta","delta":"{\"message\":\"m\",\"plan\":[],\"requireHumanInput\":false}"}"#,
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        let tool_call = result.unwrap().unwrap();
        assert!(
            !tool_call.id.is_empty(),
            "a generated id keeps the tool message correlated"
        );
        assert!(uuid::Uuid::parse_str(&tool_call.id).is_ok());
    }

    #[tokio::test]
    async fn missing_name_means_no_tool_call() {
        let (result, _) = drain(&[
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn keepalives_comments_and_garbage_are_skipped() {
        let (result, _) = drain(&[
            "",
            ": keepalive",
            "data: not json",
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (result, _) = drain(&[
            r#"data: {"type":"response.function_call.delta","name":"update_plan","call_id":"c1"}"#,
        ])
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, AgentErr::Stream(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn nested_message_delta_items_are_forwarded() {
        let (_, seen) = drain(&[
            r#"data: {"type":"message.delta","delta":{"content":[{"type":"output_text.delta","delta":"abc"}]}}"#,
            r#"data: {"type":"response.completed","response":{}}"#,
            "data: [DONE]",
        ])
        .await;
        assert_eq!(seen.join(""), "abc");
    }
}
