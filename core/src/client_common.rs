//! Request/response types shared by the model client and the runtime.

use goagent_protocol::ChatMessage;
use goagent_protocol::Role;
use goagent_protocol::ToolCall;
use serde::Serialize;
use serde_json::Value;

/// Everything one plan request needs: the (already compacted) history
/// snapshot to send.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
}

/// Incremental output surfaced while a plan request streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// Assistant-visible text: raw `output_text` deltas plus the
    /// progressively decoded plan `message` and finished `reasoning`
    /// entries.
    OutputTextDelta(String),
}

/// Name of the forced plan function tool.
pub const PLAN_TOOL_NAME: &str = "update_plan";

pub(crate) const PLAN_TOOL_DESCRIPTION: &str = "Report the current plan: a short status message \
for the operator, the ordered list of steps with commands to run, and whether operator input is \
required before continuing.";

/// Body of a `/responses` request.
#[derive(Debug, Serialize)]
pub(crate) struct ResponsesApiRequest {
    pub model: String,
    pub stream: bool,
    pub input: Vec<InputMessage>,
    pub tools: Vec<FunctionTool>,
    pub tool_choice: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Reasoning {
    pub effort: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct FunctionTool {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct InputMessage {
    pub role: &'static str,
    pub content: Vec<InputContent>,
}

#[derive(Debug, Serialize)]
pub(crate) struct InputContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

/// Map history messages onto the request `input`: tool observations become
/// `developer` turns, and assistant text is tagged `output_text` so the
/// model sees it as its own.
pub(crate) fn to_input_messages(messages: &[ChatMessage]) -> Vec<InputMessage> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "developer",
            };
            let kind = if msg.role == Role::Assistant {
                "output_text"
            } else {
                "input_text"
            };
            let text = if msg.content.is_empty() && !msg.tool_calls.is_empty() {
                // An assistant plan turn with no prose: echo the plan JSON
                // so the model still sees what it committed to.
                msg.tool_calls[0].arguments.clone()
            } else {
                msg.content.clone()
            };
            InputMessage {
                role,
                content: vec![InputContent { kind, text }],
            }
        })
        .collect()
}

/// Final result of one streamed plan request.
#[derive(Debug, Clone, Default)]
pub struct StreamedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl StreamedToolCall {
    /// Finish the accumulation. A call with no name is no call at all; a
    /// call the stream never assigned a `call_id` gets a generated one so
    /// the tool-message correlation keeps working.
    pub fn into_tool_call(self) -> Option<ToolCall> {
        if self.name.is_empty() {
            return None;
        }
        let id = if self.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.id
        };
        Some(ToolCall {
            id,
            name: self.name,
            arguments: self.arguments,
        })
    }
}
