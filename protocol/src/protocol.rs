//! Inbound and outbound event types for the runtime's queue pair.
//!
//! Hosts drive the runtime by sending [`InputEvent`]s and reacting to the
//! [`OutputEvent`]s it emits. Both queues are bounded; see the runtime for
//! backpressure behavior.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// Default agent label stamped on outbound events.
pub const MAIN_AGENT: &str = "main";

/// An instruction sent to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InputEvent {
    /// Begin (or queue) a plan-execution session for this prompt.
    Prompt { prompt: String },
    /// Ask the runtime to stop the current activity. Does not abort an
    /// in-flight pass; the runtime surfaces a warning instead.
    Cancel { reason: String },
    /// Terminate the runtime loop.
    Shutdown { reason: String },
}

/// Severity attached to an outbound event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// Kind of an outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputEventKind {
    /// Progress or lifecycle notice.
    Status,
    /// A streamed fragment of the assistant's message text.
    AssistantDelta,
    /// The assistant's complete plan message for one pass.
    AssistantMessage,
    /// A failure the host should surface.
    Error,
    /// The runtime is idle and wants another prompt.
    RequestInput,
}

/// An event emitted by the runtime.
///
/// `pass` is stamped from the pass counter at emit time and `agent`
/// identifies the emitting runtime ("main" unless a sub-runtime is
/// relaying).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    #[serde(rename = "type")]
    pub kind: OutputEventKind,
    pub message: String,
    #[serde(default)]
    pub level: EventLevel,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub pass: u64,
    #[serde(default)]
    pub agent: String,
}

impl OutputEvent {
    fn new(kind: OutputEventKind, message: impl Into<String>, level: EventLevel) -> Self {
        Self {
            kind,
            message: message.into(),
            level,
            metadata: Map::new(),
            pass: 0,
            agent: MAIN_AGENT.to_string(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::new(OutputEventKind::Status, message, EventLevel::Info)
    }

    pub fn warn_status(message: impl Into<String>) -> Self {
        Self::new(OutputEventKind::Status, message, EventLevel::Warn)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(OutputEventKind::Error, message, EventLevel::Error)
    }

    pub fn assistant_delta(delta: impl Into<String>) -> Self {
        Self::new(OutputEventKind::AssistantDelta, delta, EventLevel::Info)
    }

    pub fn assistant_message(message: impl Into<String>) -> Self {
        Self::new(OutputEventKind::AssistantMessage, message, EventLevel::Info)
    }

    pub fn request_input(message: impl Into<String>) -> Self {
        Self::new(OutputEventKind::RequestInput, message, EventLevel::Info)
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}
