use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentErr>;

/// Errors surfaced by the runtime.
#[derive(Debug, Error)]
pub enum AgentErr {
    /// The current pass was canceled by the operator or runtime shutdown.
    #[error("operation canceled")]
    Interrupted,

    #[error("missing environment variable: {0}")]
    EnvVar(&'static str),

    /// SSE stream closed before a terminal event.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    #[error("unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },

    /// HTTP 429; carries the server-suggested delay when one was sent.
    #[error("rate limited: {body}")]
    RateLimited {
        retry_after: Option<Duration>,
        body: String,
    },

    /// All retry attempts were consumed without a successful request.
    #[error("request failed after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The embedded plan schema failed to compile. Fatal: the runtime
    /// cannot validate anything the model sends.
    #[error("plan schema failed to compile: {0}")]
    Schema(String),

    #[error("failed to spawn command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command exited with status {0}")]
    ExitStatus(i32),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal command error: {0}")]
    InternalCommand(String),

    #[error("unknown plan step: {0}")]
    UnknownStep(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentErr {
    /// Whether a model request that failed with this error should be
    /// retried with backoff. Covers transport failures, 429 and 5xx; any
    /// other API response aborts immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentErr::Http(err) => {
                err.is_connect() || err.is_timeout() || err.is_request() || err.is_body()
            }
            AgentErr::Stream(_) => true,
            AgentErr::RateLimited { .. } => true,
            AgentErr::UnexpectedStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }

    /// Delay the server asked us to wait before retrying, if any.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            AgentErr::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
