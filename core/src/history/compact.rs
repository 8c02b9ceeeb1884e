//! In-place history compaction.
//!
//! When the estimated token footprint exceeds the budget trigger, the
//! oldest non-system message is replaced with a short `[summary]` stand-in
//! and the estimate recomputed, one message per iteration. Already
//! summarized messages are never touched again.

use goagent_protocol::ChatMessage;
use goagent_protocol::PlanObservationPayload;
use goagent_protocol::Role;
use tracing::debug;
use tracing::warn;

use crate::context_budget::estimate_history_tokens;
use crate::context_budget::ContextBudget;
use crate::util::collapse_whitespace;
use crate::util::truncate_chars;

/// Safety cap on replacement rounds per snapshot.
pub(crate) const MAX_COMPACTION_ITERATIONS: usize = 10;

const SUMMARY_PREFIX: &str = "[summary]";
const SUMMARY_FALLBACK: &str = "[summary] Conversation context compressed.";
const SNIPPET_MAX_CHARS: usize = 160;
const MAX_OBSERVATION_IDS: usize = 6;

pub(crate) fn compact_history(messages: &mut [ChatMessage], budget: &ContextBudget) {
    let trigger = budget.trigger_tokens();
    let mut total = estimate_history_tokens(messages.iter());
    if total <= trigger {
        return;
    }
    let mut iterations = 0;
    while total > trigger {
        if iterations >= MAX_COMPACTION_ITERATIONS {
            warn!(
                total,
                trigger, "history still over budget after {MAX_COMPACTION_ITERATIONS} compaction rounds"
            );
            break;
        }
        let Some(idx) = messages
            .iter()
            .position(|msg| msg.role != Role::System && !msg.summarized)
        else {
            break;
        };
        messages[idx] = summarize_message(&messages[idx]);
        total = estimate_history_tokens(messages.iter());
        iterations += 1;
    }
    debug!(iterations, total, trigger, "history compaction finished");
}

/// Build the `[summary]` replacement for one message. The replacement is
/// always an assistant message with the terminal `summarized` flag set;
/// the original pass stamp is kept so amnesia still ages it correctly.
fn summarize_message(msg: &ChatMessage) -> ChatMessage {
    let content = match msg.role {
        Role::Tool => summarize_tool_content(&msg.content),
        _ => summarize_text_content(msg.role, &msg.content),
    };
    let mut summary = ChatMessage::assistant(content);
    summary.summarized = true;
    summary.pass = msg.pass;
    summary.timestamp = msg.timestamp;
    summary
}

fn summarize_text_content(role: Role, content: &str) -> String {
    let snippet = truncate_chars(&collapse_whitespace(content), SNIPPET_MAX_CHARS);
    if snippet.is_empty() {
        return SUMMARY_FALLBACK.to_string();
    }
    format!("{SUMMARY_PREFIX} {} recap: {snippet}", role.as_str())
}

fn summarize_tool_content(content: &str) -> String {
    let snippet = match serde_json::from_str::<PlanObservationPayload>(content) {
        Ok(payload) => {
            let mut parts: Vec<String> = Vec::new();
            if !payload.summary.is_empty() {
                parts.push(payload.summary.clone());
            }
            if !payload.details.is_empty() {
                parts.push(payload.details.clone());
            }
            if let Some(observations) = &payload.plan_observation {
                for obs in observations.iter().take(MAX_OBSERVATION_IDS) {
                    parts.push(format!("{}={}", obs.id, obs.status));
                }
                if observations.iter().any(|obs| obs.truncated) {
                    parts.push("output truncated".to_string());
                }
            }
            if payload.canceled_by_human {
                parts.push("canceled by human".to_string());
            }
            if payload.operation_canceled {
                parts.push("operation canceled".to_string());
            }
            truncate_chars(&collapse_whitespace(&parts.join("; ")), SNIPPET_MAX_CHARS)
        }
        Err(_) => truncate_chars(&collapse_whitespace(content), SNIPPET_MAX_CHARS),
    };
    if snippet.is_empty() {
        return SUMMARY_FALLBACK.to_string();
    }
    format!("{SUMMARY_PREFIX} tool observation: {snippet}")
}
