//! Append-only conversation history with in-place compaction and aging.
//!
//! All access goes through one reader/writer lock: reads hand out copies,
//! and every mutation (append, amnesia, compaction) happens under the
//! write half so snapshots are always internally consistent.

mod compact;

use std::path::Path;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use goagent_protocol::ChatMessage;
use goagent_protocol::PlanObservationPayload;
use goagent_protocol::Role;
use tracing::warn;

use crate::context_budget::ContextBudget;
use crate::util::truncate_chars;

/// Oldest content is trimmed to this many characters by amnesia.
const AMNESIA_MAX_CHARS: usize = 512;

pub struct HistoryStore {
    messages: RwLock<Vec<ChatMessage>>,
    amnesia_after_passes: u64,
}

impl HistoryStore {
    /// Create a store seeded with the system prompt at index 0.
    pub fn new(system_prompt: &str, amnesia_after_passes: u64) -> Self {
        Self {
            messages: RwLock::new(vec![ChatMessage::system(system_prompt)]),
            amnesia_after_passes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ChatMessage>> {
        match self.messages.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ChatMessage>> {
        match self.messages.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stamp the message with the current pass, append it, then age out
    /// old content in the same critical section.
    pub fn append(&self, mut msg: ChatMessage, current_pass: u64) {
        let mut messages = self.write();
        msg.pass = current_pass;
        messages.push(msg);
        self.run_amnesia(&mut messages, current_pass);
    }

    /// Copy of the full history.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.read().clone()
    }

    /// Compact the history down to the budget trigger (when enabled), then
    /// return a copy for the next model request.
    pub fn planning_snapshot(&self, budget: &ContextBudget) -> Vec<ChatMessage> {
        let mut messages = self.write();
        if budget.enabled() {
            compact::compact_history(&mut messages, budget);
        }
        messages.clone()
    }

    /// Truncate assistant content/arguments and scrub tool observations on
    /// every message at least `amnesia_after_passes` passes old.
    fn run_amnesia(&self, messages: &mut [ChatMessage], current_pass: u64) {
        if self.amnesia_after_passes == 0 {
            return;
        }
        for msg in messages.iter_mut() {
            if current_pass.saturating_sub(msg.pass) < self.amnesia_after_passes {
                continue;
            }
            match msg.role {
                Role::Assistant => {
                    msg.content = truncate_chars(&msg.content, AMNESIA_MAX_CHARS);
                    for call in &mut msg.tool_calls {
                        call.arguments = truncate_chars(&call.arguments, AMNESIA_MAX_CHARS);
                    }
                }
                Role::Tool => {
                    msg.content = scrub_tool_content(&msg.content);
                }
                Role::System | Role::User => {}
            }
        }
    }
}

/// Scrub an aged tool message: drop captured output, keep the structured
/// outcome. Unparseable content is just truncated.
fn scrub_tool_content(content: &str) -> String {
    match serde_json::from_str::<PlanObservationPayload>(content) {
        Ok(mut payload) => {
            payload.stdout = String::new();
            payload.stderr = String::new();
            payload.details = truncate_chars(&payload.details, AMNESIA_MAX_CHARS);
            if let Some(observations) = &mut payload.plan_observation {
                for obs in observations.iter_mut() {
                    obs.stdout = String::new();
                    obs.stderr = String::new();
                    obs.details = truncate_chars(&obs.details, AMNESIA_MAX_CHARS);
                }
            }
            serde_json::to_string(&payload).unwrap_or_else(|err| {
                warn!("failed to re-serialize scrubbed observation: {err}");
                truncate_chars(content, AMNESIA_MAX_CHARS)
            })
        }
        Err(_) => truncate_chars(content, AMNESIA_MAX_CHARS),
    }
}

/// Overwrite `path` with the indented JSON of a history snapshot.
/// Best-effort: failures are logged, never fatal.
pub fn persist_snapshot(path: &Path, snapshot: &[ChatMessage]) {
    let json = match serde_json::to_string_pretty(snapshot) {
        Ok(json) => json,
        Err(err) => {
            warn!("failed to encode history snapshot: {err}");
            return;
        }
    };
    if let Err(err) = std::fs::write(path, json) {
        warn!(path = %path.display(), "failed to write history log: {err}");
    }
}
