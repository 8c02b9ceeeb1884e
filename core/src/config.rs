//! Runtime configuration.
//!
//! Configuration is resolved from explicit fields plus the `OPENAI_*`
//! environment variables; there is no config-file layer. CLI front-ends
//! load `.env` before calling [`Config::from_env`].

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::context_budget::ModelBudget;
use crate::error::AgentErr;
use crate::error::Result;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_HISTORY_LOG: &str = "history.json";

/// Default prompt the runtime feeds itself in hands-free mode whenever it
/// would otherwise wait for operator input.
pub const HANDS_FREE_AUTO_REPLY: &str =
    "Continue working toward the goal. If the goal is fully achieved, return an empty plan.";

const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous engineering agent. \
On every turn you must call the plan tool with a JSON plan: a short message for the operator, \
an ordered list of executable steps with unique ids, and requireHumanInput when you are blocked. \
Steps may depend on earlier steps via waitingForId. Mark finished steps Completed and return an \
empty plan when the task is done.";

/// Everything a runtime instance needs to know at spawn time.
#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    /// Forwarded as `reasoning.effort` when non-empty.
    pub reasoning_effort: String,
    pub system_prompt: String,
    /// Working directory that relative step cwds resolve against.
    pub cwd: PathBuf,

    /// Hard cap on plan-execution passes per prompt; 0 disables.
    pub max_passes: u64,
    pub hands_free: bool,
    pub hands_free_topic: String,
    pub hands_free_auto_reply: String,
    /// Suppress the stdin reader (embedded and sub-runtime use).
    pub disable_input_reader: bool,
    /// Suppress event forwarding to the parent queue (sub-runtime use).
    pub disable_output_forwarding: bool,

    /// Truncate assistant/tool content this many passes after it was
    /// appended; 0 disables.
    pub amnesia_after_passes: u64,
    /// Context budget override; `None` uses the per-model defaults.
    pub context_budget: Option<ModelBudget>,
    /// Snapshot of the history is rewritten here before every model
    /// request; `None` disables.
    pub history_log_path: Option<PathBuf>,

    /// Outbound sends that block longer than this are dropped; zero waits
    /// forever.
    pub emit_timeout: Duration,
    pub http_timeout: Duration,
    pub max_retries: u32,
    /// Verbose SSE tracing (`GOAGENT_DEBUG_STREAM`).
    pub debug_stream: bool,

    /// Line inputs that shut the runtime down, compared case-insensitively.
    pub exit_words: Vec<String>,
    /// Label stamped on outbound events.
    pub agent_label: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            reasoning_effort: String::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            max_passes: 0,
            hands_free: false,
            hands_free_topic: String::new(),
            hands_free_auto_reply: HANDS_FREE_AUTO_REPLY.to_string(),
            disable_input_reader: false,
            disable_output_forwarding: false,
            amnesia_after_passes: 0,
            context_budget: None,
            history_log_path: Some(PathBuf::from(DEFAULT_HISTORY_LOG)),
            emit_timeout: Duration::ZERO,
            http_timeout: Duration::from_secs(120),
            max_retries: 3,
            debug_stream: false,
            exit_words: ["exit", "quit", "/exit", "/quit"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            agent_label: goagent_protocol::protocol::MAIN_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Build a config from the environment. `OPENAI_API_KEY` is required;
    /// everything else falls back to defaults.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(AgentErr::EnvVar("OPENAI_API_KEY"))?;

        let mut config = Self {
            api_key,
            ..Self::default()
        };
        if let Some(model) = non_empty_env("OPENAI_MODEL") {
            config.model = model;
        }
        if let Some(base_url) = non_empty_env("OPENAI_BASE_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(effort) = non_empty_env("OPENAI_REASONING_EFFORT") {
            config.reasoning_effort = effort;
        }
        config.debug_stream = env_flag("GOAGENT_DEBUG_STREAM");
        Ok(config)
    }

    /// Derive the configuration for a research sub-runtime: same endpoint
    /// and model, hands-free on the given goal, no terminal wiring, and no
    /// history log of its own.
    pub fn research_child(&self, goal: &str, turns: u64) -> Self {
        Self {
            hands_free: true,
            hands_free_topic: goal.to_string(),
            hands_free_auto_reply: HANDS_FREE_AUTO_REPLY.to_string(),
            disable_input_reader: true,
            disable_output_forwarding: true,
            max_passes: if turns == 0 { 10 } else { turns },
            history_log_path: None,
            agent_label: "research".to_string(),
            ..self.clone()
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().trim(),
        "1" | "true" | "TRUE" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.http_timeout, Duration::from_secs(120));
        assert_eq!(config.max_retries, 3);
        assert_eq!(
            config.history_log_path.as_deref(),
            Some(std::path::Path::new("history.json"))
        );
        assert!(config.exit_words.contains(&"/quit".to_string()));
    }

    #[test]
    fn research_child_is_hands_free_and_detached() {
        let parent = Config {
            api_key: "sk-test".into(),
            ..Config::default()
        };
        let child = parent.research_child("summarize crate layout", 0);
        assert!(child.hands_free);
        assert!(child.disable_input_reader);
        assert!(child.disable_output_forwarding);
        assert_eq!(child.max_passes, 10);
        assert_eq!(child.hands_free_topic, "summarize crate layout");
        assert_eq!(child.history_log_path, None);
        assert_eq!(child.api_key, parent.api_key);

        let bounded = parent.research_child("goal", 3);
        assert_eq!(bounded.max_passes, 3);
    }
}
