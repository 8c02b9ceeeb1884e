//! The `run_research` internal command: delegate a side quest to a
//! hands-free sub-runtime and report its final answer.
//!
//! The child runtime shares the parent's model client and configuration
//! but runs detached: no stdin reader, no event forwarding, and a bounded
//! number of passes. Completion is detected from the child's
//! "Hands-free session complete" status; whatever the child said last is
//! the research result.

use std::sync::Arc;

use async_trait::async_trait;
use goagent_protocol::OutputEventKind;
use tracing::debug;

use crate::client::ModelClient;
use crate::config::Config;
use crate::error::AgentErr;
use crate::error::Result;
use crate::exec::CommandOutcome;
use crate::internal_commands::InternalCommand;
use crate::internal_commands::InternalCommandRequest;
use crate::runtime::AgentRuntime;

/// Substring of the child's completion status. Kept as a string match for
/// compatibility with existing hosts that scrape the same event.
pub(crate) const HANDS_FREE_COMPLETE_MARKER: &str = "Hands-free session complete";

pub struct RunResearchCommand {
    config: Arc<Config>,
    client: Arc<dyn ModelClient>,
}

impl RunResearchCommand {
    pub fn new(config: Arc<Config>, client: Arc<dyn ModelClient>) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl InternalCommand for RunResearchCommand {
    fn name(&self) -> &'static str {
        "run_research"
    }

    async fn run(&self, req: InternalCommandRequest) -> Result<CommandOutcome> {
        let goal = req
            .args
            .get("goal")
            .cloned()
            .filter(|g| !g.trim().is_empty())
            .or_else(|| {
                if req.positionals.is_empty() {
                    None
                } else {
                    Some(req.positionals.join(" "))
                }
            })
            .ok_or_else(|| {
                AgentErr::InternalCommand(
                    "run_research: missing goal (use goal=\"...\")".to_string(),
                )
            })?;
        let turns = req
            .args
            .get("turns")
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(0);

        let child_config = self.config.research_child(&goal, turns);
        let max_passes = child_config.max_passes;
        debug!(%goal, max_passes, "starting research sub-runtime");
        let runtime = AgentRuntime::spawn_with_client(child_config, self.client.clone())?;

        let mut last_assistant = String::new();
        let mut complete = false;
        while let Ok(event) = runtime.next_event().await {
            match event.kind {
                OutputEventKind::AssistantMessage => last_assistant = event.message,
                OutputEventKind::Status if event.message.contains(HANDS_FREE_COMPLETE_MARKER) => {
                    complete = true;
                }
                _ => {}
            }
        }

        if complete {
            Ok(CommandOutcome {
                stdout: last_assistant,
                exit_code: Some(0),
                ..Default::default()
            })
        } else {
            Ok(CommandOutcome {
                stderr: last_assistant,
                details: format!("research did not complete within {max_passes} pass(es)"),
                exit_code: Some(1),
                ..Default::default()
            })
        }
    }
}
