//! In-process command registry.
//!
//! A step whose `shell` is `openagent` never touches a subprocess: its
//! `run` line is tokenized with shell-like quoting, the first token picks
//! a registered handler, and the rest become `key=value` arguments and
//! positionals.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use goagent_protocol::PlanStep;

use crate::error::AgentErr;
use crate::error::Result;
use crate::exec::CommandOutcome;

/// Parsed invocation handed to a handler.
#[derive(Debug, Clone)]
pub struct InternalCommandRequest {
    /// Lowercased command name (the first token).
    pub name: String,
    /// The full, untokenized `run` line.
    pub raw: String,
    /// `key=value` tokens after the name.
    pub args: HashMap<String, String>,
    /// Remaining tokens in order.
    pub positionals: Vec<String>,
    /// The step being executed, for context fields like the title.
    pub step: PlanStep,
    /// Resolved working directory for filesystem effects.
    pub cwd: PathBuf,
}

#[async_trait]
pub trait InternalCommand: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, req: InternalCommandRequest) -> Result<CommandOutcome>;
}

/// Name-indexed set of in-process commands.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn InternalCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: Arc<dyn InternalCommand>) {
        self.commands
            .insert(command.name().to_lowercase(), command);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tokenize the step's `run` line and invoke the matching handler.
    pub(crate) async fn dispatch(&self, step: &PlanStep, cwd: &Path) -> Result<CommandOutcome> {
        let raw = step.command.run.trim();
        if raw.is_empty() {
            return Err(AgentErr::InternalCommand(
                "empty internal command line".to_string(),
            ));
        }
        let tokens = shlex::split(raw).ok_or_else(|| {
            AgentErr::InternalCommand(format!("unbalanced quoting in command line: {raw}"))
        })?;
        let Some((first, rest)) = tokens.split_first() else {
            return Err(AgentErr::InternalCommand(
                "empty internal command line".to_string(),
            ));
        };
        let name = first.to_lowercase();
        let handler = self.commands.get(&name).ok_or_else(|| {
            AgentErr::InternalCommand(format!(
                "unknown internal command `{name}` (available: {})",
                self.names().join(", ")
            ))
        })?;

        let mut args = HashMap::new();
        let mut positionals = Vec::new();
        for token in rest {
            match token.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    args.insert(key.to_string(), value.to_string());
                }
                _ => positionals.push(token.clone()),
            }
        }

        handler
            .run(InternalCommandRequest {
                name,
                raw: raw.to_string(),
                args,
                positionals,
                step: step.clone(),
                cwd: cwd.to_path_buf(),
            })
            .await
    }
}
