//! goagent-core: an autonomous agent runtime.
//!
//! The runtime drives an LLM through repeated plan/execute/observe passes:
//! it requests a structured plan as a forced function call, validates it
//! against an embedded JSON schema, executes the plan's shell and
//! in-process commands concurrently while honoring dependencies, and
//! feeds the consolidated observation back to the model. Hosts talk to it
//! through a pair of bounded event queues.

mod apply_patch;
mod client;
mod client_common;
mod config;
mod context_budget;
mod error;
mod exec;
mod history;
mod input_reader;
mod internal_commands;
mod partial_json;
mod plan_manager;
mod plan_schema;
mod research;
mod runtime;
mod util;

pub use apply_patch::apply_patch;
pub use apply_patch::ApplyPatchCommand;
pub use client::ModelClient;
pub use client::ResponsesClient;
pub use client_common::Prompt;
pub use client_common::ResponseEvent;
pub use client_common::PLAN_TOOL_NAME;
pub use config::Config;
pub use config::DEFAULT_BASE_URL;
pub use config::DEFAULT_MODEL;
pub use context_budget::budget_for_model;
pub use context_budget::estimate_history_tokens;
pub use context_budget::estimate_message_tokens;
pub use context_budget::ContextBudget;
pub use context_budget::ModelBudget;
pub use error::AgentErr;
pub use error::Result;
pub use exec::CommandOutcome;
pub use history::HistoryStore;
pub use internal_commands::CommandRegistry;
pub use internal_commands::InternalCommand;
pub use internal_commands::InternalCommandRequest;
pub use plan_manager::PlanManager;
pub use plan_schema::plan_parameters_schema;
pub use plan_schema::PlanValidator;
pub use plan_schema::ValidationFailure;
pub use research::RunResearchCommand;
pub use runtime::AgentRuntime;
pub use runtime::RuntimeMetrics;
