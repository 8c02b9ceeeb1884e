//! The embedded plan schema and the tool-call validator.
//!
//! Validation happens in three stages, cheapest first: empty arguments,
//! JSON decode, then a full JSON Schema evaluation. Each failure carries a
//! ready-to-append observation payload so the runtime can run the feedback
//! protocol without re-deriving anything.

use goagent_protocol::PlanObservationPayload;
use goagent_protocol::PlanResponse;
use goagent_protocol::ToolCall;
use serde_json::json;
use serde_json::Value;

use crate::error::AgentErr;
use crate::error::Result;

/// A rejected plan tool call, with the feedback to send back.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub summary: String,
    pub details: String,
    pub payload: PlanObservationPayload,
}

impl ValidationFailure {
    fn json_parse(details: String) -> Self {
        Self {
            summary: "Model response was not valid plan JSON.".to_string(),
            payload: PlanObservationPayload {
                summary: "Model response was not valid plan JSON.".to_string(),
                details: details.clone(),
                json_parse_error: true,
                response_validation_error: true,
                ..Default::default()
            },
            details,
        }
    }

    fn schema(details: String) -> Self {
        Self {
            summary: "Model plan failed schema validation.".to_string(),
            payload: PlanObservationPayload {
                summary: "Model plan failed schema validation.".to_string(),
                details: details.clone(),
                schema_validation_error: true,
                response_validation_error: true,
                ..Default::default()
            },
            details,
        }
    }
}

/// Compiled validator for the plan tool's `parameters` schema.
pub struct PlanValidator {
    compiled: jsonschema::Validator,
}

impl PlanValidator {
    /// Compile the embedded schema. A failure here is fatal for the
    /// runtime, not a per-request validation error.
    pub fn new() -> Result<Self> {
        let schema = plan_parameters_schema();
        let compiled =
            jsonschema::validator_for(&schema).map_err(|err| AgentErr::Schema(err.to_string()))?;
        Ok(Self { compiled })
    }

    /// Check a streamed tool call and decode it into a [`PlanResponse`].
    pub fn validate(
        &self,
        tool_call: &ToolCall,
    ) -> std::result::Result<PlanResponse, Box<ValidationFailure>> {
        let raw = tool_call.arguments.trim();
        if raw.is_empty() {
            return Err(Box::new(ValidationFailure::json_parse(
                "tool arguments were empty".to_string(),
            )));
        }
        let instance: Value = serde_json::from_str(raw)
            .map_err(|err| Box::new(ValidationFailure::json_parse(err.to_string())))?;
        let response: PlanResponse = serde_json::from_value(instance.clone())
            .map_err(|err| Box::new(ValidationFailure::json_parse(err.to_string())))?;
        let issues: Vec<String> = self
            .compiled
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .collect();
        if !issues.is_empty() {
            return Err(Box::new(ValidationFailure::schema(issues.join("; "))));
        }
        Ok(response)
    }
}

/// JSON Schema for the plan tool's arguments. Mirrors [`PlanResponse`]
/// field for field; the wire names are camelCase.
pub fn plan_parameters_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "additionalProperties": false,
        "required": ["message", "plan", "requireHumanInput"],
        "properties": {
            "message": {
                "type": "string",
                "description": "Short status update for the operator."
            },
            "reasoning": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Optional reasoning notes, one per entry."
            },
            "requireHumanInput": {
                "type": "boolean",
                "description": "True when the agent is blocked on the operator."
            },
            "plan": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["id", "title", "status", "command"],
                    "properties": {
                        "id": { "type": "string", "minLength": 1 },
                        "title": { "type": "string" },
                        "status": {
                            "type": "string",
                            "enum": ["Pending", "Completed", "Failed", "Abandoned"]
                        },
                        "waitingForId": {
                            "type": ["array", "null"],
                            "items": { "type": "string" }
                        },
                        "observation": { "type": ["string", "null"] },
                        "command": {
                            "type": "object",
                            "additionalProperties": false,
                            "required": ["shell", "run"],
                            "properties": {
                                "reason": { "type": "string" },
                                "shell": {
                                    "type": "string",
                                    "description": "Executable to run, or 'openagent' for built-in commands."
                                },
                                "run": { "type": "string" },
                                "cwd": { "type": "string" },
                                "timeoutSec": { "type": "integer" },
                                "filterRegex": { "type": "string" },
                                "tailLines": { "type": "integer" },
                                "maxBytes": { "type": "integer" }
                            }
                        }
                    }
                }
            }
        }
    })
}
