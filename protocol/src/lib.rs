//! Wire and value types shared between the `goagent` runtime and its hosts.
//!
//! This crate is deliberately free of I/O: everything here is plain data
//! that serializes with serde, so front-ends and embedders can depend on it
//! without pulling in the runtime.

pub mod models;
pub mod plan;
pub mod protocol;

pub use models::ChatMessage;
pub use models::Role;
pub use models::ToolCall;
pub use plan::CommandDraft;
pub use plan::PlanObservationPayload;
pub use plan::PlanResponse;
pub use plan::PlanStep;
pub use plan::StepObservation;
pub use plan::StepStatus;
pub use protocol::EventLevel;
pub use protocol::InputEvent;
pub use protocol::OutputEvent;
pub use protocol::OutputEventKind;
