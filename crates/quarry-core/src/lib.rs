//! Configuration, conversation orchestrator, and sub-agents.

pub mod agents;
pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod prompt;
pub mod session;
pub mod tool_call;

pub use config::Config;
pub use error::{OrchestratorError, TurnError};
pub use orchestrator::{
    FinishReason, Orchestrator, OrchestratorConfig, TurnEvent, TurnRequest, TurnStream,
    TurnSummary,
};
pub use session::{HistoryEntry, TurnState};
