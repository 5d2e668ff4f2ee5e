//! Agents module - trees of cooperating model-driven agents.
//!
//! # Pieces
//! - **AgentTree**: the live agent population of a mission
//! - **AgentContext**: shared state handed to every agent loop
//! - **Orchestrator**: starts missions, runs agent loops, takes commands
//!
//! # Design Principles
//! - Agents never call each other; they share results through the
//!   findings registry
//! - Every model call goes through the request queue
//! - Spawning is gated by a pure budget check

mod context;
mod orchestrator;
mod prompt;
mod tree;
mod types;

pub use context::AgentContext;
pub use orchestrator::{MissionReport, Orchestrator, OrchestratorError};
pub use tree::{AgentTree, TreeError};
pub use types::{
    AgentConfig, AgentDescriptor, AgentId, AgentRecord, AgentRole, AgentSnapshot, AgentStatus,
};
