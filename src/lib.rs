//! # agent_swarm
//!
//! In-process orchestrator for trees of cooperating LLM agents.
//!
//! A mission starts from a tree of agent configs. Each agent runs its own
//! loop: it calls the model, reports progress and findings, may spawn
//! children within a budget, and eventually completes. When every agent
//! has finished, their results are synthesized into one answer.
//!
//! ## Architecture
//!
//! ```text
//!   Orchestrator ──► agent loops ──► RequestQueue ──► ModelClient
//!        │               │  ▲
//!        │               ▼  │
//!        │        FindingsRegistry
//!        ▼
//!   AgentEvent broadcast ──► MissionStore
//! ```
//!
//! ## Modules
//! - `agents`: agent types, the agent tree and the orchestrator
//! - `queue`: prioritized, rate-limit aware model call queue
//! - `spawn`: spawn budget checks
//! - `compress`: conversation compression
//! - `findings`: shared findings and completions
//! - `stream`: streamed output decoding and response parsing
//! - `llm`: model client interface and the OpenRouter client
//! - `store`: mission persistence

pub mod agents;
pub mod compress;
pub mod config;
pub mod events;
pub mod findings;
pub mod llm;
pub mod queue;
pub mod spawn;
pub mod store;
pub mod stream;
pub mod util;

pub use agents::{MissionReport, Orchestrator, OrchestratorError};
pub use config::{Config, MissionSpec};
pub use events::AgentEvent;
