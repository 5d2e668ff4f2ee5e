//! Core types for the agent system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::Priority;
use crate::spawn::TreeNode;
use crate::stream::InputRequest;

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Create a new unique agent ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of work an agent does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Coordinator,
    Researcher,
    Executor,
    Validator,
    Synthesizer,
}

impl AgentRole {
    /// One-line role guidance included in the system prompt.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Coordinator => {
                "You break the objective into parts and delegate them to child agents."
            }
            Self::Researcher => "You gather information and report concrete findings.",
            Self::Executor => "You carry out concrete tasks and report the results.",
            Self::Validator => "You check other agents' work for errors and gaps.",
            Self::Synthesizer => "You combine results from other agents into one coherent answer.",
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coordinator" => Ok(Self::Coordinator),
            "researcher" => Ok(Self::Researcher),
            "executor" => Ok(Self::Executor),
            "validator" => Ok(Self::Validator),
            "synthesizer" => Ok(Self::Synthesizer),
            other => Err(format!("unknown agent role: {}", other)),
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Coordinator => "coordinator",
            Self::Researcher => "researcher",
            Self::Executor => "executor",
            Self::Validator => "validator",
            Self::Synthesizer => "synthesizer",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state of an agent.
///
/// ```text
/// spawning -> working -> {completed | failed | waiting | paused}
/// waiting | paused -> working
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Spawning,
    Working,
    /// Blocked on human input.
    Waiting,
    /// Held by an external command.
    Paused,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Working => "working",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Declarative agent tree used to seed a mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub role: AgentRole,
    pub name: String,
    pub objective: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Model override for this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AgentConfig>,
}

/// The agent as seen by a model backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub objective: String,
    pub depth: usize,
    pub priority: Priority,
    pub model: Option<String>,
}

impl AgentDescriptor {
    /// Synthetic agent used for context compression calls.
    pub fn summarizer() -> Self {
        Self {
            id: AgentId::new(),
            name: "Context Summarizer".to_string(),
            role: AgentRole::Synthesizer,
            objective: "Summarize an agent's work history".to_string(),
            depth: 0,
            priority: Priority::Normal,
            model: None,
        }
    }

    /// Synthetic agent used for the final mission synthesis.
    pub fn synthesizer() -> Self {
        Self {
            id: AgentId::new(),
            name: "Mission Synthesizer".to_string(),
            role: AgentRole::Synthesizer,
            objective: "Combine all agent results into a final answer".to_string(),
            depth: 0,
            priority: Priority::Critical,
            model: None,
        }
    }
}

/// Live state of one agent, owned by the orchestrator.
///
/// The conversation itself is owned by the agent's execution loop and is
/// not part of this record.
///
/// # Invariants
/// - `depth == parent.depth + 1`, roots have depth 0
/// - `0.0 <= progress <= 100.0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub parent_id: Option<AgentId>,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub priority: Priority,
    pub progress: f64,
    pub objective: String,
    pub depth: usize,
    pub iteration: u32,
    /// Human-readable description of what the agent is doing.
    pub activity: String,
    pub pending_input: Option<InputRequest>,
    /// Answer to `pending_input`, consumed by the execution loop.
    pub input_response: Option<String>,
    pub output: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(
        config: &AgentConfig,
        parent_id: Option<AgentId>,
        depth: usize,
        default_priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            parent_id,
            name: config.name.clone(),
            role: config.role,
            status: AgentStatus::Spawning,
            priority: config.priority.unwrap_or(default_priority),
            progress: 0.0,
            objective: config.objective.clone(),
            depth,
            iteration: 0,
            activity: "Spawning".to_string(),
            pending_input: None,
            input_response: None,
            output: None,
            model: config.model.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            objective: self.objective.clone(),
            depth: self.depth,
            priority: self.priority,
            model: self.model.clone(),
        }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            parent_id: self.parent_id,
            name: self.name.clone(),
            role: self.role,
            status: self.status,
            priority: self.priority,
            progress: self.progress,
            objective: self.objective.clone(),
            depth: self.depth,
            iteration: self.iteration,
            activity: self.activity.clone(),
            pending_input: self.pending_input.clone(),
            output: self.output.clone(),
        }
    }

    /// Add `delta` to progress, clamped to 0..=100.
    pub fn add_progress(&mut self, delta: f64) {
        if delta.is_finite() {
            self.progress = (self.progress + delta).clamp(0.0, 100.0);
        }
    }
}

impl TreeNode for AgentRecord {
    fn node_id(&self) -> AgentId {
        self.id
    }

    fn parent(&self) -> Option<AgentId> {
        self.parent_id
    }
}

/// Read-only view of an agent for the UI, the store and spawn decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub parent_id: Option<AgentId>,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub priority: Priority,
    pub progress: f64,
    pub objective: String,
    pub depth: usize,
    pub iteration: u32,
    pub activity: String,
    pub pending_input: Option<InputRequest>,
    pub output: Option<String>,
}

impl TreeNode for AgentSnapshot {
    fn node_id(&self) -> AgentId {
        self.id
    }

    fn parent(&self) -> Option<AgentId> {
        self.parent_id
    }
}
