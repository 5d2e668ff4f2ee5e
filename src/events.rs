//! Events published for UI layers and the mission store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agents::{AgentId, AgentSnapshot, AgentStatus};
use crate::store::MissionStatus;
use crate::stream::InputRequest;

/// A structured event emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentSpawned {
        agent: AgentSnapshot,
    },
    StatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
        activity: String,
    },
    Progress {
        agent_id: AgentId,
        progress: f64,
        iteration: u32,
        activity: String,
    },
    /// Streamed model output. Broadcast only, never persisted.
    Delta {
        agent_id: AgentId,
        delta: String,
    },
    Finding {
        agent_id: AgentId,
        agent_name: String,
        content: String,
    },
    SpawnDenied {
        agent_id: AgentId,
        requested: usize,
        reason: String,
    },
    InputRequested {
        agent_id: AgentId,
        request: InputRequest,
    },
    InputReceived {
        agent_id: AgentId,
        response: String,
    },
    ContextCompressed {
        agent_id: AgentId,
        iteration: u32,
    },
    Search {
        agent_id: AgentId,
        query: Value,
    },
    Artifact {
        agent_id: AgentId,
        artifact: Value,
    },
    /// A child's completion was handed up to its parent.
    FindingsTransferred {
        from: AgentId,
        to: AgentId,
    },
    MissionStatusChanged {
        mission_id: Uuid,
        status: MissionStatus,
    },
    MissionCompleted {
        mission_id: Uuid,
        synthesis: String,
    },
}

impl AgentEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            AgentEvent::AgentSpawned { .. } => "agent_spawned",
            AgentEvent::StatusChanged { .. } => "status_changed",
            AgentEvent::Progress { .. } => "progress",
            AgentEvent::Delta { .. } => "delta",
            AgentEvent::Finding { .. } => "finding",
            AgentEvent::SpawnDenied { .. } => "spawn_denied",
            AgentEvent::InputRequested { .. } => "input_requested",
            AgentEvent::InputReceived { .. } => "input_received",
            AgentEvent::ContextCompressed { .. } => "context_compressed",
            AgentEvent::Search { .. } => "search",
            AgentEvent::Artifact { .. } => "artifact",
            AgentEvent::FindingsTransferred { .. } => "findings_transferred",
            AgentEvent::MissionStatusChanged { .. } => "mission_status_changed",
            AgentEvent::MissionCompleted { .. } => "mission_completed",
        }
    }

    /// The agent this event is about, if any.
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            AgentEvent::AgentSpawned { agent } => Some(agent.id),
            AgentEvent::StatusChanged { agent_id, .. }
            | AgentEvent::Progress { agent_id, .. }
            | AgentEvent::Delta { agent_id, .. }
            | AgentEvent::Finding { agent_id, .. }
            | AgentEvent::SpawnDenied { agent_id, .. }
            | AgentEvent::InputRequested { agent_id, .. }
            | AgentEvent::InputReceived { agent_id, .. }
            | AgentEvent::ContextCompressed { agent_id, .. }
            | AgentEvent::Search { agent_id, .. }
            | AgentEvent::Artifact { agent_id, .. } => Some(*agent_id),
            AgentEvent::FindingsTransferred { from, .. } => Some(*from),
            AgentEvent::MissionStatusChanged { .. } | AgentEvent::MissionCompleted { .. } => None,
        }
    }

    /// Whether the event is worth writing to the mission store.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, AgentEvent::Delta { .. })
    }
}
