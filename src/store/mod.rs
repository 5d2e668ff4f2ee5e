//! Mission storage.
//!
//! The orchestrator works without any store. When one is attached it
//! receives mission status, agent records and events so a session can be
//! inspected or rehydrated later. Store failures are logged, never fatal.

mod memory;

pub use memory::InMemoryMissionStore;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::{AgentId, AgentSnapshot};
use crate::events::AgentEvent;

/// Mission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    Active,
    Completed,
    Failed,
    /// Stopped before every agent finished.
    Interrupted,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A mission: one orchestration run from config to synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub status: MissionStatus,
    pub title: Option<String>,
    /// Final synthesis, once the mission has completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// When this mission was interrupted (if status is Interrupted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted_at: Option<String>,
    /// Why the mission terminated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
}

/// A stored event with metadata (for replay/debugging).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub mission_id: Uuid,
    pub sequence: u64,
    pub event_type: String,
    pub agent_id: Option<AgentId>,
    pub timestamp: String,
    pub event: AgentEvent,
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Mission store trait - implemented by all storage backends.
#[async_trait]
pub trait MissionStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// List missions, ordered by updated_at descending.
    async fn list_missions(&self, limit: usize, offset: usize) -> Result<Vec<Mission>, String>;

    /// Get a single mission by ID.
    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>, String>;

    /// Create a new mission in `Pending` status.
    async fn create_mission(&self, title: Option<&str>) -> Result<Mission, String>;

    /// Update mission status.
    async fn update_mission_status(&self, id: Uuid, status: MissionStatus) -> Result<(), String> {
        self.update_mission_status_with_reason(id, status, None)
            .await
    }

    /// Update mission status with terminal reason.
    async fn update_mission_status_with_reason(
        &self,
        id: Uuid,
        status: MissionStatus,
        terminal_reason: Option<&str>,
    ) -> Result<(), String>;

    /// Record the final synthesis.
    async fn update_mission_synthesis(&self, id: Uuid, synthesis: &str) -> Result<(), String>;

    /// Insert or replace an agent record.
    async fn upsert_agent(&self, mission_id: Uuid, agent: &AgentSnapshot) -> Result<(), String>;

    /// Agent records of a mission, in first-seen order.
    async fn list_agents(&self, mission_id: Uuid) -> Result<Vec<AgentSnapshot>, String>;

    // === Event logging (default no-op) ===

    async fn log_event(&self, _mission_id: Uuid, _event: &AgentEvent) -> Result<(), String> {
        Ok(())
    }

    /// Events of a mission in the order they were logged, limited to the
    /// most recent `limit` when given.
    async fn get_events(
        &self,
        _mission_id: Uuid,
        _limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, String> {
        Ok(Vec::new())
    }
}
