//! In-memory mission store (non-persistent).

use super::{now_string, Mission, MissionStatus, MissionStore, StoredEvent};
use crate::agents::{AgentId, AgentSnapshot};
use crate::events::AgentEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct AgentTable {
    order: Vec<AgentId>,
    records: HashMap<AgentId, AgentSnapshot>,
}

#[derive(Clone, Default)]
pub struct InMemoryMissionStore {
    missions: Arc<RwLock<HashMap<Uuid, Mission>>>,
    agents: Arc<RwLock<HashMap<Uuid, AgentTable>>>,
    events: Arc<RwLock<HashMap<Uuid, Vec<StoredEvent>>>>,
}

impl InMemoryMissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ensure_mission(&self, id: Uuid) -> Result<(), String> {
        if self.missions.read().await.contains_key(&id) {
            Ok(())
        } else {
            Err(format!("Mission {} not found", id))
        }
    }
}

#[async_trait]
impl MissionStore for InMemoryMissionStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn list_missions(&self, limit: usize, offset: usize) -> Result<Vec<Mission>, String> {
        let mut missions: Vec<Mission> = self.missions.read().await.values().cloned().collect();
        missions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(missions.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>, String> {
        Ok(self.missions.read().await.get(&id).cloned())
    }

    async fn create_mission(&self, title: Option<&str>) -> Result<Mission, String> {
        let now = now_string();
        let mission = Mission {
            id: Uuid::new_v4(),
            status: MissionStatus::Pending,
            title: title.map(|s| s.to_string()),
            synthesis: None,
            created_at: now.clone(),
            updated_at: now,
            interrupted_at: None,
            terminal_reason: None,
        };
        self.missions
            .write()
            .await
            .insert(mission.id, mission.clone());
        Ok(mission)
    }

    async fn update_mission_status_with_reason(
        &self,
        id: Uuid,
        status: MissionStatus,
        terminal_reason: Option<&str>,
    ) -> Result<(), String> {
        let mut missions = self.missions.write().await;
        let mission = missions
            .get_mut(&id)
            .ok_or_else(|| format!("Mission {} not found", id))?;
        let now = now_string();
        mission.status = status;
        mission.updated_at = now.clone();
        mission.terminal_reason = terminal_reason.map(|s| s.to_string());
        mission.interrupted_at = (status == MissionStatus::Interrupted).then_some(now);
        Ok(())
    }

    async fn update_mission_synthesis(&self, id: Uuid, synthesis: &str) -> Result<(), String> {
        let mut missions = self.missions.write().await;
        let mission = missions
            .get_mut(&id)
            .ok_or_else(|| format!("Mission {} not found", id))?;
        mission.synthesis = Some(synthesis.to_string());
        mission.updated_at = now_string();
        Ok(())
    }

    async fn upsert_agent(&self, mission_id: Uuid, agent: &AgentSnapshot) -> Result<(), String> {
        self.ensure_mission(mission_id).await?;
        let mut agents = self.agents.write().await;
        let table = agents.entry(mission_id).or_default();
        if table.records.insert(agent.id, agent.clone()).is_none() {
            table.order.push(agent.id);
        }
        Ok(())
    }

    async fn list_agents(&self, mission_id: Uuid) -> Result<Vec<AgentSnapshot>, String> {
        let agents = self.agents.read().await;
        Ok(agents
            .get(&mission_id)
            .map(|table| {
                table
                    .order
                    .iter()
                    .filter_map(|id| table.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn log_event(&self, mission_id: Uuid, event: &AgentEvent) -> Result<(), String> {
        self.ensure_mission(mission_id).await?;
        let mut events = self.events.write().await;
        let log = events.entry(mission_id).or_default();
        log.push(StoredEvent {
            mission_id,
            sequence: log.len() as u64,
            event_type: event.event_name().to_string(),
            agent_id: event.agent_id(),
            timestamp: now_string(),
            event: event.clone(),
        });
        Ok(())
    }

    async fn get_events(
        &self,
        mission_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, String> {
        let events = self.events.read().await;
        let log = events.get(&mission_id).map(Vec::as_slice).unwrap_or(&[]);
        let skip = limit.map(|l| log.len().saturating_sub(l)).unwrap_or(0);
        Ok(log[skip..].to_vec())
    }
}
