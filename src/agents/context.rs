//! Agent execution context - shared state for one mission.

use std::sync::Arc;

use tokio::sync::{broadcast, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{AgentConfig, AgentId, AgentRecord, AgentSnapshot, AgentStatus, AgentTree, TreeError};
use crate::config::Config;
use crate::events::AgentEvent;
use crate::findings::FindingsRegistry;
use crate::llm::ModelClient;
use crate::queue::{Priority, RequestQueue};
use crate::store::MissionStore;

/// Shared context passed to every agent loop of a mission.
///
/// # Thread Safety
/// Held in an `Arc` by each agent task. The agent tree is behind a tokio
/// `RwLock`; the findings registry and queue synchronize internally.
pub struct AgentContext {
    pub config: Config,

    /// Model backend. Only ever called through `queue`.
    pub client: Arc<dyn ModelClient>,

    /// Process-wide request queue
    pub queue: RequestQueue<String>,

    pub findings: Arc<FindingsRegistry>,

    /// Live agent population
    pub tree: RwLock<AgentTree>,

    /// Event sink for UI layers
    pub events: broadcast::Sender<AgentEvent>,

    /// Optional persistence
    pub store: Option<Arc<dyn MissionStore>>,

    /// Cancelled by `stop()`
    pub cancel_token: CancellationToken,

    pub mission_id: Uuid,

    /// Signalled whenever an agent reaches a terminal state.
    pub settled: Notify,
}

impl AgentContext {
    /// Check if cooperative cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Publish an event and append it to the store.
    ///
    /// Sending never fails: no subscribers is fine, and store errors are
    /// logged.
    pub async fn emit(&self, event: AgentEvent) {
        if event.is_persistent() {
            if let Some(store) = &self.store {
                if let Err(e) = store.log_event(self.mission_id, &event).await {
                    tracing::warn!("Failed to persist {} event: {}", event.event_name(), e);
                }
            }
        }
        let _ = self.events.send(event);
    }

    /// Publish a streamed delta. Broadcast only.
    pub fn emit_delta(&self, agent_id: AgentId, delta: &str) {
        let _ = self.events.send(AgentEvent::Delta {
            agent_id,
            delta: delta.to_string(),
        });
    }

    /// Write the agent's current record to the store, if any.
    pub async fn persist_agent(&self, id: &AgentId) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(snapshot) = self.snapshot(id).await else {
            return;
        };
        if let Err(e) = store.upsert_agent(self.mission_id, &snapshot).await {
            tracing::warn!(agent_id = %id, "Failed to persist agent: {}", e);
        }
    }

    pub async fn snapshot(&self, id: &AgentId) -> Option<AgentSnapshot> {
        self.tree.read().await.get(id).map(AgentRecord::snapshot)
    }

    pub async fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.tree.read().await.snapshots()
    }

    /// Apply `f` to an agent's record. Returns `None` if the agent is unknown.
    pub async fn update_agent<R>(
        &self,
        id: &AgentId,
        f: impl FnOnce(&mut AgentRecord) -> R,
    ) -> Option<R> {
        let mut tree = self.tree.write().await;
        let record = tree.get_mut(id)?;
        let result = f(record);
        record.updated_at = chrono::Utc::now();
        Some(result)
    }

    /// Move an agent to `status`, publish the change and persist it.
    ///
    /// Terminal states are final: once completed or failed, later calls
    /// are ignored and return `false`.
    pub async fn set_status(&self, id: &AgentId, status: AgentStatus, activity: &str) -> bool {
        self.transition(id, status, activity, |record| !record.status.is_terminal())
            .await
    }

    /// Like [`set_status`](Self::set_status), but only if `guard` accepts
    /// the current record. `guard` runs under the tree lock and may adjust
    /// the record before the status changes.
    pub async fn transition(
        &self,
        id: &AgentId,
        status: AgentStatus,
        activity: &str,
        guard: impl FnOnce(&mut AgentRecord) -> bool,
    ) -> bool {
        let changed = self
            .update_agent(id, |record| {
                if record.status.is_terminal() || !guard(record) {
                    return false;
                }
                record.status = status;
                record.activity = activity.to_string();
                if status != AgentStatus::Waiting {
                    record.pending_input = None;
                }
                true
            })
            .await
            .unwrap_or(false);

        if changed {
            tracing::info!(agent_id = %id, status = %status, "{}", activity);
            self.emit(AgentEvent::StatusChanged {
                agent_id: *id,
                status,
                activity: activity.to_string(),
            })
            .await;
            self.persist_agent(id).await;
            if status.is_terminal() {
                self.settled.notify_waiters();
            }
        }
        changed
    }

    /// Create a record for `config` under `parent` inside an already-locked tree.
    ///
    /// The caller is responsible for the spawn budget check.
    pub fn insert_agent(
        &self,
        tree: &mut AgentTree,
        config: &AgentConfig,
        parent: Option<AgentId>,
    ) -> Result<AgentRecord, TreeError> {
        let depth = match parent {
            Some(parent_id) => {
                tree.get(&parent_id)
                    .ok_or(TreeError::ParentNotFound(parent_id))?
                    .depth
                    + 1
            }
            None => 0,
        };
        let record = AgentRecord::new(config, parent, depth, Priority::Normal);
        tree.insert(record.clone())?;
        Ok(record)
    }
}
