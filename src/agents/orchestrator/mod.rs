//! Orchestrator - mission driver and command interface.
//!
//! # Mission Flow
//! ```text
//! 1. Reset the findings registry
//! 2. Expand the agent config tree, gated by the spawn budget
//! 3. Run every agent's loop concurrently (see executor)
//! 4. Wait until all agents are completed or failed
//! 5. Synthesize the completions into a final answer
//! ```
//!
//! Commands (`pause`, `resume`, `respond_to_input`, `stop`) are safe to
//! call at any time and are no-ops where they do not apply.

mod executor;
mod mission;

pub use mission::MissionReport;

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::agents::context::AgentContext;
use crate::agents::{AgentId, AgentSnapshot, AgentStatus};
use crate::config::Config;
use crate::events::AgentEvent;
use crate::findings::FindingsRegistry;
use crate::llm::ModelClient;
use crate::queue::{QueueMetrics, RequestQueue};
use crate::store::MissionStore;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors that prevent a mission from running.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("A mission is already running")]
    MissionInProgress,

    #[error("No agents could be started: {0}")]
    NoAgents(String),
}

struct Inner {
    config: Config,
    client: Arc<dyn ModelClient>,
    queue: RequestQueue<String>,
    findings: Arc<FindingsRegistry>,
    events: broadcast::Sender<AgentEvent>,
    store: Option<Arc<dyn MissionStore>>,
    /// Context of the running mission, if any.
    current: RwLock<Option<Arc<AgentContext>>>,
}

/// Drives missions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        client: Arc<dyn ModelClient>,
        store: Option<Arc<dyn MissionStore>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                queue: RequestQueue::new(config.queue_config()),
                config,
                client,
                findings: Arc::new(FindingsRegistry::new()),
                events,
                store,
                current: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue_metrics(&self) -> QueueMetrics {
        self.inner.queue.metrics()
    }

    pub fn findings(&self) -> &FindingsRegistry {
        &self.inner.findings
    }

    async fn current(&self) -> Option<Arc<AgentContext>> {
        self.inner.current.read().await.clone()
    }

    /// Whether a mission is in progress.
    pub async fn is_running(&self) -> bool {
        self.inner.current.read().await.is_some()
    }

    /// Agents of the running mission (empty when idle).
    pub async fn agents(&self) -> Vec<AgentSnapshot> {
        match self.current().await {
            Some(ctx) => ctx.snapshots().await,
            None => Vec::new(),
        }
    }

    /// Hold a working agent. Its loop stops calling the model until resumed.
    pub async fn pause(&self, id: &AgentId) -> bool {
        let Some(ctx) = self.current().await else {
            return false;
        };
        ctx.transition(id, AgentStatus::Paused, "Paused", |r| {
            matches!(r.status, AgentStatus::Working | AgentStatus::Spawning)
        })
        .await
    }

    pub async fn resume(&self, id: &AgentId) -> bool {
        let Some(ctx) = self.current().await else {
            return false;
        };
        ctx.transition(id, AgentStatus::Working, "Resumed", |r| {
            r.status == AgentStatus::Paused
        })
        .await
    }

    /// Answer an agent's pending input request.
    pub async fn respond_to_input(&self, id: &AgentId, response: impl Into<String>) -> bool {
        let Some(ctx) = self.current().await else {
            return false;
        };
        let response = response.into();
        let reply = response.clone();
        let accepted = ctx
            .transition(id, AgentStatus::Working, "Resuming with user input", |r| {
                if r.status != AgentStatus::Waiting {
                    return false;
                }
                r.input_response = Some(reply);
                true
            })
            .await;

        if accepted {
            ctx.emit(AgentEvent::InputReceived {
                agent_id: *id,
                response,
            })
            .await;
        }
        accepted
    }

    /// Stop the running mission.
    ///
    /// Cancels every queued model call and fails all agents that have not
    /// finished. Calls already in flight run to completion and are ignored.
    pub async fn stop(&self) {
        let Some(ctx) = self.current().await else {
            return;
        };
        if ctx.is_cancelled() {
            return;
        }

        tracing::info!(mission_id = %ctx.mission_id, "Stopping mission");
        ctx.cancel_token.cancel();
        let cancelled = ctx.queue.cancel_all();
        tracing::debug!(cancelled, "Dropped queued requests");

        for agent in ctx.snapshots().await {
            if !agent.status.is_terminal() {
                ctx.set_status(&agent.id, AgentStatus::Failed, "Stopped")
                    .await;
            }
        }
    }
}
