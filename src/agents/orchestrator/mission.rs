//! Mission lifecycle: expansion, settling and synthesis.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::executor::{call_model, pause_for, start_agent};
use super::{Orchestrator, OrchestratorError};
use crate::agents::context::AgentContext;
use crate::agents::{prompt, AgentConfig, AgentDescriptor, AgentId, AgentSnapshot, AgentTree};
use crate::config::MissionSpec;
use crate::events::AgentEvent;
use crate::findings::Completion;
use crate::llm::ChatMessage;
use crate::queue::{Priority, QueueMetrics};
use crate::spawn::can_spawn;
use crate::store::MissionStatus;
use crate::stream::parse_agent_response;

/// Outcome of one mission.
#[derive(Debug, Clone, Serialize)]
pub struct MissionReport {
    pub mission_id: Uuid,
    pub title: Option<String>,
    pub status: MissionStatus,
    /// Final answer. `None` if the mission was stopped or nothing completed.
    pub synthesis: Option<String>,
    pub agents: Vec<AgentSnapshot>,
    pub completions: Vec<Completion>,
    pub queue: QueueMetrics,
}

impl Orchestrator {
    /// Run a mission to completion.
    ///
    /// Only one mission runs at a time per orchestrator.
    pub async fn run_mission(&self, spec: MissionSpec) -> Result<MissionReport, OrchestratorError> {
        let ctx = {
            let mut current = self.inner.current.write().await;
            if current.is_some() {
                return Err(OrchestratorError::MissionInProgress);
            }
            let ctx = Arc::new(self.new_context(spec.title.as_deref()).await);
            *current = Some(Arc::clone(&ctx));
            ctx
        };

        let result = self.drive(&ctx, &spec).await;
        *self.inner.current.write().await = None;
        result
    }

    async fn new_context(&self, title: Option<&str>) -> AgentContext {
        self.inner.findings.reset();

        let mission_id = match &self.inner.store {
            Some(store) => match store.create_mission(title).await {
                Ok(mission) => mission.id,
                Err(e) => {
                    tracing::warn!("Failed to create mission in store: {}", e);
                    Uuid::new_v4()
                }
            },
            None => Uuid::new_v4(),
        };

        AgentContext {
            config: self.inner.config.clone(),
            client: Arc::clone(&self.inner.client),
            queue: self.inner.queue.clone(),
            findings: Arc::clone(&self.inner.findings),
            tree: RwLock::new(AgentTree::new()),
            events: self.inner.events.clone(),
            store: self.inner.store.clone(),
            cancel_token: CancellationToken::new(),
            mission_id,
            settled: Notify::new(),
        }
    }

    async fn drive(
        &self,
        ctx: &Arc<AgentContext>,
        spec: &MissionSpec,
    ) -> Result<MissionReport, OrchestratorError> {
        tracing::info!(mission_id = %ctx.mission_id, title = ?spec.title, "Starting mission");
        set_mission_status(ctx, MissionStatus::Active, None).await;

        let started = expand(ctx, &spec.root).await;
        if started == 0 {
            set_mission_status(ctx, MissionStatus::Failed, Some("No agents started")).await;
            return Err(OrchestratorError::NoAgents(
                "the spawn budget admits no agents".to_string(),
            ));
        }

        wait_until_settled(ctx).await;

        let (status, synthesis) = if ctx.is_cancelled() {
            (MissionStatus::Interrupted, None)
        } else {
            match synthesize(ctx, spec.title.as_deref()).await {
                Some(text) => (MissionStatus::Completed, Some(text)),
                None => (MissionStatus::Failed, None),
            }
        };

        if let Some(text) = &synthesis {
            if let Some(store) = &ctx.store {
                if let Err(e) = store.update_mission_synthesis(ctx.mission_id, text).await {
                    tracing::warn!("Failed to store synthesis: {}", e);
                }
            }
            ctx.emit(AgentEvent::MissionCompleted {
                mission_id: ctx.mission_id,
                synthesis: text.clone(),
            })
            .await;
        }
        let reason = match status {
            MissionStatus::Interrupted => Some("Stopped"),
            MissionStatus::Failed => Some("No agent completed"),
            _ => None,
        };
        set_mission_status(ctx, status, reason).await;
        tracing::info!(mission_id = %ctx.mission_id, status = %status, "Mission finished");

        Ok(MissionReport {
            mission_id: ctx.mission_id,
            title: spec.title.clone(),
            status,
            synthesis,
            agents: ctx.snapshots().await,
            completions: ctx.findings.all_completions(),
            queue: ctx.queue.metrics(),
        })
    }
}

async fn set_mission_status(ctx: &AgentContext, status: MissionStatus, reason: Option<&str>) {
    if let Some(store) = &ctx.store {
        if let Err(e) = store
            .update_mission_status_with_reason(ctx.mission_id, status, reason)
            .await
        {
            tracing::warn!("Failed to update mission status: {}", e);
        }
    }
    ctx.emit(AgentEvent::MissionStatusChanged {
        mission_id: ctx.mission_id,
        status,
    })
    .await;
}

/// Seed agents from the config tree, breadth first, each gated by the
/// spawn budget. A denied agent's subtree is skipped. Returns the number
/// of agents started.
async fn expand(ctx: &Arc<AgentContext>, root: &AgentConfig) -> usize {
    let mut pending: VecDeque<(&AgentConfig, Option<AgentId>)> = VecDeque::from([(root, None)]);
    let mut started = 0;

    while let Some((config, parent)) = pending.pop_front() {
        if ctx.is_cancelled() {
            break;
        }

        let admitted = {
            let mut tree = ctx.tree.write().await;
            if ctx.is_cancelled() {
                break;
            }
            let decision = can_spawn(&ctx.config.spawn_budget, &tree.snapshots(), parent.as_ref());
            if decision.allowed {
                ctx.insert_agent(&mut tree, config, parent)
                    .map_err(|e| e.to_string())
            } else {
                Err(decision
                    .reason
                    .unwrap_or_else(|| "Spawn budget exhausted".to_string()))
            }
        };

        let record = match admitted {
            Ok(record) => record,
            Err(reason) => {
                tracing::warn!(agent = %config.name, "Not spawning configured agent: {}", reason);
                if let Some(parent_id) = parent {
                    ctx.emit(AgentEvent::SpawnDenied {
                        agent_id: parent_id,
                        requested: 1,
                        reason,
                    })
                    .await;
                }
                continue;
            }
        };

        ctx.emit(AgentEvent::AgentSpawned {
            agent: record.snapshot(),
        })
        .await;
        ctx.persist_agent(&record.id).await;

        if started > 0 && !pause_for(ctx, ctx.config.spawn_stagger).await {
            break;
        }
        start_agent(Arc::clone(ctx), record.id);
        started += 1;

        pending.extend(config.children.iter().map(|child| (child, Some(record.id))));
    }

    started
}

/// Wait until every agent is terminal or the mission is stopped.
async fn wait_until_settled(ctx: &AgentContext) {
    loop {
        let settled = ctx.settled.notified();
        if ctx.is_cancelled() || ctx.tree.read().await.all_terminal() {
            return;
        }
        tokio::select! {
            _ = settled => {}
            _ = ctx.cancel_token.cancelled() => {}
            _ = tokio::time::sleep(ctx.config.poll_interval) => {}
        }
    }
}

/// Combine all completions into a final answer.
///
/// Falls back to concatenating the completions if the model call fails.
/// `None` when there is nothing to synthesize.
async fn synthesize(ctx: &Arc<AgentContext>, title: Option<&str>) -> Option<String> {
    let completions = ctx.findings.all_completions();
    let results: Vec<(String, String)> = {
        let tree = ctx.tree.read().await;
        completions
            .iter()
            .filter(|c| !c.output.trim().is_empty())
            .map(|c| {
                let name = tree
                    .get(&c.agent_id)
                    .map(|r| r.name.clone())
                    .unwrap_or_else(|| c.agent_id.to_string());
                (name, c.output.clone())
            })
            .collect()
    };
    if results.is_empty() {
        return None;
    }

    tracing::info!(count = results.len(), "Synthesizing mission results");
    let request = vec![ChatMessage::user(prompt::synthesis(title, &results))];
    match call_model(ctx, AgentDescriptor::synthesizer(), Priority::Critical, request, false).await {
        Ok(text) => {
            let output = parse_agent_response(&text).output_text();
            if !output.trim().is_empty() {
                return Some(output);
            }
            tracing::warn!("Synthesis returned no output, concatenating results");
        }
        Err(e) => tracing::warn!("Synthesis failed, concatenating results: {}", e),
    }

    Some(
        results
            .iter()
            .map(|(name, output)| format!("## {}\n{}", name, output))
            .collect::<Vec<_>>()
            .join("\n\n"),
    )
}
