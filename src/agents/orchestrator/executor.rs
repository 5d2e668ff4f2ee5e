//! Per-agent execution loop.
//!
//! # Iteration
//! ```text
//! 1. compress context if due
//! 2. inject new child completions (and sibling findings every 3rd turn)
//! 3. build the system prompt with the current spawn budget
//! 4. call the model through the request queue
//! 5. parse the reply
//! 6. apply progress, findings, spawns, input requests, completion
//! 7. continuation prompt, sleep, repeat
//! ```
//! After `max_iterations` the agent is force-completed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::agents::context::AgentContext;
use crate::agents::{prompt, AgentConfig, AgentDescriptor, AgentId, AgentRecord, AgentStatus};
use crate::compress::{compress_context, should_compress};
use crate::events::AgentEvent;
use crate::llm::ChatMessage;
use crate::queue::{Priority, QueueError};
use crate::spawn::can_spawn;
use crate::stream::{parse_agent_response, parse_data_stream, AgentResponse, SpawnRequest};
use crate::util::stringify_value;

/// What the loop does after an iteration.
enum Step {
    Continue,
    Complete,
}

/// Start an agent's loop on its own task.
///
/// A panicking loop marks the agent failed instead of leaving the mission
/// waiting on it forever.
pub(crate) fn start_agent(ctx: Arc<AgentContext>, id: AgentId) {
    tokio::spawn(async move {
        let handle = tokio::spawn(run_agent(Arc::clone(&ctx), id));
        if let Err(e) = handle.await {
            tracing::error!(agent_id = %id, "Agent task aborted: {}", e);
            ctx.set_status(&id, AgentStatus::Failed, "Agent task aborted")
                .await;
        }
    });
}

/// Start several agents in order, `stagger` apart.
pub(crate) fn start_staggered(ctx: Arc<AgentContext>, ids: Vec<AgentId>) {
    let stagger = ctx.config.spawn_stagger;
    tokio::spawn(async move {
        for (i, id) in ids.into_iter().enumerate() {
            if i > 0 && !pause_for(&ctx, stagger).await {
                return;
            }
            start_agent(Arc::clone(&ctx), id);
        }
    });
}

/// Sleep for `duration` unless the mission is cancelled first.
/// Returns `false` on cancellation.
pub(crate) async fn pause_for(ctx: &AgentContext, duration: Duration) -> bool {
    tokio::select! {
        _ = ctx.cancel_token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Run one model call through the shared queue.
///
/// With `stream_deltas`, the streaming variant is used and every decoded
/// chunk is published as a delta event for `descriptor.id`.
pub(crate) async fn call_model(
    ctx: &Arc<AgentContext>,
    descriptor: AgentDescriptor,
    priority: Priority,
    messages: Vec<ChatMessage>,
    stream_deltas: bool,
) -> Result<String, QueueError> {
    let owner = descriptor.id;
    let task_ctx = Arc::clone(ctx);

    ctx.queue
        .enqueue(owner, priority, move || {
            let ctx = Arc::clone(&task_ctx);
            let descriptor = descriptor.clone();
            let messages = messages.clone();
            async move {
                if stream_deltas {
                    let stream = ctx.client.complete_stream(&descriptor, &messages).await?;
                    parse_data_stream(stream, |delta, _| ctx.emit_delta(owner, delta)).await
                } else {
                    ctx.client.complete(&descriptor, &messages).await
                }
            }
        })
        .await
}

async fn run_agent(ctx: Arc<AgentContext>, id: AgentId) {
    let Some(record) = ctx.tree.read().await.get(&id).cloned() else {
        return;
    };

    ctx.transition(&id, AgentStatus::Working, "Starting", |r| {
        r.status == AgentStatus::Spawning
    })
    .await;

    let mut messages = vec![ChatMessage::user(prompt::kickoff(&record))];
    let mut children_seen: Option<DateTime<Utc>> = None;
    let max_iterations = ctx.config.max_iterations;

    loop {
        if !hold_while_paused(&ctx, &id).await {
            return;
        }

        let Some(agent) = ctx.tree.read().await.get(&id).cloned() else {
            return;
        };
        if agent.status.is_terminal() {
            return;
        }
        if agent.iteration >= max_iterations {
            tracing::info!(agent_id = %id, "Reached {} iterations, force-completing", max_iterations);
            finish(&ctx, &id, "Completed (iteration limit reached)").await;
            return;
        }

        match run_iteration(&ctx, &agent, &mut messages, &mut children_seen).await {
            Ok(Step::Complete) => {
                finish(&ctx, &id, "Completed").await;
                return;
            }
            Ok(Step::Continue) => {}
            Err(QueueError::Cancelled) if ctx.is_cancelled() => {
                tracing::debug!(agent_id = %id, "Agent loop cancelled");
                return;
            }
            Err(e) => {
                tracing::error!(agent_id = %id, name = %agent.name, "Model call failed: {}", e);
                ctx.set_status(&id, AgentStatus::Failed, &format!("Failed: {}", e))
                    .await;
                return;
            }
        }

        if !pause_for(&ctx, ctx.config.iteration_delay).await {
            return;
        }
    }
}

async fn run_iteration(
    ctx: &Arc<AgentContext>,
    agent: &AgentRecord,
    messages: &mut Vec<ChatMessage>,
    children_seen: &mut Option<DateTime<Utc>>,
) -> Result<Step, QueueError> {
    let id = agent.id;

    if should_compress(agent.iteration, messages.len()) {
        let task_ctx = Arc::clone(ctx);
        let priority = agent.priority;
        *messages = compress_context(
            std::mem::take(messages),
            &agent.objective,
            |descriptor, request| async move {
                let text = call_model(&task_ctx, descriptor, priority, request, false).await?;
                Ok::<_, QueueError>(parse_agent_response(&text))
            },
        )
        .await;
        ctx.emit(AgentEvent::ContextCompressed {
            agent_id: id,
            iteration: agent.iteration,
        })
        .await;
    }

    inject_shared_context(ctx, agent, messages, children_seen).await;

    let (decision, total_agents) = {
        let tree = ctx.tree.read().await;
        let snapshots = tree.snapshots();
        (
            can_spawn(&ctx.config.spawn_budget, &snapshots, Some(&id)),
            snapshots.len(),
        )
    };
    let system = prompt::system_prompt(
        agent,
        &decision,
        &ctx.config.spawn_budget,
        total_agents,
        ctx.config.max_iterations,
    );
    let mut request = Vec::with_capacity(messages.len() + 1);
    request.push(ChatMessage::system(system));
    request.extend(messages.iter().cloned());

    let text = call_model(
        ctx,
        agent.descriptor(),
        agent.priority,
        request,
        ctx.config.streaming,
    )
    .await?;
    if ctx.is_cancelled() {
        return Err(QueueError::Cancelled);
    }

    let response = parse_agent_response(&text);
    messages.push(ChatMessage::assistant(text));

    let iteration = apply_progress(ctx, agent, &response).await?;
    publish_results(ctx, agent, &response).await;

    if let Some(requests) = response.spawn_agents.as_ref().filter(|r| !r.is_empty()) {
        if let Some(note) = spawn_children(ctx, agent, requests).await {
            messages.push(ChatMessage::user(note));
        }
    }

    if let Some(input) = response.input_request() {
        let waiting = ctx
            .transition(&id, AgentStatus::Waiting, "Waiting for input", |r| {
                r.pending_input = Some(input.clone());
                r.input_response = None;
                true
            })
            .await;
        if !waiting {
            return Err(QueueError::Cancelled);
        }
        ctx.emit(AgentEvent::InputRequested {
            agent_id: id,
            request: input.clone(),
        })
        .await;

        let reply = wait_for_input(ctx, &id)
            .await
            .ok_or(QueueError::Cancelled)?;
        messages.push(ChatMessage::user(prompt::input_response(&input.question, &reply)));
        messages.push(ChatMessage::user(prompt::continuation(
            iteration,
            ctx.config.max_iterations,
        )));
        return Ok(Step::Continue);
    }

    if response.complete {
        return Ok(Step::Complete);
    }

    messages.push(ChatMessage::user(prompt::continuation(
        iteration,
        ctx.config.max_iterations,
    )));
    Ok(Step::Continue)
}

/// Add child completions that arrived since the last look and, every third
/// iteration, recent sibling findings.
async fn inject_shared_context(
    ctx: &AgentContext,
    agent: &AgentRecord,
    messages: &mut Vec<ChatMessage>,
    children_seen: &mut Option<DateTime<Utc>>,
) {
    let (children, snapshots) = {
        let tree = ctx.tree.read().await;
        (tree.children(&agent.id), tree.snapshots())
    };

    if !children.is_empty() {
        let fresh = ctx
            .findings
            .get_new_completions_since(&children, *children_seen);
        if let Some(latest) = fresh.iter().map(|c| c.timestamp).max() {
            *children_seen = Some(latest);
            let named: Vec<_> = fresh
                .into_iter()
                .map(|c| {
                    let name = snapshots
                        .iter()
                        .find(|s| s.id == c.agent_id)
                        .map(|s| s.name.clone())
                        .unwrap_or_else(|| c.agent_id.to_string());
                    (name, c)
                })
                .collect();
            tracing::debug!(agent_id = %agent.id, count = named.len(), "Injecting child completions");
            messages.push(ChatMessage::user(prompt::child_completions(&named)));
        }
    }

    if agent.iteration > 0 && agent.iteration % 3 == 0 {
        let siblings =
            ctx.findings
                .get_sibling_findings(&agent.id, agent.parent_id.as_ref(), &snapshots);
        if !siblings.is_empty() {
            messages.push(ChatMessage::user(prompt::sibling_findings(&siblings)));
        }
    }
}

/// Fold progress, activity and output into the record. Returns the new
/// iteration count.
async fn apply_progress(
    ctx: &AgentContext,
    agent: &AgentRecord,
    response: &AgentResponse,
) -> Result<u32, QueueError> {
    let output = response.output_text();
    let (progress, iteration, activity) = ctx
        .update_agent(&agent.id, |r| {
            r.iteration += 1;
            if let Some(delta) = response.progress_delta {
                r.add_progress(delta);
            }
            if let Some(activity) = response.activity.as_ref().filter(|a| !a.trim().is_empty()) {
                r.activity = activity.clone();
            }
            if !output.trim().is_empty() {
                r.output = Some(output.clone());
            }
            (r.progress, r.iteration, r.activity.clone())
        })
        .await
        .ok_or(QueueError::Cancelled)?;

    ctx.emit(AgentEvent::Progress {
        agent_id: agent.id,
        progress,
        iteration,
        activity,
    })
    .await;
    ctx.persist_agent(&agent.id).await;
    Ok(iteration)
}

/// Record the output as a finding and surface searches and artifacts.
async fn publish_results(ctx: &AgentContext, agent: &AgentRecord, response: &AgentResponse) {
    let output = response.output_text();
    if ctx
        .findings
        .add_finding(agent.id, &agent.name, agent.role, &output)
    {
        ctx.emit(AgentEvent::Finding {
            agent_id: agent.id,
            agent_name: agent.name.clone(),
            content: output,
        })
        .await;
    }

    for query in response.searches.iter().flatten() {
        ctx.emit(AgentEvent::Search {
            agent_id: agent.id,
            query: query.clone(),
        })
        .await;
    }

    for artifact in response.artifacts.iter().flatten() {
        ctx.findings
            .add_finding(agent.id, &agent.name, agent.role, &stringify_value(artifact));
        ctx.emit(AgentEvent::Artifact {
            agent_id: agent.id,
            artifact: artifact.clone(),
        })
        .await;
    }
}

fn child_config(request: &SpawnRequest, parent: &AgentRecord, index: usize) -> AgentConfig {
    AgentConfig {
        role: request.role(),
        name: request
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{} / {} {}", parent.name, request.role(), index + 1)),
        objective: request.objective.clone(),
        priority: request.priority(),
        model: None,
        children: Vec::new(),
    }
}

/// Create as many requested children as the budget allows.
///
/// Returns a note for the agent's context when some requests were refused.
async fn spawn_children(
    ctx: &Arc<AgentContext>,
    agent: &AgentRecord,
    requests: &[SpawnRequest],
) -> Option<String> {
    let requests: Vec<&SpawnRequest> = requests
        .iter()
        .filter(|r| !r.objective.trim().is_empty())
        .collect();
    let requested = requests.len();
    if requested == 0 {
        return None;
    }

    // Decide and insert under one write lock so concurrent spawners cannot
    // overshoot the budget.
    let (spawned, decision) = {
        let mut tree = ctx.tree.write().await;
        // Checked under the lock: once `stop()` has cancelled, it fails every
        // agent it can see, so nothing may be added behind its back.
        if ctx.is_cancelled() {
            return None;
        }
        let decision = can_spawn(&ctx.config.spawn_budget, &tree.snapshots(), Some(&agent.id));
        let grant = if decision.allowed {
            decision.remaining.min(requested)
        } else {
            0
        };

        let mut spawned = Vec::with_capacity(grant);
        for (index, request) in requests.iter().take(grant).enumerate() {
            let config = child_config(request, agent, index);
            match ctx.insert_agent(&mut tree, &config, Some(agent.id)) {
                Ok(record) => spawned.push(record),
                Err(e) => tracing::warn!(agent_id = %agent.id, "Failed to add child: {}", e),
            }
        }
        (spawned, decision)
    };

    for record in &spawned {
        tracing::info!(
            parent = %agent.name,
            child = %record.name,
            role = %record.role,
            depth = record.depth,
            "Spawned child agent"
        );
        ctx.emit(AgentEvent::AgentSpawned {
            agent: record.snapshot(),
        })
        .await;
        ctx.persist_agent(&record.id).await;
    }
    start_staggered(Arc::clone(ctx), spawned.iter().map(|r| r.id).collect());

    if spawned.len() == requested {
        return None;
    }

    let reason = decision
        .reason
        .unwrap_or_else(|| "Spawn budget exhausted".to_string());
    tracing::warn!(
        agent_id = %agent.id,
        requested,
        granted = spawned.len(),
        "Spawn request clamped: {}",
        reason
    );
    ctx.emit(AgentEvent::SpawnDenied {
        agent_id: agent.id,
        requested: requested - spawned.len(),
        reason: reason.clone(),
    })
    .await;
    Some(prompt::spawn_denied(requested, spawned.len(), &reason))
}

/// Poll while the agent is paused. Returns `false` if the loop should exit.
async fn hold_while_paused(ctx: &AgentContext, id: &AgentId) -> bool {
    loop {
        if ctx.is_cancelled() {
            return false;
        }
        match ctx.tree.read().await.get(id).map(|r| r.status) {
            Some(AgentStatus::Paused) => {}
            Some(status) => return !status.is_terminal(),
            None => return false,
        }
        if !pause_for(ctx, ctx.config.poll_interval).await {
            return false;
        }
    }
}

/// Poll until a response to the pending input request arrives.
/// `None` if the mission is stopped or the agent ends first.
async fn wait_for_input(ctx: &AgentContext, id: &AgentId) -> Option<String> {
    loop {
        {
            let mut tree = ctx.tree.write().await;
            let record = tree.get_mut(id)?;
            if record.status.is_terminal() {
                return None;
            }
            if let Some(reply) = record.input_response.take() {
                return Some(reply);
            }
        }
        if !pause_for(ctx, ctx.config.poll_interval).await {
            return None;
        }
    }
}

/// Complete the agent: register its completion and hand it to the parent.
///
/// An agent that already failed or was stopped gets no completion.
async fn finish(ctx: &AgentContext, id: &AgentId, activity: &str) {
    let mut parent = None;
    // Registered under the tree lock so the mission never sees this agent
    // terminal without its completion.
    let completed = ctx
        .transition(id, AgentStatus::Completed, activity, |r| {
            r.progress = 100.0;
            ctx.findings
                .register_completion(r.id, r.output.as_deref().unwrap_or_default());
            parent = r.parent_id;
            true
        })
        .await;
    if !completed {
        return;
    }

    if let Some(parent_id) = parent {
        tracing::debug!(agent_id = %id, parent = %parent_id, "Findings transferred to parent");
        ctx.emit(AgentEvent::FindingsTransferred {
            from: *id,
            to: parent_id,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::{broadcast, Notify, RwLock};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::agents::{AgentRole, AgentTree};
    use crate::config::Config;
    use crate::findings::FindingsRegistry;
    use crate::llm::{LlmError, ModelClient};
    use crate::queue::RequestQueue;

    struct Idle;

    #[async_trait]
    impl ModelClient for Idle {
        async fn complete(
            &self,
            _agent: &AgentDescriptor,
            _messages: &[ChatMessage],
        ) -> Result<String, LlmError> {
            Ok(r#"{"output": "idle", "complete": true}"#.to_string())
        }
    }

    fn context() -> Arc<AgentContext> {
        let config = Config::default();
        Arc::new(AgentContext {
            queue: RequestQueue::new(config.queue_config()),
            config,
            client: Arc::new(Idle),
            findings: Arc::new(FindingsRegistry::new()),
            tree: RwLock::new(AgentTree::new()),
            events: broadcast::channel(64).0,
            store: None,
            cancel_token: CancellationToken::new(),
            mission_id: uuid::Uuid::new_v4(),
            settled: Notify::new(),
        })
    }

    async fn add(ctx: &AgentContext, name: &str, parent: Option<AgentId>) -> AgentRecord {
        let config = AgentConfig {
            role: AgentRole::Researcher,
            name: name.to_string(),
            objective: format!("{} objective", name),
            priority: None,
            model: None,
            children: Vec::new(),
        };
        let mut tree = ctx.tree.write().await;
        ctx.insert_agent(&mut tree, &config, parent).unwrap()
    }

    #[tokio::test]
    async fn finish_registers_completion_and_notifies_parent() {
        let ctx = context();
        let mut rx = ctx.events.subscribe();
        let parent = add(&ctx, "parent", None).await;
        let child = add(&ctx, "child", Some(parent.id)).await;
        ctx.update_agent(&child.id, |r| r.output = Some("child result".to_string()))
            .await;
        ctx.set_status(&child.id, AgentStatus::Working, "Starting").await;

        finish(&ctx, &child.id, "Completed").await;

        let record = ctx.snapshot(&child.id).await.unwrap();
        assert_eq!(record.status, AgentStatus::Completed);
        assert_eq!(record.progress, 100.0);
        let completions = ctx.findings.get_child_completions(&[child.id]);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].output, "child result");

        let mut transferred = false;
        while let Ok(event) = rx.try_recv() {
            if event
                == (AgentEvent::FindingsTransferred {
                    from: child.id,
                    to: parent.id,
                })
            {
                transferred = true;
            }
        }
        assert!(transferred);
    }

    #[tokio::test]
    async fn failed_agent_gets_no_completion() {
        let ctx = context();
        let agent = add(&ctx, "worker", None).await;
        ctx.update_agent(&agent.id, |r| r.output = Some("half done".to_string()))
            .await;
        ctx.set_status(&agent.id, AgentStatus::Failed, "Stopped").await;

        finish(&ctx, &agent.id, "Completed (iteration limit reached)").await;

        let record = ctx.snapshot(&agent.id).await.unwrap();
        assert_eq!(record.status, AgentStatus::Failed);
        assert_eq!(record.activity, "Stopped");
        assert!(ctx.findings.all_completions().is_empty());
    }

    #[tokio::test]
    async fn no_children_are_added_after_stop() {
        let ctx = context();
        let parent = add(&ctx, "parent", None).await;
        ctx.cancel_token.cancel();

        let requests = vec![SpawnRequest {
            role: Some("executor".to_string()),
            name: Some("late".to_string()),
            objective: "arrive too late".to_string(),
            priority: None,
        }];
        assert!(spawn_children(&ctx, &parent, &requests).await.is_none());
        assert_eq!(ctx.tree.read().await.len(), 1);
    }

    #[tokio::test]
    async fn spawn_requests_beyond_the_budget_are_reported() {
        let ctx = context();
        let parent = add(&ctx, "parent", None).await;
        let requests: Vec<SpawnRequest> = (0..6)
            .map(|i| SpawnRequest {
                role: None,
                name: None,
                objective: format!("part {}", i),
                priority: None,
            })
            .collect();

        let note = spawn_children(&ctx, &parent, &requests).await.unwrap();
        assert!(note.starts_with("Spawn request denied: 2 of 6"));

        let tree = ctx.tree.read().await;
        let children = tree.children(&parent.id);
        assert_eq!(children.len(), 4);
        let first = tree.get(&children[0]).unwrap();
        assert_eq!(first.name, "parent / researcher 1");
        assert_eq!(first.depth, 1);
        ctx.cancel_token.cancel();
    }
}
