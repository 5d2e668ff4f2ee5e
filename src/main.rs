//! agent-swarm - command line entry point.
//!
//! Runs one mission file and prints the synthesized result.
//!
//! ```text
//! agent-swarm <mission.yaml>
//! ```

use std::sync::Arc;

use agent_swarm::events::AgentEvent;
use agent_swarm::llm::OpenRouterClient;
use agent_swarm::store::InMemoryMissionStore;
use agent_swarm::{Config, MissionSpec, Orchestrator};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_swarm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: agent-swarm <mission.yaml>"))?;

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, max_concurrent={}",
        config.default_model, config.max_concurrent_requests
    );
    let spec = MissionSpec::from_file(&path)?;

    let client = OpenRouterClient::new(
        config.require_api_key()?.to_string(),
        config.default_model.clone(),
    );
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(client),
        Some(Arc::new(InMemoryMissionStore::new())),
    );

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AgentEvent::Delta { .. }) => {}
                Ok(event) => info!(event = event.event_name(), agent_id = ?event.agent_id(), "{:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let stopper = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping mission");
            stopper.stop().await;
        }
    });

    let report = orchestrator.run_mission(spec).await?;
    info!(
        mission_id = %report.mission_id,
        status = %report.status,
        agents = report.agents.len(),
        "Mission finished"
    );

    match report.synthesis {
        Some(synthesis) => println!("{}", synthesis),
        None => warn!("Mission produced no result"),
    }
    Ok(())
}
