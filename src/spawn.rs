//! Spawn budget decisions.
//!
//! [`can_spawn`] is a pure function over a snapshot of the agent population.
//! It never mutates anything; the caller applies the decision.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agents::AgentId;

/// Global limits on how large the agent tree may grow.
///
/// Fixed for the lifetime of one mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnBudget {
    pub max_total_agents: usize,
    pub max_depth: usize,
    /// Direct children allowed per parent.
    pub max_spawns_per_agent: usize,
    /// Advisory threshold shown to agents. Not enforced.
    pub soft_cap: usize,
}

impl Default for SpawnBudget {
    fn default() -> Self {
        Self {
            max_total_agents: 20,
            max_depth: 3,
            max_spawns_per_agent: 4,
            soft_cap: 12,
        }
    }
}

/// Outcome of a spawn check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnDecision {
    pub allowed: bool,
    /// How many more children may be created right now.
    pub remaining: usize,
    /// Depth of the would-be parent (0 for a root or when not computed).
    pub depth: usize,
    pub reason: Option<String>,
}

impl SpawnDecision {
    fn deny(depth: usize, reason: &str) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            depth,
            reason: Some(reason.to_string()),
        }
    }
}

/// Anything that sits in the agent tree.
pub trait TreeNode {
    fn node_id(&self) -> AgentId;
    fn parent(&self) -> Option<AgentId>;
}

/// Decide whether `parent_id` may create another child.
///
/// `parent_id == None` asks about creating a new root agent.
///
/// # Order of checks
/// 1. global agent cap (depth not computed)
/// 2. depth of the parent
/// 3. children already owned by the parent
pub fn can_spawn<N: TreeNode>(
    budget: &SpawnBudget,
    agents: &[N],
    parent_id: Option<&AgentId>,
) -> SpawnDecision {
    if agents.len() >= budget.max_total_agents {
        return SpawnDecision::deny(0, "Maximum agent limit reached");
    }

    let parents: HashMap<AgentId, Option<AgentId>> =
        agents.iter().map(|a| (a.node_id(), a.parent())).collect();

    // Hops from the parent up to the root. Bounded so a cyclic chain
    // still terminates.
    let mut depth = 0;
    let mut current = parent_id.and_then(|id| parents.get(id).copied().flatten());
    while let Some(id) = current {
        depth += 1;
        if depth > budget.max_depth + 1 {
            break;
        }
        current = parents.get(&id).copied().flatten();
    }

    if depth >= budget.max_depth {
        return SpawnDecision::deny(depth, "Maximum depth reached");
    }

    let child_count = agents
        .iter()
        .filter(|a| a.parent().as_ref() == parent_id)
        .count();
    if child_count >= budget.max_spawns_per_agent {
        return SpawnDecision::deny(depth, "Maximum children per agent reached");
    }

    SpawnDecision {
        allowed: true,
        remaining: (budget.max_total_agents - agents.len())
            .min(budget.max_spawns_per_agent - child_count),
        depth,
        reason: None,
    }
}
