//! Live agent population for one mission.

use std::collections::HashMap;

use super::{AgentId, AgentRecord, AgentSnapshot};

/// All agents of a mission, indexed by id.
///
/// # Invariants
/// - Every non-root agent's parent is in the tree
/// - A child's depth is its parent's depth + 1
/// - Iteration order is insertion order
#[derive(Debug, Default)]
pub struct AgentTree {
    agents: HashMap<AgentId, AgentRecord>,

    /// Parent-child relationships, children in spawn order
    children: HashMap<AgentId, Vec<AgentId>>,

    order: Vec<AgentId>,
}

impl AgentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent.
    ///
    /// # Errors
    /// Fails if the id is already present, the parent is unknown, or the
    /// depth does not match the parent's.
    pub fn insert(&mut self, record: AgentRecord) -> Result<(), TreeError> {
        let id = record.id;
        if self.agents.contains_key(&id) {
            return Err(TreeError::AgentAlreadyExists(id));
        }

        match record.parent_id {
            Some(parent_id) => {
                let parent = self
                    .agents
                    .get(&parent_id)
                    .ok_or(TreeError::ParentNotFound(parent_id))?;
                if record.depth != parent.depth + 1 {
                    return Err(TreeError::InvalidDepth {
                        id,
                        depth: record.depth,
                        expected: parent.depth + 1,
                    });
                }
                self.children.entry(parent_id).or_default().push(id);
            }
            None if record.depth != 0 => {
                return Err(TreeError::InvalidDepth {
                    id,
                    depth: record.depth,
                    expected: 0,
                });
            }
            None => {}
        }

        self.order.push(id);
        self.agents.insert(id, record);
        Ok(())
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    pub fn get_mut(&mut self, id: &AgentId) -> Option<&mut AgentRecord> {
        self.agents.get_mut(id)
    }

    /// Ids of the direct children of `id`, in spawn order.
    pub fn children(&self, id: &AgentId) -> Vec<AgentId> {
        self.children.get(id).cloned().unwrap_or_default()
    }

    /// All agents in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &AgentRecord> {
        self.order.iter().filter_map(|id| self.agents.get(id))
    }

    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.records().map(AgentRecord::snapshot).collect()
    }

    /// True once the tree is non-empty and every agent is terminal.
    pub fn all_terminal(&self) -> bool {
        !self.agents.is_empty() && self.agents.values().all(|a| a.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Errors in tree operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("Parent agent not found: {0}")]
    ParentNotFound(AgentId),

    #[error("Agent already exists in tree: {0}")]
    AgentAlreadyExists(AgentId),

    #[error("Agent {id} has depth {depth}, expected {expected}")]
    InvalidDepth {
        id: AgentId,
        depth: usize,
        expected: usize,
    },
}
