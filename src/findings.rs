//! Per-mission ledger of agent findings and completions.
//!
//! Agents never talk to each other directly. They publish into this
//! registry and read from it when building their next prompt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agents::{AgentId, AgentRole};
use crate::spawn::TreeNode;
use crate::util::truncate_chars;

/// Findings kept before the oldest are evicted.
pub const MAX_FINDINGS: usize = 200;

/// Shorter content is not worth sharing.
pub const MIN_FINDING_CHARS: usize = 10;

const SIBLING_FINDINGS_LIMIT: usize = 5;
const SIBLING_FINDING_CHARS: usize = 200;

/// A shareable fragment of an agent's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub id: u64,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub role: AgentRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// The latest final output of one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub agent_id: AgentId,
    pub output: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Ledger {
    findings: VecDeque<Finding>,
    completions: HashMap<AgentId, Completion>,
    next_id: u64,
}

/// Thread-safe findings registry. One per mission, reset between missions.
#[derive(Debug, Default)]
pub struct FindingsRegistry {
    inner: Mutex<Ledger>,
}

impl FindingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a finding. Returns `false` when the content is too short.
    pub fn add_finding(
        &self,
        agent_id: AgentId,
        agent_name: &str,
        role: AgentRole,
        content: &str,
    ) -> bool {
        if content.chars().count() < MIN_FINDING_CHARS {
            return false;
        }

        let mut ledger = self.lock();
        let id = ledger.next_id;
        ledger.next_id += 1;
        ledger.findings.push_back(Finding {
            id,
            agent_id,
            agent_name: agent_name.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        });
        while ledger.findings.len() > MAX_FINDINGS {
            ledger.findings.pop_front();
        }
        true
    }

    /// Upsert the completion for `agent_id`; only the latest is kept.
    pub fn register_completion(&self, agent_id: AgentId, output: &str) -> Completion {
        let mut ledger = self.lock();
        // Stamped under the lock so timestamps follow registration order.
        let completion = Completion {
            agent_id,
            output: output.to_string(),
            timestamp: Utc::now(),
        };
        ledger.completions.insert(agent_id, completion.clone());
        completion
    }

    /// Completions for the given ids, in the order of `child_ids`.
    pub fn get_child_completions(&self, child_ids: &[AgentId]) -> Vec<Completion> {
        let ledger = self.lock();
        child_ids
            .iter()
            .filter_map(|id| ledger.completions.get(id).cloned())
            .collect()
    }

    /// Like [`get_child_completions`](Self::get_child_completions), limited
    /// to completions strictly newer than `since`.
    pub fn get_new_completions_since(
        &self,
        child_ids: &[AgentId],
        since: Option<DateTime<Utc>>,
    ) -> Vec<Completion> {
        let mut completions = self.get_child_completions(child_ids);
        if let Some(since) = since {
            completions.retain(|c| c.timestamp > since);
        }
        completions
    }

    /// Recent findings from agents that share `parent_id`, formatted for a
    /// prompt as `"<name>: <content prefix>"`.
    ///
    /// Agents with no parent are siblings of every other root agent.
    pub fn get_sibling_findings<N: TreeNode>(
        &self,
        agent_id: &AgentId,
        parent_id: Option<&AgentId>,
        agents: &[N],
    ) -> Vec<String> {
        let siblings: Vec<AgentId> = agents
            .iter()
            .filter(|a| a.parent().as_ref() == parent_id && &a.node_id() != agent_id)
            .map(|a| a.node_id())
            .collect();
        if siblings.is_empty() {
            return Vec::new();
        }

        let ledger = self.lock();
        let mut recent: Vec<String> = ledger
            .findings
            .iter()
            .rev()
            .filter(|f| siblings.contains(&f.agent_id))
            .take(SIBLING_FINDINGS_LIMIT)
            .map(|f| {
                format!(
                    "{}: {}",
                    f.agent_name,
                    truncate_chars(&f.content, SIBLING_FINDING_CHARS)
                )
            })
            .collect();
        recent.reverse();
        recent
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.lock().findings.iter().cloned().collect()
    }

    pub fn all_completions(&self) -> Vec<Completion> {
        let mut completions: Vec<Completion> = self.lock().completions.values().cloned().collect();
        completions.sort_by_key(|c| c.timestamp);
        completions
    }

    /// Clear everything, including the id counter.
    pub fn reset(&self) {
        *self.lock() = Ledger::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node(AgentId, Option<AgentId>);

    impl TreeNode for Node {
        fn node_id(&self) -> AgentId {
            self.0
        }
        fn parent(&self) -> Option<AgentId> {
            self.1
        }
    }

    #[test]
    fn short_findings_are_dropped() {
        let registry = FindingsRegistry::new();
        let id = AgentId::new();
        assert!(!registry.add_finding(id, "a", AgentRole::Researcher, ""));
        assert!(!registry.add_finding(id, "a", AgentRole::Researcher, "too short"));
        assert!(registry.add_finding(id, "a", AgentRole::Researcher, "ten chars!"));
        assert_eq!(registry.findings().len(), 1);
    }

    #[test]
    fn findings_are_capped_oldest_first() {
        let registry = FindingsRegistry::new();
        let id = AgentId::new();
        for i in 0..250 {
            registry.add_finding(id, "a", AgentRole::Researcher, &format!("finding number {}", i));
        }
        let findings = registry.findings();
        assert_eq!(findings.len(), MAX_FINDINGS);
        assert_eq!(findings[0].content, "finding number 50");
        assert_eq!(findings[0].id, 50);
        assert_eq!(findings.last().unwrap().id, 249);
    }

    #[test]
    fn completions_overwrite_and_keep_input_order() {
        let registry = FindingsRegistry::new();
        let (a, b, c) = (AgentId::new(), AgentId::new(), AgentId::new());
        registry.register_completion(a, "first");
        registry.register_completion(b, "bee");
        registry.register_completion(a, "second");

        let got = registry.get_child_completions(&[b, c, a]);
        assert_eq!(got.len(), 2);
        assert_eq!((got[0].agent_id, got[0].output.as_str()), (b, "bee"));
        assert_eq!((got[1].agent_id, got[1].output.as_str()), (a, "second"));
    }

    #[test]
    fn new_completions_are_strictly_after_cutoff() {
        let registry = FindingsRegistry::new();
        let (a, b) = (AgentId::new(), AgentId::new());
        let first = registry.register_completion(a, "done a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.register_completion(b, "done b");

        let fresh = registry.get_new_completions_since(&[a, b], Some(first.timestamp));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].agent_id, b);
        assert_eq!(registry.get_new_completions_since(&[a, b], None).len(), 2);
    }

    #[test]
    fn sibling_findings_exclude_self_and_cousins() {
        let registry = FindingsRegistry::new();
        let (parent, other_parent) = (AgentId::new(), AgentId::new());
        let (me, sib, cousin) = (AgentId::new(), AgentId::new(), AgentId::new());
        let agents = vec![
            Node(parent, None),
            Node(other_parent, None),
            Node(me, Some(parent)),
            Node(sib, Some(parent)),
            Node(cousin, Some(other_parent)),
        ];

        registry.add_finding(me, "me", AgentRole::Researcher, "my own finding text");
        registry.add_finding(cousin, "cousin", AgentRole::Researcher, "cousin finding text");
        for i in 0..7 {
            registry.add_finding(sib, "sib", AgentRole::Executor, &format!("sibling finding {}", i));
        }
        registry.add_finding(sib, "sib", AgentRole::Executor, &"y".repeat(300));

        let shared = registry.get_sibling_findings(&me, Some(&parent), &agents);
        assert_eq!(shared.len(), 5);
        assert_eq!(shared[0], "sib: sibling finding 3");
        assert_eq!(shared[4], format!("sib: {}", "y".repeat(200)));
        assert!(shared.iter().all(|s| s.starts_with("sib: ")));
    }

    #[test]
    fn root_agents_are_siblings() {
        let registry = FindingsRegistry::new();
        let (a, b) = (AgentId::new(), AgentId::new());
        let agents = vec![Node(a, None), Node(b, None)];
        registry.add_finding(b, "beta", AgentRole::Researcher, "beta found something");

        assert_eq!(
            registry.get_sibling_findings(&a, None, &agents),
            vec!["beta: beta found something".to_string()]
        );
    }

    #[test]
    fn reset_clears_everything() {
        let registry = FindingsRegistry::new();
        let id = AgentId::new();
        registry.add_finding(id, "a", AgentRole::Researcher, "some finding text");
        registry.register_completion(id, "out");
        registry.reset();

        assert!(registry.findings().is_empty());
        assert!(registry.all_completions().is_empty());
        registry.add_finding(id, "a", AgentRole::Researcher, "another finding");
        assert_eq!(registry.findings()[0].id, 0);
    }
}
