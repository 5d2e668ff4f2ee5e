//! Prompt text for agent turns.

use super::{AgentRecord, AgentRole};
use crate::findings::Completion;
use crate::spawn::{SpawnBudget, SpawnDecision};

const RESPONSE_FORMAT: &str = r#"Respond with ONLY a JSON object of this shape:
{
  "thinking": "your reasoning for this step",
  "activity": "a short phrase describing what you are doing",
  "progress_delta": 10,
  "output": "concrete findings or results from this step",
  "complete": false,
  "spawn_agents": [{"role": "researcher", "name": "...", "objective": "...", "priority": "normal"}],
  "needs_input": {"question": "...", "options": ["..."]},
  "searches": ["..."],
  "artifacts": [{"title": "...", "content": "..."}]
}
Only "output" and "complete" are required. Set "complete" to true once your objective is fully met."#;

/// System prompt for one agent turn, including its current spawn capacity.
pub fn system_prompt(
    agent: &AgentRecord,
    decision: &SpawnDecision,
    budget: &SpawnBudget,
    total_agents: usize,
    max_iterations: u32,
) -> String {
    let spawning = if decision.allowed {
        format!(
            "You may spawn up to {} more child agent(s) via \"spawn_agents\". \
             Only delegate work that is clearly separable.",
            decision.remaining
        )
    } else {
        format!(
            "You cannot spawn child agents ({}). Do the work yourself.",
            decision.reason.as_deref().unwrap_or("no capacity")
        )
    };

    let crowding = if total_agents >= budget.soft_cap {
        format!(
            "\nThere are already {} agents working on this mission (soft limit {}). Avoid spawning more unless essential.",
            total_agents, budget.soft_cap
        )
    } else {
        String::new()
    };

    format!(
        "You are {name}, a {role} agent in a team of cooperating agents.\n\
         {guidance}\n\n\
         Your objective: {objective}\n\n\
         Depth in the agent tree: {depth}. Iteration {iteration} of at most {max_iterations}.\n\
         Spawn budget: {spawning}\n\
         Agents in mission: {total_agents} of at most {max_total}.{crowding}\n\n\
         {format}",
        name = agent.name,
        role = agent.role,
        guidance = agent.role.guidance(),
        objective = agent.objective,
        depth = agent.depth,
        iteration = agent.iteration + 1,
        max_iterations = max_iterations,
        spawning = spawning,
        total_agents = total_agents,
        max_total = budget.max_total_agents,
        crowding = crowding,
        format = RESPONSE_FORMAT,
    )
}

/// First user message of an agent's conversation.
pub fn kickoff(agent: &AgentRecord) -> String {
    match agent.role {
        AgentRole::Coordinator => format!(
            "Begin coordinating: {}\nDecide which parts to delegate and which to handle directly.",
            agent.objective
        ),
        _ => format!("Begin working on your objective: {}", agent.objective),
    }
}

pub fn continuation(iteration: u32, max_iterations: u32) -> String {
    let left = max_iterations.saturating_sub(iteration);
    if left <= 1 {
        "This is your final iteration. Report your results and set \"complete\" to true.".to_string()
    } else {
        format!(
            "Continue working on your objective ({} iterations left). Build on what you have so far.",
            left
        )
    }
}

/// Context message announcing finished children.
pub fn child_completions(completions: &[(String, Completion)]) -> String {
    let mut text = String::from("Results from your child agents:\n");
    for (name, completion) in completions {
        text.push_str(&format!("\n[{}]\n{}\n", name, completion.output));
    }
    text
}

pub fn sibling_findings(findings: &[String]) -> String {
    let mut text = String::from("Recent findings from sibling agents:\n");
    for finding in findings {
        text.push_str(&format!("- {}\n", finding));
    }
    text
}

/// Told to the agent when some or all of its spawn requests were refused.
pub fn spawn_denied(requested: usize, granted: usize, reason: &str) -> String {
    format!(
        "Spawn request denied: {} of {} requested agent(s) were not created ({}). \
         Handle the remaining work yourself.",
        requested - granted,
        requested,
        reason
    )
}

pub fn input_response(question: &str, response: &str) -> String {
    format!("You asked: {}\nThe user responded: {}", question, response)
}

/// Prompt for the final mission synthesis.
pub fn synthesis(title: Option<&str>, results: &[(String, String)]) -> String {
    let mut text = match title {
        Some(title) => format!("Mission: {}\n\n", title),
        None => String::new(),
    };
    text.push_str("The agents on this mission have finished. Their results:\n");
    for (name, output) in results {
        text.push_str(&format!("\n## {}\n{}\n", name, output));
    }
    text.push_str(
        "\nCombine these into one coherent final answer. Resolve contradictions and drop repetition. \
         Respond with JSON: {\"output\": \"<final answer>\", \"complete\": true}",
    );
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentConfig;
    use crate::queue::Priority;

    fn agent() -> AgentRecord {
        let config = AgentConfig {
            role: AgentRole::Researcher,
            name: "scout".to_string(),
            objective: "survey the valley".to_string(),
            priority: None,
            model: None,
            children: Vec::new(),
        };
        AgentRecord::new(&config, None, 0, Priority::Normal)
    }

    #[test]
    fn system_prompt_reports_spawn_capacity() {
        let budget = SpawnBudget::default();
        let allowed = SpawnDecision {
            allowed: true,
            remaining: 3,
            depth: 0,
            reason: None,
        };
        let prompt = system_prompt(&agent(), &allowed, &budget, 2, 15);
        assert!(prompt.contains("survey the valley"));
        assert!(prompt.contains("up to 3 more child agent"));
        assert!(!prompt.contains("soft limit"));

        let denied = SpawnDecision {
            allowed: false,
            remaining: 0,
            depth: 3,
            reason: Some("Maximum depth reached".to_string()),
        };
        let prompt = system_prompt(&agent(), &denied, &budget, budget.soft_cap, 15);
        assert!(prompt.contains("Maximum depth reached"));
        assert!(prompt.contains("soft limit"));
    }

    #[test]
    fn continuation_flags_last_iteration() {
        assert!(continuation(14, 15).contains("final iteration"));
        assert!(continuation(3, 15).contains("12 iterations left"));
    }

    #[test]
    fn spawn_denial_counts() {
        let text = spawn_denied(5, 2, "Maximum children per agent reached");
        assert!(text.contains("3 of 5"));
        assert!(text.contains("Maximum children per agent reached"));
    }
}
