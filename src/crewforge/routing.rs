//! The agent-to-agent routing policy.
//!
//! Given the current workflow state and the response an agent just produced,
//! the policy picks who speaks next and what they receive.  Rules, first
//! match wins:
//!
//! 1. Before any turn has happened, the task goes to the coordinator (or to
//!    the sole agent of a single-agent workflow).
//! 2. A coordinator response that designates another agent — by role label
//!    or agent id appearing in the text — routes the full response to that
//!    agent.
//! 3. A non-coordinator response returns to the coordinator.
//! 4. A coordinator response that names no target routes to the
//!    highest-priority *incomplete* non-coordinator agent (`coder`,
//!    `tester`, `runner`, then declared order).
//! 5. Otherwise routing yields nothing and the completion detector decides.
//!
//! The policy never selects a completed agent; a single-agent workflow is
//! the only exception, via rule 1.

use crate::crewforge::workflow::{AgentSpec, WorkflowState};

/// The routing decision: who speaks next, and the message they receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub agent_id: String,
    pub inbound: String,
}

/// Rule 1: the recipient of the synthetic seed turn.
pub fn initial_recipient(state: &WorkflowState) -> Option<&AgentSpec> {
    if let Some(coordinator) = state.coordinator() {
        return Some(coordinator);
    }
    if state.agents.len() == 1 {
        return state.agents.first();
    }
    None
}

/// Rules 2–5: route the response `content` just produced by `sender_id`.
pub fn route_response(state: &WorkflowState, sender_id: &str, content: &str) -> Option<NextHop> {
    if state.is_coordinator(sender_id) {
        if let Some(target) = named_target(state, sender_id, content) {
            return Some(NextHop {
                agent_id: target,
                inbound: content.to_string(),
            });
        }
        if let Some(fallback) = fallback_incomplete(state) {
            return Some(NextHop {
                agent_id: fallback,
                inbound: content.to_string(),
            });
        }
        return None;
    }

    // Rule 3: non-coordinator output returns to the coordinator.
    state.coordinator().map(|coordinator| NextHop {
        agent_id: coordinator.id.clone(),
        inbound: content.to_string(),
    })
}

/// Rule 2: the earliest agent whose role label or id appears as a word in
/// the coordinator's text.  Completed agents and the sender are never
/// matched.
fn named_target(state: &WorkflowState, sender_id: &str, content: &str) -> Option<String> {
    let mut best: Option<(usize, &AgentSpec)> = None;
    for agent in &state.agents {
        if agent.id == sender_id
            || agent.role.is_coordinator()
            || state.is_agent_completed(&agent.id)
        {
            continue;
        }
        let position = find_word_ci(content, agent.role.as_str())
            .into_iter()
            .chain(find_word_ci(content, &agent.id))
            .min();
        if let Some(position) = position {
            let better = match best {
                Some((best_position, _)) => position < best_position,
                None => true,
            };
            if better {
                best = Some((position, agent));
            }
        }
    }
    best.map(|(_, agent)| agent.id.clone())
}

/// Rule 4: incomplete non-coordinator agents ordered by role priority, then
/// declaration order.
fn fallback_incomplete(state: &WorkflowState) -> Option<String> {
    state
        .agents
        .iter()
        .enumerate()
        .filter(|(_, a)| !a.role.is_coordinator() && !state.is_agent_completed(&a.id))
        .min_by_key(|(declared, a)| (a.role.fallback_priority(), *declared))
        .map(|(_, a)| a.id.clone())
}

/// Case-insensitive whole-word search.  A match must be bounded by
/// non-alphanumeric characters (or the ends of the text).
fn find_word_ci(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let haystack_lower = haystack.to_ascii_lowercase();
    let needle_lower = needle.to_ascii_lowercase();
    let mut start = 0;
    while let Some(offset) = haystack_lower[start..].find(&needle_lower) {
        let position = start + offset;
        let before_ok = position == 0
            || !haystack_lower[..position]
                .chars()
                .next_back()
                .map(|c| c.is_ascii_alphanumeric())
                .unwrap_or(false);
        let end = position + needle_lower.len();
        let after_ok = end == haystack_lower.len()
            || !haystack_lower[end..]
                .chars()
                .next()
                .map(|c| c.is_ascii_alphanumeric())
                .unwrap_or(false);
        if before_ok && after_ok {
            return Some(position);
        }
        start = position + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crewforge::workflow::{AgentRole, AgentSpec, WorkflowRequest, WorkflowState};

    fn agent(id: &str, role: &str) -> AgentSpec {
        AgentSpec {
            id: id.to_string(),
            role: AgentRole::parse(role),
            model: "local-llama".to_string(),
            system_prompt: None,
            memory_enabled: true,
        }
    }

    fn state(agents: Vec<AgentSpec>) -> WorkflowState {
        let request = WorkflowRequest {
            task: "do the thing".to_string(),
            agents,
            edges: vec![],
            await_completion: false,
            deadline_seconds: None,
            publish: false,
        };
        WorkflowState::new("wf", &request)
    }

    #[test]
    fn seed_goes_to_the_coordinator() {
        let state = state(vec![agent("k", "coder"), agent("c", "coordinator")]);
        assert_eq!(initial_recipient(&state).unwrap().id, "c");
    }

    #[test]
    fn seed_goes_to_the_sole_agent_without_coordinator() {
        let state = state(vec![agent("a", "custom")]);
        assert_eq!(initial_recipient(&state).unwrap().id, "a");
    }

    #[test]
    fn coordinator_text_designates_by_role() {
        let state = state(vec![agent("c", "coordinator"), agent("k", "coder")]);
        let hop = route_response(&state, "c", "Coder: please write add(a, b)").unwrap();
        assert_eq!(hop.agent_id, "k");
        assert_eq!(hop.inbound, "Coder: please write add(a, b)");
    }

    #[test]
    fn designation_matches_agent_id_too() {
        let state = state(vec![agent("c", "coordinator"), agent("worker-1", "custom")]);
        let hop = route_response(&state, "c", "worker-1, take this over").unwrap();
        assert_eq!(hop.agent_id, "worker-1");
    }

    #[test]
    fn designation_requires_word_boundaries() {
        let state = state(vec![agent("c", "coordinator"), agent("k", "coder")]);
        // "encoder" must not match the role "coder".
        let hop = route_response(&state, "c", "the encoder looks fine").unwrap();
        // No designation: falls through to the incomplete-agent rule.
        assert_eq!(hop.agent_id, "k");
        let state2 = {
            let mut s = state;
            s.mark_completed("k");
            s
        };
        assert!(route_response(&state2, "c", "the encoder looks fine").is_none());
    }

    #[test]
    fn non_coordinator_returns_to_coordinator() {
        let state = state(vec![agent("c", "coordinator"), agent("k", "coder")]);
        let hop = route_response(&state, "k", "done, here is the code").unwrap();
        assert_eq!(hop.agent_id, "c");
    }

    #[test]
    fn completed_agents_are_never_selected() {
        let mut state = state(vec![agent("c", "coordinator"), agent("k", "coder")]);
        state.mark_completed("k");
        // Even a direct designation cannot re-select a completed agent.
        assert!(route_response(&state, "c", "Coder: one more revision").is_none());
    }

    #[test]
    fn fallback_prefers_coder_then_tester_then_runner() {
        let mut state = state(vec![
            agent("c", "coordinator"),
            agent("r", "runner"),
            agent("t", "tester"),
            agent("k", "coder"),
        ]);
        let hop = route_response(&state, "c", "keep going").unwrap();
        assert_eq!(hop.agent_id, "k");

        state.mark_completed("k");
        let hop = route_response(&state, "c", "keep going").unwrap();
        assert_eq!(hop.agent_id, "t");

        state.mark_completed("t");
        let hop = route_response(&state, "c", "keep going").unwrap();
        assert_eq!(hop.agent_id, "r");

        state.mark_completed("r");
        assert!(route_response(&state, "c", "keep going").is_none());
    }

    #[test]
    fn fallback_uses_declared_order_for_custom_roles() {
        let state = state(vec![
            agent("c", "coordinator"),
            agent("x", "analyst"),
            agent("y", "reviewer"),
        ]);
        let hop = route_response(&state, "c", "next please").unwrap();
        assert_eq!(hop.agent_id, "x");
    }

    #[test]
    fn earliest_mention_wins() {
        let state = state(vec![
            agent("c", "coordinator"),
            agent("t", "tester"),
            agent("k", "coder"),
        ]);
        let hop = route_response(&state, "c", "tester first, then coder").unwrap();
        assert_eq!(hop.agent_id, "t");
    }
}
