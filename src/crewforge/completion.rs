//! The completion detector.
//!
//! Role-aware textual signals flip per-agent completion flags (one-way), and
//! the workflow as a whole finishes only when every non-coordinator agent is
//! complete **and** the coordinator's latest turn carries one of the
//! enumerated terminal phrases.  The coordinator's phrase alone never ends a
//! workflow while a specialist is still incomplete.
//!
//! The signals are hints extracted from free-form text, centralized here so
//! they stay unit-testable; they are not security decisions.

use crate::crewforge::extractor::{self, ArtifactKind};
use crate::crewforge::workflow::{AgentRole, WorkflowState};

/// Terminal phrases the coordinator can emit (case-insensitive substring).
pub const COORDINATOR_COMPLETION_MARKERS: &[&str] = &[
    "COORDINATION COMPLETE",
    "WORKFLOW COMPLETE",
    "ALL AGENTS COMPLETED",
];

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Whether `text` contains at least one well-formed fenced code block.
fn contains_fenced_block(text: &str) -> bool {
    let mut open = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if open {
            if trimmed == "```" {
                return true;
            }
        } else if trimmed.starts_with("```") && !trimmed[3..].contains('`') {
            open = true;
        }
    }
    false
}

/// Whether one response satisfies the completion signal for `role`.
///
/// - `coder`: a fenced code block, or the literal `CODE COMPLETE`.
/// - `tester`: a fenced block classified as test code, or `TESTING COMPLETE`.
/// - `runner`: any mention of `PASS`, `FAIL`, or `TEST EXECUTION`.
/// - any other role: any non-empty response.
pub fn role_signals_completion(role: &AgentRole, content: &str) -> bool {
    match role {
        AgentRole::Coder => {
            contains_fenced_block(content) || contains_ci(content, "CODE COMPLETE")
        }
        AgentRole::Tester => {
            let has_test_block = extractor::extract(content)
                .iter()
                .any(|f| f.kind == ArtifactKind::Test);
            has_test_block || contains_ci(content, "TESTING COMPLETE")
        }
        AgentRole::Runner => {
            contains_ci(content, "PASS")
                || contains_ci(content, "FAIL")
                || contains_ci(content, "TEST EXECUTION")
        }
        AgentRole::Coordinator => coordinator_signals_done(content),
        AgentRole::Custom(_) => !content.trim().is_empty(),
    }
}

/// Whether a coordinator response carries a terminal phrase.
pub fn coordinator_signals_done(content: &str) -> bool {
    COORDINATOR_COMPLETION_MARKERS
        .iter()
        .any(|marker| contains_ci(content, marker))
}

/// All non-coordinator agents have flipped their completion flag.
pub fn all_non_coordinators_complete(state: &WorkflowState) -> bool {
    state
        .agents
        .iter()
        .filter(|a| !a.role.is_coordinator())
        .all(|a| state.is_agent_completed(&a.id))
}

/// The workflow-level completion decision.
///
/// With a coordinator present, both conditions must hold: every
/// non-coordinator agent is complete, and the latest turn is the coordinator
/// emitting a terminal phrase.  Without a coordinator (single-agent
/// workflows), completion of every agent suffices.  Turn-budget exhaustion
/// is a separate engine-level stop and does not flow through here.
pub fn is_done(state: &WorkflowState) -> bool {
    match state.coordinator() {
        None => {
            !state.agents.is_empty()
                && state.agents.iter().all(|a| state.is_agent_completed(&a.id))
        }
        Some(coordinator) => {
            if !all_non_coordinators_complete(state) {
                return false;
            }
            match state.turns.last() {
                Some(last) => {
                    last.from == coordinator.id && coordinator_signals_done(&last.content)
                }
                None => false,
            }
        }
    }
}
