//! Workflow data model: agents, edges, turns, and the runtime state record
//! the engine owns.
//!
//! Agents are declared by the client and immutable for the life of their
//! workflow.  The graph of directed edges need not be acyclic — cycles
//! through the coordinator are expected and normal.  Turn records are
//! append-only, strictly ordered by a monotonic index with non-decreasing
//! timestamps.

use crate::crewforge::client_wrapper::{Message, Role, TokenUsage};
use crate::crewforge::project_store::ProjectHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Sender id used for the synthetic seed turn and as the recipient of a
/// workflow's final message.
pub const SYSTEM_SENDER: &str = "system";

/// Declared role of an agent.  Lowercase labels on the wire; anything
/// outside the four well-known roles is carried as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRole {
    Coordinator,
    Coder,
    Tester,
    Runner,
    Custom(String),
}

impl AgentRole {
    /// Parse a lowercase role label.  Unknown labels become [`AgentRole::Custom`].
    pub fn parse(label: &str) -> AgentRole {
        match label.trim().to_ascii_lowercase().as_str() {
            "coordinator" => AgentRole::Coordinator,
            "coder" => AgentRole::Coder,
            "tester" => AgentRole::Tester,
            "runner" => AgentRole::Runner,
            other => AgentRole::Custom(other.to_string()),
        }
    }

    /// The wire label for this role.
    pub fn as_str(&self) -> &str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Coder => "coder",
            AgentRole::Tester => "tester",
            AgentRole::Runner => "runner",
            AgentRole::Custom(label) => label,
        }
    }

    /// Whether this is the coordinating role.
    pub fn is_coordinator(&self) -> bool {
        matches!(self, AgentRole::Coordinator)
    }

    /// Position in the incomplete-agent fallback ordering: `coder`, then
    /// `tester`, then `runner`, then everything else in declared order.
    pub fn fallback_priority(&self) -> usize {
        match self {
            AgentRole::Coder => 0,
            AgentRole::Tester => 1,
            AgentRole::Runner => 2,
            _ => 3,
        }
    }
}

impl Serialize for AgentRole {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentRole {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(AgentRole::parse(&label))
    }
}

/// One declared participant in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique id within the workflow.
    pub id: String,
    /// Declared role.
    pub role: AgentRole,
    /// Registered model id the agent runs on.
    pub model: String,
    /// Caller-supplied system prompt.  Empty or absent means the role
    /// default is used.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// When disabled the agent sees only its system prompt and the current
    /// inbound message, with no accumulated transcript.
    #[serde(default = "default_memory_enabled")]
    pub memory_enabled: bool,
}

fn default_memory_enabled() -> bool {
    true
}

/// A directed connection between two declared agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// One atomic exchange: a message from one agent (or the system seed)
/// addressed to exactly one recipient.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    /// Monotonic index, starting at 0 for the seed turn.
    pub index: usize,
    /// Sender id, or [`SYSTEM_SENDER`] for the seed turn.
    pub from: String,
    /// Recipient id, or [`SYSTEM_SENDER`] when the message ends the workflow.
    pub to: String,
    /// The message body.
    pub content: String,
    /// Non-decreasing across a workflow's turns.
    pub timestamp: DateTime<Utc>,
    /// Relative paths written from this turn's content, possibly empty.
    pub artifacts_extracted: Vec<String>,
}

/// Lifecycle of a workflow.  Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl Serialize for WorkflowStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A workflow submission as received over the API.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRequest {
    /// The user's task prompt.
    pub task: String,
    /// Declared agents.
    pub agents: Vec<AgentSpec>,
    /// Directed connections.  May be empty.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// When true the submission response blocks until the workflow reaches a
    /// terminal state, bounded by the workflow deadline.
    #[serde(default)]
    pub await_completion: bool,
    /// Per-workflow override of the overall deadline.
    #[serde(default)]
    pub deadline_seconds: Option<u64>,
    /// Declares the intent to publish after completion, so a missing
    /// publisher configuration is reported now rather than at publish time.
    #[serde(default)]
    pub publish: bool,
}

/// Structured submission-time validation failure.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    /// Stable error code (`invalid_request` or `unknown_model`).
    pub code: String,
    /// The request field at fault.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ValidationError {
            code: "invalid_request".to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.field, self.message)
    }
}

impl Error for ValidationError {}

/// Validate a submission against the declared-agent rules.  `knows_model`
/// consults the model registry.
pub fn validate_request<F: Fn(&str) -> bool>(
    request: &WorkflowRequest,
    knows_model: F,
) -> Result<(), ValidationError> {
    if request.task.trim().is_empty() {
        return Err(ValidationError::invalid("task", "task must be non-empty"));
    }
    if request.agents.is_empty() {
        return Err(ValidationError::invalid(
            "agents",
            "at least one agent is required",
        ));
    }

    let mut seen = HashMap::new();
    for agent in &request.agents {
        if agent.id.trim().is_empty() {
            return Err(ValidationError::invalid("agents", "agent id must be non-empty"));
        }
        if agent.id == SYSTEM_SENDER {
            return Err(ValidationError::invalid(
                "agents",
                format!("agent id '{}' is reserved", SYSTEM_SENDER),
            ));
        }
        if seen.insert(agent.id.clone(), ()).is_some() {
            return Err(ValidationError::invalid(
                "agents",
                format!("duplicate agent id '{}'", agent.id),
            ));
        }
        if !knows_model(&agent.model) {
            return Err(ValidationError {
                code: "unknown_model".to_string(),
                field: "model".to_string(),
                message: format!("model '{}' is not registered", agent.model),
            });
        }
    }

    let has_coordinator = request.agents.iter().any(|a| a.role.is_coordinator());
    if !has_coordinator && request.agents.len() > 1 {
        return Err(ValidationError::invalid(
            "agents",
            "multi-agent workflows require an agent with role 'coordinator'",
        ));
    }

    for edge in &request.edges {
        if !seen.contains_key(&edge.from) || !seen.contains_key(&edge.to) {
            return Err(ValidationError::invalid(
                "edges",
                format!("edge {} -> {} references an undeclared agent", edge.from, edge.to),
            ));
        }
    }
    Ok(())
}

/// The role-default system prompt, used when the caller supplies none.
///
/// The coordinator default explicitly forbids producing code — coordinators
/// that write code instead of delegating starve the specialist agents.  A
/// caller-supplied prompt is not overridden, but it is also not policed.
pub fn default_system_prompt(role: &AgentRole, roster: &[AgentSpec]) -> String {
    match role {
        AgentRole::Coordinator => {
            let mut prompt = String::from(
                "You are the coordinator of a team of agents working on a software task. \
                 Decompose the task and delegate each piece by addressing an agent by its \
                 role name (for example: 'Coder: implement the function'). \
                 You must NOT write code yourself; delegation is your only output. \
                 When every agent has finished its work, reply with COORDINATION COMPLETE.",
            );
            let teammates: Vec<&str> = roster
                .iter()
                .filter(|a| !a.role.is_coordinator())
                .map(|a| a.role.as_str())
                .collect();
            if !teammates.is_empty() {
                prompt.push_str("\nYour team: ");
                prompt.push_str(&teammates.join(", "));
                prompt.push('.');
            }
            prompt
        }
        AgentRole::Coder => String::from(
            "You are a software engineer. Implement what is asked in fenced code blocks, \
             one file per block, preceding each block with a comment line naming the file \
             path (for example: '# path: src/main.py'). \
             When the implementation is finished, end your reply with CODE COMPLETE.",
        ),
        AgentRole::Tester => String::from(
            "You are a test engineer. Write tests for the implementation in fenced code \
             blocks, placing files under tests/ with a path comment (for example: \
             '# path: tests/test_main.py'). \
             When the tests are finished, end your reply with TESTING COMPLETE.",
        ),
        AgentRole::Runner => String::from(
            "You execute test suites and report results. Reply with a TEST EXECUTION \
             summary that states PASS or FAIL for the suite.",
        ),
        AgentRole::Custom(label) => format!(
            "You are the '{}' agent in a software workflow. Respond helpfully and \
             concisely to each request.",
            label
        ),
    }
}

/// Runtime state of one workflow, owned by the engine.
pub struct WorkflowState {
    pub id: String,
    pub task: String,
    /// Declared agents in declaration order (routing fallback depends on it).
    pub agents: Vec<AgentSpec>,
    pub edges: Vec<Edge>,
    /// Append-only, strictly ordered by index.
    pub turns: Vec<Turn>,
    /// Per-agent conversation history, excluding the system prompt.
    pub transcripts: HashMap<String, Vec<Message>>,
    /// One-way false -> true completion flags.
    pub completed: HashMap<String, bool>,
    pub status: WorkflowStatus,
    pub status_reason: Option<String>,
    /// Created lazily on the first extracted artifact.
    pub project: Option<ProjectHandle>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Cumulative token usage across every LLM call in the workflow.
    pub total_usage: TokenUsage,
    /// Per-workflow override of the engine's overall deadline.
    pub deadline_override: Option<std::time::Duration>,
}

impl WorkflowState {
    /// Build the initial `pending` state for a validated request.
    pub fn new(id: impl Into<String>, request: &WorkflowRequest) -> Self {
        let completed = request
            .agents
            .iter()
            .map(|a| (a.id.clone(), false))
            .collect();
        let transcripts = request
            .agents
            .iter()
            .map(|a| (a.id.clone(), Vec::new()))
            .collect();
        WorkflowState {
            id: id.into(),
            task: request.task.clone(),
            agents: request.agents.clone(),
            edges: request.edges.clone(),
            turns: Vec::new(),
            transcripts,
            completed,
            status: WorkflowStatus::Pending,
            status_reason: None,
            project: None,
            started_at: Utc::now(),
            finished_at: None,
            total_usage: TokenUsage::default(),
            deadline_override: request.deadline_seconds.map(std::time::Duration::from_secs),
        }
    }

    /// Look up a declared agent by id.
    pub fn agent(&self, agent_id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    /// The first agent declared with role `coordinator`, if any.
    pub fn coordinator(&self) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.role.is_coordinator())
    }

    /// Whether `agent_id` names the coordinator.
    pub fn is_coordinator(&self, agent_id: &str) -> bool {
        self.agent(agent_id)
            .map(|a| a.role.is_coordinator())
            .unwrap_or(false)
    }

    /// One-way completion flag transition.
    pub fn mark_completed(&mut self, agent_id: &str) {
        if let Some(flag) = self.completed.get_mut(agent_id) {
            *flag = true;
        }
    }

    pub fn is_agent_completed(&self, agent_id: &str) -> bool {
        self.completed.get(agent_id).copied().unwrap_or(false)
    }

    /// Append a turn with the next monotonic index and a non-decreasing
    /// timestamp, and return its index.
    pub fn append_turn(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> usize {
        let index = self.turns.len();
        let mut timestamp = Utc::now();
        if let Some(last) = self.turns.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        self.turns.push(Turn {
            index,
            from: from.into(),
            to: to.into(),
            content: content.into(),
            timestamp,
            artifacts_extracted: Vec::new(),
        });
        index
    }

    /// Record an artifact path on an existing turn.
    pub fn record_artifact(&mut self, turn_index: usize, relative_path: impl Into<String>) {
        if let Some(turn) = self.turns.get_mut(turn_index) {
            turn.artifacts_extracted.push(relative_path.into());
        }
    }

    /// Append to an agent's transcript, respecting its memory flag for
    /// everything but the immediate inbound delivery handled by the engine.
    pub fn push_transcript(&mut self, agent_id: &str, role: Role, content: impl AsRef<str>) {
        if let Some(transcript) = self.transcripts.get_mut(agent_id) {
            transcript.push(Message::new(role, content));
        }
    }

    /// Agent ids of the declared successors of `agent_id`.
    pub fn successors(&self, agent_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == agent_id)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Transition into a terminal (or running) status.  Terminal states are
    /// sticky: once reached, further transitions are ignored.
    pub fn transition(&mut self, status: WorkflowStatus, reason: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.status_reason = reason;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Build the bounded public snapshot served by the status endpoint.
    pub fn snapshot(&self, turn_tail: usize) -> WorkflowSnapshot {
        let tail_start = self.turns.len().saturating_sub(turn_tail);
        WorkflowSnapshot {
            id: self.id.clone(),
            status: self.status.as_str().to_string(),
            reason: self.status_reason.clone(),
            agents_status: self
                .agents
                .iter()
                .map(|a| AgentStatusEntry {
                    id: a.id.clone(),
                    role: a.role.as_str().to_string(),
                    completed: self.is_agent_completed(&a.id),
                })
                .collect(),
            turns: self.turns[tail_start..].to_vec(),
            project_ref: self.project.as_ref().map(|p| p.name().to_string()),
            started_at: self.started_at,
            finished_at: self.finished_at,
            total_tokens: self.total_usage.total_tokens,
        }
    }
}

/// Per-agent completion summary in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusEntry {
    pub id: String,
    pub role: String,
    pub completed: bool,
}

/// Public view of a workflow served by `GET /workflows/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub agents_status: Vec<AgentStatusEntry>,
    /// Bounded tail of the turn log.
    pub turns: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tokens: usize,
}
