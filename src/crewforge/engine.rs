//! The workflow execution engine.
//!
//! An [`Engine`] value owns every workflow's state together with its
//! dependencies — the client factory, the project store, the event bus, and
//! an optional repository publisher.  There is no module-level state: build
//! an engine, clone the handle wherever it is needed.
//!
//! Workflows execute concurrently as spawned tasks, but a single workflow's
//! turn loop is strictly sequential: no two turns for the same workflow ever
//! run in parallel.  Within a turn the suspension points are the LLM call
//! (dominant), the atomic artifact writes, and event publication — which
//! never blocks the loop.
//!
//! # Turn loop
//!
//! 1. Seed a synthetic turn `system -> coordinator` carrying the task.
//! 2. Pick the next agent via the routing policy; none means the completion
//!    detector takes over.
//! 3. Build the agent's prompt: its system prompt (or role default), its
//!    transcript when memory is enabled, and the inbound message.
//! 4. Call the LLM adapter, retrying retryable failures with exponential
//!    backoff bounded by the attempt cap, the per-turn timeout, and the
//!    workflow deadline.
//! 5. Append the turn, fan out events, and deliver the response to the
//!    sender's transcript and each graph successor's transcript.
//! 6. Extract artifacts and write them through the project store; write
//!    failures warn and drop the artifact without failing the workflow.
//! 7. Update completion flags and re-consult the completion detector.

use crate::crewforge::client_wrapper::{
    cancel_pair, CancelHandle, CancelToken, ClientWrapper, Completion, CompletionOptions,
    LlmError, LlmErrorKind, Message, Role,
};
use crate::crewforge::completion;
use crate::crewforge::config::EngineConfig;
use crate::crewforge::event::{EventBus, EventStream, WorkflowEvent};
use crate::crewforge::extractor;
use crate::crewforge::project_store::{ProjectHandle, ProjectStore, ProjectStoreError};
use crate::crewforge::publisher::{
    GitHubPublisher, PublishError, PublishFile, PublishOutcome, PublishRequest,
    RepositoryPublisher, Visibility,
};
use crate::crewforge::registry::{
    ClientFactory, ModelRegistry, RegistryClientFactory, RegistryError,
};
use crate::crewforge::routing;
use crate::crewforge::workflow::{
    default_system_prompt, validate_request, ValidationError, WorkflowRequest, WorkflowSnapshot,
    WorkflowState, WorkflowStatus, SYSTEM_SENDER,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Number of trailing turns included in a status snapshot.
const SNAPSHOT_TURN_TAIL: usize = 50;

/// Errors surfaced by engine operations after submission.
#[derive(Debug)]
pub enum EngineError {
    /// No workflow with that id.
    NotFound(String),
    /// Publication requires terminal status `completed`.
    NotCompleted { id: String, status: &'static str },
    /// No repository publisher configured.
    PublisherUnavailable,
    /// The workflow completed without producing any artifacts.
    NoProject(String),
    /// Publisher failure.
    Publish(PublishError),
    /// Project store failure while preparing the upload.
    Store(ProjectStoreError),
}

impl EngineError {
    /// Stable string code for structured API errors.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::NotCompleted { .. } => "not_completed",
            EngineError::PublisherUnavailable => "publisher_unavailable",
            EngineError::NoProject(_) => "no_project",
            EngineError::Publish(e) => e.code(),
            EngineError::Store(_) => "publish_failed",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "workflow '{}' not found", id),
            EngineError::NotCompleted { id, status } => {
                write!(f, "workflow '{}' is {}, not completed", id, status)
            }
            EngineError::PublisherUnavailable => {
                write!(f, "no repository publisher is configured")
            }
            EngineError::NoProject(id) => {
                write!(f, "workflow '{}' produced no artifacts to publish", id)
            }
            EngineError::Publish(e) => write!(f, "{}", e),
            EngineError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl Error for EngineError {}

/// Response to a submission.
#[derive(Debug, Serialize)]
pub struct SubmitOutcome {
    pub workflow_id: String,
    pub status: String,
    /// Populated when the caller awaited completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<WorkflowSnapshot>,
}

struct EngineInner {
    config: EngineConfig,
    clients: Arc<dyn ClientFactory>,
    store: ProjectStore,
    bus: EventBus,
    publisher: Option<Arc<dyn RepositoryPublisher>>,
    workflows: RwLock<HashMap<String, Arc<RwLock<WorkflowState>>>>,
    cancel_handles: StdMutex<HashMap<String, CancelHandle>>,
}

/// Cheaply cloneable handle to the workflow execution engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine from explicit dependencies.
    pub fn new(
        config: EngineConfig,
        clients: Arc<dyn ClientFactory>,
        publisher: Option<Arc<dyn RepositoryPublisher>>,
    ) -> Self {
        let store = ProjectStore::new(config.base_project_dir.clone());
        let bus = EventBus::new(config.event_subscriber_buffer);
        Engine {
            inner: Arc::new(EngineInner {
                config,
                clients,
                store,
                bus,
                publisher,
                workflows: RwLock::new(HashMap::new()),
                cancel_handles: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Build an engine from configuration alone: the model registry comes
    /// from the configured definitions file (or the built-in snapshot) and a
    /// GitHub publisher is wired when repository credentials are present.
    pub fn from_config(config: EngineConfig) -> Result<Self, RegistryError> {
        let registry = match &config.model_registry_path {
            Some(path) => ModelRegistry::from_file(path)?,
            None => ModelRegistry::builtin(),
        };
        let factory = Arc::new(RegistryClientFactory::new(
            registry,
            config.llm_credentials.clone(),
        ));
        let publisher: Option<Arc<dyn RepositoryPublisher>> = config
            .repository_credentials
            .clone()
            .map(|credentials| {
                Arc::new(GitHubPublisher::new(credentials)) as Arc<dyn RepositoryPublisher>
            });
        Ok(Engine::new(config, factory, publisher))
    }

    /// The model definitions this engine accepts, when backed by a registry
    /// factory.  Used by the read-only listing endpoint.
    pub fn client_factory(&self) -> &Arc<dyn ClientFactory> {
        &self.inner.clients
    }

    /// Validate and schedule a workflow.  Returns synchronously with the new
    /// id unless `await_completion` is set, in which case the call blocks
    /// until the workflow reaches a terminal state (bounded by the workflow
    /// deadline plus a margin).
    pub async fn submit(&self, request: WorkflowRequest) -> Result<SubmitOutcome, ValidationError> {
        validate_request(&request, |model| self.inner.clients.knows_model(model))?;
        if request.publish {
            // Publisher availability and credentials are checked at
            // submission time, not at publish time.
            match &self.inner.publisher {
                None => {
                    return Err(ValidationError {
                        code: "invalid_request".to_string(),
                        field: "publish".to_string(),
                        message: "no repository publisher is configured".to_string(),
                    });
                }
                Some(publisher) => {
                    if let Err(e) = publisher.validate_credentials().await {
                        return Err(ValidationError {
                            code: "invalid_request".to_string(),
                            field: "publish".to_string(),
                            message: format!("repository credentials rejected: {}", e),
                        });
                    }
                }
            }
        }

        let workflow_id = uuid::Uuid::new_v4().to_string();
        let await_completion = request.await_completion;
        let state = WorkflowState::new(workflow_id.clone(), &request);
        let deadline = state
            .deadline_override
            .unwrap_or(self.inner.config.workflow_deadline);

        let state_arc = Arc::new(RwLock::new(state));
        self.inner
            .workflows
            .write()
            .await
            .insert(workflow_id.clone(), state_arc);

        let (handle, token) = cancel_pair();
        self.inner
            .cancel_handles
            .lock()
            .expect("cancel handle lock poisoned")
            .insert(workflow_id.clone(), handle);

        // Subscribe before spawning so a fast workflow cannot finish between
        // the spawn and the wait.
        let wait_stream = if await_completion {
            let kinds: HashSet<String> = vec!["workflow_status".to_string()].into_iter().collect();
            Some(self.inner.bus.subscribe(&workflow_id, Some(kinds), true))
        } else {
            None
        };

        let inner = self.inner.clone();
        let spawn_id = workflow_id.clone();
        tokio::spawn(async move {
            run_workflow(inner, spawn_id, token).await;
        });

        if let Some(stream) = wait_stream {
            self.wait_terminal(stream, deadline + Duration::from_secs(30))
                .await;
            let snapshot = self.status(&workflow_id).await;
            let status = snapshot
                .as_ref()
                .map(|s| s.status.clone())
                .unwrap_or_else(|| "pending".to_string());
            return Ok(SubmitOutcome {
                workflow_id,
                status,
                snapshot,
            });
        }

        Ok(SubmitOutcome {
            workflow_id,
            status: WorkflowStatus::Pending.as_str().to_string(),
            snapshot: None,
        })
    }

    async fn wait_terminal(&self, mut stream: EventStream, cap: Duration) {
        let _ = tokio::time::timeout(cap, async {
            while let Some(event) = stream.next().await {
                if event.is_terminal() {
                    break;
                }
            }
        })
        .await;
    }

    /// Bounded public snapshot of a workflow, or `None` when unknown.
    pub async fn status(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        let state_arc = self.inner.workflows.read().await.get(workflow_id).cloned()?;
        let state = state_arc.read().await;
        Some(state.snapshot(SNAPSHOT_TURN_TAIL))
    }

    /// Subscribe to a workflow's live events, optionally filtered by kind.
    /// Recent history is replayed so late subscribers see the whole story.
    pub async fn subscribe(
        &self,
        workflow_id: &str,
        kinds: Option<HashSet<String>>,
    ) -> Option<EventStream> {
        if !self.inner.workflows.read().await.contains_key(workflow_id) {
            return None;
        }
        Some(self.inner.bus.subscribe(workflow_id, kinds, true))
    }

    /// Request cancellation.  If the workflow is inside an LLM call, the
    /// call's cancellation token fires and the workflow transitions to
    /// `cancelled` once the current turn's bookkeeping completes.
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        if !self.inner.workflows.read().await.contains_key(workflow_id) {
            return false;
        }
        let handles = self
            .inner
            .cancel_handles
            .lock()
            .expect("cancel handle lock poisoned");
        match handles.get(workflow_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Upload a completed workflow's project as a new remote repository.
    pub async fn publish(
        &self,
        workflow_id: &str,
        visibility: Visibility,
    ) -> Result<PublishOutcome, EngineError> {
        let publisher = self
            .inner
            .publisher
            .as_ref()
            .ok_or(EngineError::PublisherUnavailable)?
            .clone();

        let state_arc = self
            .inner
            .workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;

        let (project, task) = {
            let state = state_arc.read().await;
            if state.status != WorkflowStatus::Completed {
                return Err(EngineError::NotCompleted {
                    id: workflow_id.to_string(),
                    status: state.status.as_str(),
                });
            }
            let project = state
                .project
                .clone()
                .ok_or_else(|| EngineError::NoProject(workflow_id.to_string()))?;
            (project, state.task.clone())
        };

        let request = self
            .build_publish_request(&project, &task, visibility)
            .await
            .map_err(EngineError::Store)?;
        publisher
            .publish(&request)
            .await
            .map_err(EngineError::Publish)
    }

    /// Rewrite the README with the discovered file list and collect every
    /// project file (README included) for the upload.
    async fn build_publish_request(
        &self,
        project: &ProjectHandle,
        task: &str,
        visibility: Visibility,
    ) -> Result<PublishRequest, ProjectStoreError> {
        self.inner.store.rewrite_readme(project).await?;

        let mut files = Vec::new();
        for record in self.inner.store.snapshot(project).await {
            let contents = tokio::fs::read_to_string(project.root().join(&record.relative_path))
                .await
                .map_err(|e| {
                    ProjectStoreError::Io(format!("{}: {}", record.relative_path, e))
                })?;
            files.push(PublishFile {
                relative_path: record.relative_path,
                contents,
            });
        }
        let readme = tokio::fs::read_to_string(project.root().join("README.md"))
            .await
            .map_err(|e| ProjectStoreError::Io(format!("README.md: {}", e)))?;
        files.push(PublishFile {
            relative_path: "README.md".to_string(),
            contents: readme,
        });

        Ok(PublishRequest {
            project_name: project.name().to_string(),
            commit_message: format!("Add generated project for task: {}", truncate(task, 60)),
            files,
            visibility,
        })
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

/// Build the message list for one agent's turn: system prompt (caller's, or
/// the role default), the transcript when memory is enabled, and the inbound
/// message as the final `user` entry when the transcript does not already
/// end with it.
fn build_messages(state: &WorkflowState, agent_id: &str, inbound: &str) -> Vec<Message> {
    let agent = match state.agent(agent_id) {
        Some(agent) => agent,
        None => return Vec::new(),
    };
    let system_prompt = match &agent.system_prompt {
        Some(prompt) if !prompt.trim().is_empty() => prompt.clone(),
        _ => default_system_prompt(&agent.role, &state.agents),
    };

    let mut messages = vec![Message::new(Role::System, &system_prompt)];
    if agent.memory_enabled {
        if let Some(transcript) = state.transcripts.get(agent_id) {
            messages.extend(transcript.iter().cloned());
        }
    }
    let already_delivered = messages
        .last()
        .map(|m| m.role == Role::User && m.content.as_ref() == inbound)
        .unwrap_or(false);
    if !already_delivered {
        messages.push(Message::new(Role::User, inbound));
    }
    messages
}

/// One LLM call with the engine's uniform retry policy: retryable kinds are
/// re-attempted with exponential backoff (honouring `Retry-After`), bounded
/// by the attempt cap, the per-turn timeout, and the workflow deadline.  A
/// warning event is emitted per failed attempt.
async fn call_with_retry(
    inner: &EngineInner,
    workflow_id: &str,
    client: &Arc<dyn ClientWrapper>,
    messages: &[Message],
    options: &CompletionOptions,
    deadline: Instant,
) -> Result<Completion, LlmError> {
    let max_attempts = inner.config.retry_max_attempts.max(1);
    let mut backoff = inner.config.retry_backoff_initial;

    let mut attempt = 1;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(LlmError::new(
                LlmErrorKind::Transport,
                "workflow deadline reached before the call could start",
            ));
        }
        let per_call = inner.config.per_turn_timeout.min(remaining);

        let outcome = tokio::time::timeout(per_call, client.complete(messages, options)).await;
        let err = match outcome {
            Ok(Ok(completion)) => return Ok(completion),
            Ok(Err(e)) => e,
            // The per-turn deadline counts as a retryable transport failure.
            Err(_) => LlmError::new(
                LlmErrorKind::Transport,
                format!("turn deadline of {:?} exceeded", per_call),
            ),
        };

        if err.kind == LlmErrorKind::Cancelled {
            return Err(err);
        }

        inner.bus.publish(WorkflowEvent::Warning {
            workflow_id: workflow_id.to_string(),
            code: err.kind.code().to_string(),
            detail: format!("attempt {}/{}: {}", attempt, max_attempts, err.message),
        });
        if log::log_enabled!(log::Level::Warn) {
            log::warn!(
                "crewforge::engine: workflow {} attempt {}/{} failed: {}",
                workflow_id,
                attempt,
                max_attempts,
                err
            );
        }

        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }

        let delay = err
            .retry_after
            .unwrap_or(backoff)
            .min(deadline.saturating_duration_since(Instant::now()));
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(inner.config.retry_backoff_max);
        attempt += 1;
    }
}

/// The sequential turn loop for one workflow.
async fn run_workflow(inner: Arc<EngineInner>, workflow_id: String, cancel: CancelToken) {
    let state_arc = match inner.workflows.read().await.get(&workflow_id).cloned() {
        Some(state) => state,
        None => return,
    };

    // Seed: transition to running and address the task to the root agent.
    let (task, root, budget, deadline) = {
        let mut state = state_arc.write().await;
        state.transition(WorkflowStatus::Running, None);
        state.started_at = Utc::now();
        let root = match routing::initial_recipient(&state) {
            Some(agent) => agent.id.clone(),
            None => {
                // Validation makes this unreachable, but a workflow must
                // never wedge in `running`.
                state.transition(WorkflowStatus::Failed, Some("no_root_recipient".to_string()));
                drop(state);
                publish_status(&inner, &state_arc).await;
                return;
            }
        };
        let budget = inner.config.turn_budget(state.agents.len());
        let deadline = Instant::now()
            + state
                .deadline_override
                .unwrap_or(inner.config.workflow_deadline);
        let task = state.task.clone();
        state.append_turn(SYSTEM_SENDER, root.as_str(), task.as_str());
        state.push_transcript(&root, Role::User, &task);
        (task, root, budget, deadline)
    };

    publish_status(&inner, &state_arc).await;
    inner.bus.publish(WorkflowEvent::TurnStarted {
        workflow_id: workflow_id.clone(),
        turn_index: 0,
        from: SYSTEM_SENDER.to_string(),
        to: root.clone(),
    });
    inner.bus.publish(WorkflowEvent::AgentMessage {
        workflow_id: workflow_id.clone(),
        turn_index: 0,
        from: SYSTEM_SENDER.to_string(),
        to: root.clone(),
        content: task.clone(),
        timestamp: Utc::now(),
    });

    let mut current = root;
    let mut inbound = task;
    let mut last_sender = SYSTEM_SENDER.to_string();

    let (final_status, final_reason) = loop {
        if cancel.is_cancelled() {
            break (WorkflowStatus::Cancelled, None);
        }
        {
            let state = state_arc.read().await;
            if state.turns.len() >= budget {
                break (
                    WorkflowStatus::Completed,
                    Some("turn_budget_exhausted".to_string()),
                );
            }
        }
        if Instant::now() >= deadline {
            break (WorkflowStatus::Failed, Some("deadline_exceeded".to_string()));
        }

        let (messages, model_id, next_index) = {
            let state = state_arc.read().await;
            let model_id = match state.agent(&current) {
                Some(agent) => agent.model.clone(),
                None => {
                    break (WorkflowStatus::Failed, Some("unknown_agent".to_string()));
                }
            };
            (
                build_messages(&state, &current, &inbound),
                model_id,
                state.turns.len(),
            )
        };

        inner.bus.publish(WorkflowEvent::TurnStarted {
            workflow_id: workflow_id.clone(),
            turn_index: next_index,
            from: last_sender.clone(),
            to: current.clone(),
        });

        let client = match inner.clients.client_for(&model_id) {
            Ok(client) => client,
            Err(err) => {
                inner.bus.publish(WorkflowEvent::Warning {
                    workflow_id: workflow_id.clone(),
                    code: err.kind.code().to_string(),
                    detail: err.message.clone(),
                });
                break (WorkflowStatus::Failed, Some(err.kind.code().to_string()));
            }
        };
        let mut options = inner.clients.options_for(&model_id);
        options.cancel = Some(cancel.clone());

        let completion = match call_with_retry(
            &inner,
            &workflow_id,
            &client,
            &messages,
            &options,
            deadline,
        )
        .await
        {
            Ok(completion) => completion,
            Err(err) if err.kind == LlmErrorKind::Cancelled => {
                break (WorkflowStatus::Cancelled, None);
            }
            Err(err) => {
                let reason = if Instant::now() >= deadline {
                    "deadline_exceeded".to_string()
                } else {
                    err.kind.code().to_string()
                };
                break (WorkflowStatus::Failed, Some(reason));
            }
        };
        let content = completion.message.content.to_string();

        // Bookkeeping: transcripts, completion flags, routing, turn record.
        let (turn_index, turn_to, hop) = {
            let mut state = state_arc.write().await;
            if let Some(usage) = &completion.usage {
                state.total_usage.accumulate(usage);
            }

            state.push_transcript(&current, Role::Assistant, &content);
            let successors: Vec<String> = state
                .successors(&current)
                .into_iter()
                .map(|s| s.to_string())
                .collect();
            for successor in successors {
                state.push_transcript(&successor, Role::User, &content);
            }

            if let Some(agent) = state.agent(&current) {
                let role = agent.role.clone();
                if completion::role_signals_completion(&role, &content) {
                    state.mark_completed(&current);
                }
            }

            let hop = routing::route_response(&state, &current, &content);
            let turn_to = hop
                .as_ref()
                .map(|h| h.agent_id.clone())
                .unwrap_or_else(|| SYSTEM_SENDER.to_string());
            let turn_index = state.append_turn(current.as_str(), turn_to.as_str(), content.as_str());
            (turn_index, turn_to, hop)
        };

        inner.bus.publish(WorkflowEvent::AgentMessage {
            workflow_id: workflow_id.clone(),
            turn_index,
            from: current.clone(),
            to: turn_to,
            content: content.clone(),
            timestamp: Utc::now(),
        });

        persist_artifacts(&inner, &workflow_id, &state_arc, turn_index, &content).await;

        {
            let state = state_arc.read().await;
            if completion::is_done(&state) {
                break (WorkflowStatus::Completed, None);
            }
        }

        match hop {
            Some(hop) => {
                last_sender = current;
                current = hop.agent_id;
                inbound = hop.inbound;
            }
            None => {
                // Routing is exhausted; the completion detector decides how
                // to report the stop.
                let all_complete = {
                    let state = state_arc.read().await;
                    completion::all_non_coordinators_complete(&state)
                };
                let reason = if all_complete {
                    "all_agents_completed"
                } else {
                    "routing_exhausted"
                };
                break (WorkflowStatus::Completed, Some(reason.to_string()));
            }
        }
    };

    {
        let mut state = state_arc.write().await;
        state.transition(final_status, final_reason);
    }
    publish_status(&inner, &state_arc).await;

    let status = state_arc.read().await.status;
    if log::log_enabled!(log::Level::Info) {
        log::info!(
            "crewforge::engine: workflow {} finished as {}",
            workflow_id,
            status.as_str()
        );
    }
}

/// Run the extractor over a turn's content and write everything it found,
/// creating the project lazily on the first artifact.  Write failures emit a
/// warning and drop the artifact; the turn continues.
async fn persist_artifacts(
    inner: &Arc<EngineInner>,
    workflow_id: &str,
    state_arc: &Arc<RwLock<WorkflowState>>,
    turn_index: usize,
    content: &str,
) {
    let files = extractor::extract(content);
    if files.is_empty() {
        return;
    }

    let project = {
        let existing = state_arc.read().await.project.clone();
        match existing {
            Some(project) => project,
            None => {
                let task = state_arc.read().await.task.clone();
                match inner.store.open_or_create(workflow_id, &task).await {
                    Ok(project) => {
                        state_arc.write().await.project = Some(project.clone());
                        project
                    }
                    Err(err) => {
                        inner.bus.publish(WorkflowEvent::Warning {
                            workflow_id: workflow_id.to_string(),
                            code: "artifact_write_failed".to_string(),
                            detail: format!("could not create project: {}", err),
                        });
                        return;
                    }
                }
            }
        }
    };

    for file in files {
        match inner
            .store
            .write(&project, &file.relative_path, &file.contents, file.kind)
            .await
        {
            Ok(record) => {
                state_arc
                    .write()
                    .await
                    .record_artifact(turn_index, record.relative_path.as_str());
                inner.bus.publish(WorkflowEvent::ArtifactWritten {
                    workflow_id: workflow_id.to_string(),
                    turn_index,
                    relative_path: record.relative_path,
                    kind: file.kind.as_str().to_string(),
                    bytes: record.bytes,
                });
            }
            Err(err) => {
                inner.bus.publish(WorkflowEvent::Warning {
                    workflow_id: workflow_id.to_string(),
                    code: "artifact_write_failed".to_string(),
                    detail: format!("{}: {}", file.relative_path, err),
                });
            }
        }
    }
}

async fn publish_status(inner: &Arc<EngineInner>, state_arc: &Arc<RwLock<WorkflowState>>) {
    let (workflow_id, status, reason) = {
        let state = state_arc.read().await;
        (
            state.id.clone(),
            state.status.as_str().to_string(),
            state.status_reason.clone(),
        )
    };
    inner.bus.publish(WorkflowEvent::WorkflowStatus {
        workflow_id,
        status,
        reason,
    });
}
