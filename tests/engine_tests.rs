use async_trait::async_trait;
use crewforge::client_wrapper::{
    ClientWrapper, Completion, CompletionOptions, LlmError, LlmErrorKind, Message, Role,
    TokenUsage,
};
use crewforge::config::EngineConfig;
use crewforge::engine::{Engine, EngineError};
use crewforge::event::WorkflowEvent;
use crewforge::publisher::{
    PublishOutcome, PublishError, PublishRequest, RepositoryPublisher, Visibility,
};
use crewforge::registry::ClientFactory;
use crewforge::workflow::{AgentRole, AgentSpec, Edge, WorkflowRequest};
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// A provider client that replays a fixed script of responses, then repeats
/// an optional fallback forever.
struct ScriptedClient {
    model: String,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
}

impl ScriptedClient {
    fn new(model: &str, script: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(ScriptedClient {
            model: model.to_string(),
            script: Mutex::new(script.into_iter().collect()),
            fallback: None,
        })
    }

    fn with_fallback(model: &str, script: Vec<Result<String, LlmError>>, fallback: &str) -> Arc<Self> {
        Arc::new(ScriptedClient {
            model: model.to_string(),
            script: Mutex::new(script.into_iter().collect()),
            fallback: Some(fallback.to_string()),
        })
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(Completion {
                message: Message::new(Role::Assistant, &text),
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                }),
            }),
            Some(Err(e)) => Err(e),
            None => match &self.fallback {
                Some(text) => Ok(Completion {
                    message: Message::new(Role::Assistant, text),
                    usage: None,
                }),
                None => Err(LlmError::new(
                    LlmErrorKind::MalformedResponse,
                    "script exhausted",
                )),
            },
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// A client that never answers, but honours cancellation.
struct HangingClient;

#[async_trait]
impl ClientWrapper for HangingClient {
    async fn complete(
        &self,
        _messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        if let Some(cancel) = &options.cancel {
            cancel.cancelled().await;
            return Err(LlmError::new(LlmErrorKind::Cancelled, "cancelled"));
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(LlmError::new(LlmErrorKind::Transport, "unreachable"))
    }

    fn model_name(&self) -> &str {
        "hanging"
    }
}

struct MockFactory {
    clients: HashMap<String, Arc<dyn ClientWrapper>>,
}

impl ClientFactory for MockFactory {
    fn knows_model(&self, model_id: &str) -> bool {
        self.clients.contains_key(model_id)
    }

    fn client_for(&self, model_id: &str) -> Result<Arc<dyn ClientWrapper>, LlmError> {
        self.clients
            .get(model_id)
            .cloned()
            .ok_or_else(|| LlmError::new(LlmErrorKind::UnknownModel, model_id))
    }
}

/// Publisher double that records what it was asked to push.
struct RecordingPublisher {
    last_request: Mutex<Option<PublishRequest>>,
}

impl RecordingPublisher {
    fn new() -> Arc<Self> {
        Arc::new(RecordingPublisher {
            last_request: Mutex::new(None),
        })
    }
}

#[async_trait]
impl RepositoryPublisher for RecordingPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, PublishError> {
        *self.last_request.lock().unwrap() = Some(request.clone());
        Ok(PublishOutcome {
            repository_url: format!("https://example.test/{}", request.project_name),
            commit_id: "abc123".to_string(),
            files_pushed: request.files.len(),
        })
    }

    async fn validate_credentials(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

fn agent(id: &str, role: &str, model: &str) -> AgentSpec {
    AgentSpec {
        id: id.to_string(),
        role: AgentRole::parse(role),
        model: model.to_string(),
        system_prompt: None,
        memory_enabled: true,
    }
}

fn edge(from: &str, to: &str) -> Edge {
    Edge {
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn request(task: &str, agents: Vec<AgentSpec>, edges: Vec<Edge>) -> WorkflowRequest {
    WorkflowRequest {
        task: task.to_string(),
        agents,
        edges,
        await_completion: true,
        deadline_seconds: None,
        publish: false,
    }
}

fn engine_with(
    base_dir: &Path,
    clients: Vec<(&str, Arc<dyn ClientWrapper>)>,
    publisher: Option<Arc<dyn RepositoryPublisher>>,
) -> Engine {
    let mut config = EngineConfig::default();
    config.base_project_dir = base_dir.to_path_buf();
    config.retry_backoff_initial = Duration::from_millis(1);
    config.retry_backoff_max = Duration::from_millis(2);
    let factory = MockFactory {
        clients: clients
            .into_iter()
            .map(|(model, client)| (model.to_string(), client))
            .collect(),
    };
    Engine::new(config, Arc::new(factory), publisher)
}

/// Drain a workflow's event history after it has finished.
async fn collect_events(engine: &Engine, workflow_id: &str) -> Vec<WorkflowEvent> {
    let mut stream = engine
        .subscribe(workflow_id, None)
        .await
        .expect("workflow should exist");
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn single_agent_echo_completes_without_a_project() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        temp.path(),
        vec![(
            "local-stub",
            ScriptedClient::new("local-stub", vec![Ok("hi".to_string())]) as Arc<dyn ClientWrapper>,
        )],
        None,
    );

    let outcome = engine
        .submit(request("say hi", vec![agent("a", "custom", "local-stub")], vec![]))
        .await
        .unwrap();

    assert_eq!(outcome.status, "completed");
    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.turns.len(), 2);
    assert_eq!(snapshot.turns[0].from, "system");
    assert_eq!(snapshot.turns[0].to, "a");
    assert_eq!(snapshot.turns[1].from, "a");
    assert_eq!(snapshot.turns[1].to, "system");
    assert!(snapshot.project_ref.is_none());

    // No artifacts: the base directory must stay empty.
    let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn coordinator_delegates_to_coder_once() {
    let temp = TempDir::new().unwrap();
    let coder_reply =
        "```python\n# path: src/add.py\ndef add(a, b): return a + b\n```\nCODE COMPLETE";
    let engine = engine_with(
        temp.path(),
        vec![
            (
                "stub-c",
                ScriptedClient::new(
                    "stub-c",
                    vec![
                        Ok("Coder: write add".to_string()),
                        Ok("COORDINATION COMPLETE".to_string()),
                    ],
                ) as Arc<dyn ClientWrapper>,
            ),
            (
                "stub-k",
                ScriptedClient::new("stub-k", vec![Ok(coder_reply.to_string())])
                    as Arc<dyn ClientWrapper>,
            ),
        ],
        None,
    );

    let outcome = engine
        .submit(request(
            "write add(a,b)",
            vec![agent("c", "coordinator", "stub-c"), agent("k", "coder", "stub-k")],
            vec![edge("c", "k"), edge("k", "c")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.status, "completed");
    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.turns.len(), 4);
    assert_eq!(snapshot.turns[2].artifacts_extracted, vec!["src/add.py"]);

    let project_name = snapshot.project_ref.unwrap();
    let written = std::fs::read_to_string(temp.path().join(&project_name).join("src/add.py"))
        .unwrap();
    assert!(written.contains("def add(a, b): return a + b"));
}

#[tokio::test]
async fn incomplete_agent_fallback_selects_the_tester() {
    let temp = TempDir::new().unwrap();
    let tester_reply = "```python\n# path: tests/test_sum.py\nimport pytest\n\ndef test_sum():\n    assert 1 + 2 == 3\n```\nTESTING COMPLETE";
    let engine = engine_with(
        temp.path(),
        vec![
            (
                "stub-c",
                ScriptedClient::new(
                    "stub-c",
                    vec![
                        Ok("Coder: implement sum".to_string()),
                        // Deliberately names nobody: routing must fall back
                        // to the incomplete tester.
                        Ok("nice work everyone".to_string()),
                        Ok("COORDINATION COMPLETE".to_string()),
                    ],
                ) as Arc<dyn ClientWrapper>,
            ),
            (
                "stub-k",
                ScriptedClient::new(
                    "stub-k",
                    vec![Ok(
                        "```python\n# path: src/sum.py\ndef sum_list(xs): return sum(xs)\n```\nCODE COMPLETE"
                            .to_string(),
                    )],
                ) as Arc<dyn ClientWrapper>,
            ),
            (
                "stub-t",
                ScriptedClient::new("stub-t", vec![Ok(tester_reply.to_string())])
                    as Arc<dyn ClientWrapper>,
            ),
        ],
        None,
    );

    let outcome = engine
        .submit(request(
            "sum with tests",
            vec![
                agent("c", "coordinator", "stub-c"),
                agent("k", "coder", "stub-k"),
                agent("t", "tester", "stub-t"),
            ],
            vec![edge("c", "k"), edge("k", "c"), edge("c", "t"), edge("t", "c")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.status, "completed");
    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.turns.len(), 6);
    // The tester spoke after the coordinator's non-designating message.
    assert_eq!(snapshot.turns[4].from, "t");

    let project_name = snapshot.project_ref.unwrap();
    assert!(temp
        .path()
        .join(&project_name)
        .join("tests/test_sum.py")
        .is_file());
}

#[tokio::test]
async fn transient_llm_failures_are_retried_with_warnings() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        temp.path(),
        vec![(
            "flaky",
            ScriptedClient::new(
                "flaky",
                vec![
                    Err(LlmError::new(LlmErrorKind::Transport, "connection reset")),
                    Err(LlmError::new(LlmErrorKind::Transport, "connection reset")),
                    Ok("hi".to_string()),
                ],
            ) as Arc<dyn ClientWrapper>,
        )],
        None,
    );

    let outcome = engine
        .submit(request("say hi", vec![agent("a", "custom", "flaky")], vec![]))
        .await
        .unwrap();
    assert_eq!(outcome.status, "completed");

    let events = collect_events(&engine, &outcome.workflow_id).await;
    let warnings: Vec<&WorkflowEvent> = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::Warning { code, .. } if code == "transport_error"))
        .collect();
    assert_eq!(warnings.len(), 2);

    // Turn ordering is unchanged: agent_message turn indexes are strictly
    // increasing for every subscriber.
    let message_indexes: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::AgentMessage { turn_index, .. } => Some(*turn_index),
            _ => None,
        })
        .collect();
    assert_eq!(message_indexes, vec![0, 1]);
}

#[tokio::test]
async fn auth_errors_fail_the_workflow_immediately() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        temp.path(),
        vec![(
            "locked",
            ScriptedClient::new(
                "locked",
                vec![
                    Err(LlmError::new(LlmErrorKind::AuthError, "bad key")),
                    Ok("never reached".to_string()),
                ],
            ) as Arc<dyn ClientWrapper>,
        )],
        None,
    );

    let outcome = engine
        .submit(request("say hi", vec![agent("a", "custom", "locked")], vec![]))
        .await
        .unwrap();
    assert_eq!(outcome.status, "failed");
    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.reason.as_deref(), Some("provider_auth_error"));
}

#[tokio::test]
async fn turn_budget_exhaustion_stops_the_ping_pong() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        temp.path(),
        vec![
            (
                "stub-c",
                ScriptedClient::with_fallback("stub-c", vec![], "Coder: keep going")
                    as Arc<dyn ClientWrapper>,
            ),
            (
                "stub-k",
                ScriptedClient::with_fallback("stub-k", vec![], "still working on it")
                    as Arc<dyn ClientWrapper>,
            ),
        ],
        None,
    );

    let outcome = engine
        .submit(request(
            "never finishes",
            vec![agent("c", "coordinator", "stub-c"), agent("k", "coder", "stub-k")],
            vec![edge("c", "k"), edge("k", "c")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.status, "completed");
    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.reason.as_deref(), Some("turn_budget_exhausted"));
    // Budget clamps to 6 for two agents: exactly six turns, seed included.
    assert_eq!(snapshot.turns.len(), 6);
}

#[tokio::test]
async fn cancellation_aborts_an_in_flight_llm_call() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        temp.path(),
        vec![("hanging", Arc::new(HangingClient) as Arc<dyn ClientWrapper>)],
        None,
    );

    let outcome = engine
        .submit(WorkflowRequest {
            task: "wait forever".to_string(),
            agents: vec![agent("a", "custom", "hanging")],
            edges: vec![],
            await_completion: false,
            deadline_seconds: None,
            publish: false,
        })
        .await
        .unwrap();

    // Give the turn loop a moment to enter the LLM call, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.cancel(&outcome.workflow_id).await);

    let mut status = String::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = engine
            .status(&outcome.workflow_id)
            .await
            .unwrap()
            .status
            .clone();
        if status == "cancelled" {
            break;
        }
    }
    assert_eq!(status, "cancelled");
}

#[tokio::test]
async fn workflow_deadline_expiry_fails_the_workflow() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        temp.path(),
        vec![("hanging", Arc::new(HangingClient) as Arc<dyn ClientWrapper>)],
        None,
    );

    let outcome = engine
        .submit(WorkflowRequest {
            task: "too slow".to_string(),
            agents: vec![agent("a", "custom", "hanging")],
            edges: vec![],
            await_completion: true,
            deadline_seconds: Some(1),
            publish: false,
        })
        .await
        .unwrap();

    assert_eq!(outcome.status, "failed");
    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.reason.as_deref(), Some("deadline_exceeded"));
}

#[tokio::test]
async fn submission_validation_is_synchronous() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(temp.path(), vec![], None);

    let err = engine
        .submit(request("task", vec![], vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.code, "invalid_request");

    let err = engine
        .submit(request(
            "task",
            vec![agent("a", "custom", "no-such-model")],
            vec![],
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code, "unknown_model");
}

#[tokio::test]
async fn publish_pushes_project_files_plus_readme() {
    let temp = TempDir::new().unwrap();
    let publisher = RecordingPublisher::new();
    let coder_reply =
        "```python\n# path: src/add.py\ndef add(a, b): return a + b\n```\nCODE COMPLETE";
    let engine = engine_with(
        temp.path(),
        vec![
            (
                "stub-c",
                ScriptedClient::new(
                    "stub-c",
                    vec![
                        Ok("Coder: write add".to_string()),
                        Ok("COORDINATION COMPLETE".to_string()),
                    ],
                ) as Arc<dyn ClientWrapper>,
            ),
            (
                "stub-k",
                ScriptedClient::new("stub-k", vec![Ok(coder_reply.to_string())])
                    as Arc<dyn ClientWrapper>,
            ),
        ],
        Some(publisher.clone() as Arc<dyn RepositoryPublisher>),
    );

    let outcome = engine
        .submit(request(
            "write add(a,b)",
            vec![agent("c", "coordinator", "stub-c"), agent("k", "coder", "stub-k")],
            vec![edge("c", "k"), edge("k", "c")],
        ))
        .await
        .unwrap();
    assert_eq!(outcome.status, "completed");

    let result = engine
        .publish(&outcome.workflow_id, Visibility::Private)
        .await
        .unwrap();
    // One extracted file plus the README.
    assert_eq!(result.files_pushed, 2);

    let recorded = publisher.last_request.lock().unwrap().clone().unwrap();
    let paths: Vec<&str> = recorded
        .files
        .iter()
        .map(|f| f.relative_path.as_str())
        .collect();
    assert!(paths.contains(&"src/add.py"));
    assert!(paths.contains(&"README.md"));
    // The publication-time README includes the discovered file list.
    let readme = recorded
        .files
        .iter()
        .find(|f| f.relative_path == "README.md")
        .unwrap();
    assert!(readme.contents.contains("src/add.py"));
}

#[tokio::test]
async fn publish_requires_a_completed_workflow() {
    let temp = TempDir::new().unwrap();
    let publisher = RecordingPublisher::new();
    let engine = engine_with(
        temp.path(),
        vec![("hanging", Arc::new(HangingClient) as Arc<dyn ClientWrapper>)],
        Some(publisher as Arc<dyn RepositoryPublisher>),
    );

    let outcome = engine
        .submit(WorkflowRequest {
            task: "still running".to_string(),
            agents: vec![agent("a", "custom", "hanging")],
            edges: vec![],
            await_completion: false,
            deadline_seconds: None,
            publish: false,
        })
        .await
        .unwrap();

    let err = engine
        .publish(&outcome.workflow_id, Visibility::Public)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotCompleted { .. }));

    engine.cancel(&outcome.workflow_id).await;
}

#[tokio::test]
async fn publish_intent_requires_a_configured_publisher() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        temp.path(),
        vec![(
            "local-stub",
            ScriptedClient::new("local-stub", vec![Ok("hi".to_string())]) as Arc<dyn ClientWrapper>,
        )],
        None,
    );

    let err = engine
        .submit(WorkflowRequest {
            task: "say hi".to_string(),
            agents: vec![agent("a", "custom", "local-stub")],
            edges: vec![],
            await_completion: false,
            deadline_seconds: None,
            publish: true,
        })
        .await
        .unwrap_err();
    assert_eq!(err.field, "publish");
}

#[tokio::test]
async fn completion_flags_survive_in_the_snapshot() {
    let temp = TempDir::new().unwrap();
    let coder_reply = "CODE COMPLETE";
    let engine = engine_with(
        temp.path(),
        vec![
            (
                "stub-c",
                ScriptedClient::new(
                    "stub-c",
                    vec![
                        Ok("Coder: go".to_string()),
                        Ok("ALL AGENTS COMPLETED".to_string()),
                    ],
                ) as Arc<dyn ClientWrapper>,
            ),
            (
                "stub-k",
                ScriptedClient::new("stub-k", vec![Ok(coder_reply.to_string())])
                    as Arc<dyn ClientWrapper>,
            ),
        ],
        None,
    );

    let outcome = engine
        .submit(request(
            "small task",
            vec![agent("c", "coordinator", "stub-c"), agent("k", "coder", "stub-k")],
            vec![edge("c", "k"), edge("k", "c")],
        ))
        .await
        .unwrap();

    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.status, "completed");
    let coder_status = snapshot
        .agents_status
        .iter()
        .find(|a| a.id == "k")
        .unwrap();
    assert!(coder_status.completed);
    assert!(snapshot.total_tokens > 0);
}
