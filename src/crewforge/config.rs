//! Engine configuration.
//!
//! One [`EngineConfig`] value is resolved at startup — from defaults, a
//! definitions file, and environment variables — and is immutable from then
//! on.  There is no hidden module-level state: the engine carries its
//! configuration and dependencies explicitly.
//!
//! # Environment variables
//!
//! | Variable | Option |
//! |---|---|
//! | `CREWFORGE_BASE_PROJECT_DIR` | `base_project_dir` |
//! | `CREWFORGE_TURN_BUDGET_MULTIPLIER` | `turn_budget_multiplier` |
//! | `CREWFORGE_PER_TURN_TIMEOUT_SECONDS` | `per_turn_timeout` |
//! | `CREWFORGE_WORKFLOW_DEADLINE_SECONDS` | `workflow_deadline` |
//! | `CREWFORGE_RETRY_MAX_ATTEMPTS` | `retry_max_attempts` |
//! | `CREWFORGE_RETRY_BACKOFF_INITIAL_MS` | `retry_backoff_initial` |
//! | `CREWFORGE_RETRY_BACKOFF_MAX_MS` | `retry_backoff_max` |
//! | `CREWFORGE_EVENT_SUBSCRIBER_BUFFER` | `event_subscriber_buffer` |
//! | `CREWFORGE_MODEL_REGISTRY_PATH` | `model_registry_path` |
//! | `OPENAI_API_KEY` / `ANTHROPIC_API_KEY` / `LOCAL_LLM_API_KEY` | `llm_credentials` |
//! | `GITHUB_TOKEN` + `GITHUB_USERNAME` | `repository_credentials` |
//!
//! Credential values are whitespace-trimmed at load; malformed repository
//! credentials are rejected here rather than at publish time.

use crate::crewforge::publisher::RepoCredentials;
use crate::crewforge::registry::LlmCredentials;
use std::path::PathBuf;
use std::time::Duration;

/// All engine-level tunables, resolved once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for generated projects.
    pub base_project_dir: PathBuf,
    /// Turn budget is `multiplier × agent count`, clamped to `[6, 40]`.
    pub turn_budget_multiplier: usize,
    /// Wall-clock deadline for a single turn's LLM call.
    pub per_turn_timeout: Duration,
    /// Overall wall-clock deadline for a workflow.
    pub workflow_deadline: Duration,
    /// Maximum attempts per LLM call for retryable failures.
    pub retry_max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_backoff_initial: Duration,
    /// Backoff ceiling.
    pub retry_backoff_max: Duration,
    /// Per-subscriber event buffer before a laggard is dropped.
    pub event_subscriber_buffer: usize,
    /// Optional JSON model definitions file replacing the built-in registry.
    pub model_registry_path: Option<PathBuf>,
    /// Provider API keys.
    pub llm_credentials: LlmCredentials,
    /// Remote-repository credentials, if publication is configured.
    pub repository_credentials: Option<RepoCredentials>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            base_project_dir: PathBuf::from("./generated"),
            turn_budget_multiplier: 3,
            per_turn_timeout: Duration::from_secs(180),
            workflow_deadline: Duration::from_secs(1200),
            retry_max_attempts: 3,
            retry_backoff_initial: Duration::from_millis(500),
            retry_backoff_max: Duration::from_millis(8000),
            event_subscriber_buffer: 256,
            model_registry_path: None,
            llm_credentials: LlmCredentials::default(),
            repository_credentials: None,
        }
    }
}

impl EngineConfig {
    /// Resolve a configuration from the environment on top of defaults.
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();

        if let Some(dir) = env_string("CREWFORGE_BASE_PROJECT_DIR") {
            config.base_project_dir = PathBuf::from(dir);
        }
        if let Some(n) = env_parse::<usize>("CREWFORGE_TURN_BUDGET_MULTIPLIER") {
            config.turn_budget_multiplier = n.max(1);
        }
        if let Some(n) = env_parse::<u64>("CREWFORGE_PER_TURN_TIMEOUT_SECONDS") {
            config.per_turn_timeout = Duration::from_secs(n.max(1));
        }
        if let Some(n) = env_parse::<u64>("CREWFORGE_WORKFLOW_DEADLINE_SECONDS") {
            config.workflow_deadline = Duration::from_secs(n.max(1));
        }
        if let Some(n) = env_parse::<u32>("CREWFORGE_RETRY_MAX_ATTEMPTS") {
            config.retry_max_attempts = n.max(1);
        }
        if let Some(n) = env_parse::<u64>("CREWFORGE_RETRY_BACKOFF_INITIAL_MS") {
            config.retry_backoff_initial = Duration::from_millis(n);
        }
        if let Some(n) = env_parse::<u64>("CREWFORGE_RETRY_BACKOFF_MAX_MS") {
            config.retry_backoff_max = Duration::from_millis(n);
        }
        if let Some(n) = env_parse::<usize>("CREWFORGE_EVENT_SUBSCRIBER_BUFFER") {
            config.event_subscriber_buffer = n.max(1);
        }
        if let Some(path) = env_string("CREWFORGE_MODEL_REGISTRY_PATH") {
            config.model_registry_path = Some(PathBuf::from(path));
        }

        config.llm_credentials = LlmCredentials {
            openai_api_key: env_string("OPENAI_API_KEY"),
            anthropic_api_key: env_string("ANTHROPIC_API_KEY"),
            local_api_key: env_string("LOCAL_LLM_API_KEY"),
        };

        if let (Some(token), Some(username)) =
            (env_string("GITHUB_TOKEN"), env_string("GITHUB_USERNAME"))
        {
            match RepoCredentials::new(&token, &username) {
                Ok(credentials) => config.repository_credentials = Some(credentials),
                Err(e) => {
                    log::warn!("crewforge::config: ignoring repository credentials: {}", e);
                }
            }
        }

        config
    }

    /// The hard stop on turns for a workflow with `agent_count` agents:
    /// `multiplier × agent_count`, clamped to `[6, 40]`.
    pub fn turn_budget(&self, agent_count: usize) -> usize {
        (self.turn_budget_multiplier * agent_count).max(6).min(40)
    }
}

/// Read and whitespace-trim an environment variable, mapping empty to absent.
fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.base_project_dir, PathBuf::from("./generated"));
        assert_eq!(config.turn_budget_multiplier, 3);
        assert_eq!(config.per_turn_timeout, Duration::from_secs(180));
        assert_eq!(config.workflow_deadline, Duration::from_secs(1200));
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_backoff_initial, Duration::from_millis(500));
        assert_eq!(config.retry_backoff_max, Duration::from_millis(8000));
        assert_eq!(config.event_subscriber_buffer, 256);
    }

    #[test]
    fn turn_budget_clamps_to_bounds() {
        let config = EngineConfig::default();
        assert_eq!(config.turn_budget(1), 6);
        assert_eq!(config.turn_budget(2), 6);
        assert_eq!(config.turn_budget(3), 9);
        assert_eq!(config.turn_budget(10), 30);
        assert_eq!(config.turn_budget(20), 40);
    }
}
