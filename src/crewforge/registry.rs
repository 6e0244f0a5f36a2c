//! Model registry: the single source of truth mapping public model ids to
//! providers and native model names.
//!
//! Provider selection is driven solely by the model id — the engine never
//! hardcodes a vendor.  The registry ships with a built-in snapshot covering
//! the primary cloud provider, an alternate cloud provider usable as a
//! substitute when the primary quota is exhausted, and a locally served
//! model, and can be replaced wholesale by a JSON definitions file.
//!
//! The [`ClientFactory`] trait is the seam between the registry and the
//! engine: production code wires a [`RegistryClientFactory`] carrying real
//! credentials, tests inject scripted mock factories.
//!
//! # Definitions file
//!
//! ```json
//! [
//!   { "id": "gpt-4.1-mini", "provider": "openai", "native_name": "gpt-4.1-mini" },
//!   { "id": "local-llama", "provider": "local",
//!     "native_name": "llama3.1:8b", "base_url": "http://localhost:11434/v1" }
//! ]
//! ```

use crate::crewforge::client_wrapper::{
    ClientWrapper, CompletionOptions, LlmError, LlmErrorKind,
};
use crate::crewforge::clients::anthropic::AnthropicClient;
use crate::crewforge::clients::local::LocalClient;
use crate::crewforge::clients::openai::OpenAIClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Upstream vendors the registry can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Primary cloud provider (OpenAI Chat Completions).
    OpenAi,
    /// Alternate cloud provider (Anthropic's OpenAI-compatible surface).
    Anthropic,
    /// A locally served OpenAI-compatible model (Ollama, llama.cpp, vLLM).
    Local,
}

/// One registry entry: everything needed to build a client for a model id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Public identifier clients submit in workflow requests.
    pub id: String,
    /// Which vendor serves this model.
    pub provider: Provider,
    /// The model name sent on the wire, which may differ from `id`.
    pub native_name: String,
    /// Override for the provider's API root.  Required in practice for
    /// `local` models; optional for cloud providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Default sampling temperature applied when the caller does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_temperature: Option<f32>,
    /// Default output-token cap applied when the caller does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_output_tokens: Option<u32>,
}

/// Errors raised while loading a registry definitions file.
#[derive(Debug)]
pub enum RegistryError {
    /// The file could not be read.
    Io(String),
    /// The file was read but could not be parsed.
    Parse(String),
    /// Two entries share the same model id.
    DuplicateId(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Io(msg) => write!(f, "registry file unreadable: {}", msg),
            RegistryError::Parse(msg) => write!(f, "registry file invalid: {}", msg),
            RegistryError::DuplicateId(id) => write!(f, "duplicate model id: {}", id),
        }
    }
}

impl Error for RegistryError {}

/// Immutable mapping from model id to [`ModelDefinition`].
///
/// Loaded once at startup and treated as immutable at runtime.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelDefinition>,
}

impl ModelRegistry {
    /// The built-in model snapshot used when no definitions file is supplied.
    pub fn builtin() -> Self {
        let defs = vec![
            ModelDefinition {
                id: "gpt-4.1".to_string(),
                provider: Provider::OpenAi,
                native_name: "gpt-4.1".to_string(),
                base_url: None,
                default_temperature: None,
                default_max_output_tokens: None,
            },
            ModelDefinition {
                id: "gpt-4.1-mini".to_string(),
                provider: Provider::OpenAi,
                native_name: "gpt-4.1-mini".to_string(),
                base_url: None,
                default_temperature: None,
                default_max_output_tokens: None,
            },
            ModelDefinition {
                id: "claude-sonnet-4-0".to_string(),
                provider: Provider::Anthropic,
                native_name: "claude-sonnet-4-0".to_string(),
                base_url: None,
                default_temperature: None,
                default_max_output_tokens: None,
            },
            ModelDefinition {
                id: "claude-haiku-3-5".to_string(),
                provider: Provider::Anthropic,
                native_name: "claude-3-5-haiku-latest".to_string(),
                base_url: None,
                default_temperature: None,
                default_max_output_tokens: None,
            },
            ModelDefinition {
                id: "local-llama".to_string(),
                provider: Provider::Local,
                native_name: "llama3.1:8b".to_string(),
                base_url: Some("http://localhost:11434/v1".to_string()),
                default_temperature: None,
                default_max_output_tokens: None,
            },
        ];
        Self::from_definitions(defs).expect("built-in registry has no duplicates")
    }

    /// Build a registry from explicit definitions, rejecting duplicate ids.
    pub fn from_definitions(defs: Vec<ModelDefinition>) -> Result<Self, RegistryError> {
        let mut models = HashMap::with_capacity(defs.len());
        for def in defs {
            if models.insert(def.id.clone(), def.clone()).is_some() {
                return Err(RegistryError::DuplicateId(def.id));
            }
        }
        Ok(ModelRegistry { models })
    }

    /// Load a registry from a JSON definitions file (an array of
    /// [`ModelDefinition`] objects).
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Io(format!("{}: {}", path.display(), e)))?;
        let defs: Vec<ModelDefinition> =
            serde_json::from_str(&raw).map_err(|e| RegistryError::Parse(e.to_string()))?;
        Self::from_definitions(defs)
    }

    /// Whether `model_id` is registered.
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// Look up the definition for `model_id`.
    pub fn get(&self, model_id: &str) -> Option<&ModelDefinition> {
        self.models.get(model_id)
    }

    /// All definitions, sorted by id for stable listings.
    pub fn definitions(&self) -> Vec<&ModelDefinition> {
        let mut defs: Vec<&ModelDefinition> = self.models.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }
}

/// Per-provider API keys, whitespace-trimmed at ingestion.
#[derive(Debug, Clone, Default)]
pub struct LlmCredentials {
    /// Key for the primary cloud provider.
    pub openai_api_key: Option<String>,
    /// Key for the alternate cloud provider.
    pub anthropic_api_key: Option<String>,
    /// Optional key for locally served models that enforce auth.
    pub local_api_key: Option<String>,
}

impl LlmCredentials {
    fn key_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::OpenAi => self.openai_api_key.as_deref(),
            Provider::Anthropic => self.anthropic_api_key.as_deref(),
            Provider::Local => self.local_api_key.as_deref(),
        }
    }
}

/// The seam through which the engine obtains provider clients.
///
/// Production wires [`RegistryClientFactory`]; tests supply scripted mocks.
pub trait ClientFactory: Send + Sync {
    /// Whether the factory can serve `model_id`.  Consulted at submission
    /// time so unknown models are rejected with a 422 rather than failing a
    /// running workflow.
    fn knows_model(&self, model_id: &str) -> bool;

    /// Build (or fetch) a client for `model_id`.
    fn client_for(&self, model_id: &str) -> Result<Arc<dyn ClientWrapper>, LlmError>;

    /// Per-model default completion options.
    fn options_for(&self, _model_id: &str) -> CompletionOptions {
        CompletionOptions::default()
    }

    /// Every model id this factory can serve, sorted, for read-only
    /// listings.
    fn model_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

/// [`ClientFactory`] backed by a [`ModelRegistry`] and real credentials.
pub struct RegistryClientFactory {
    registry: ModelRegistry,
    credentials: LlmCredentials,
}

impl RegistryClientFactory {
    /// Bundle a registry with the credentials used to authenticate its
    /// providers.
    pub fn new(registry: ModelRegistry, credentials: LlmCredentials) -> Self {
        RegistryClientFactory {
            registry,
            credentials,
        }
    }

    /// Read-only view of the wrapped registry.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }
}

impl ClientFactory for RegistryClientFactory {
    fn knows_model(&self, model_id: &str) -> bool {
        self.registry.contains(model_id)
    }

    fn client_for(&self, model_id: &str) -> Result<Arc<dyn ClientWrapper>, LlmError> {
        let def = self.registry.get(model_id).ok_or_else(|| {
            LlmError::new(
                LlmErrorKind::UnknownModel,
                format!("model '{}' is not registered", model_id),
            )
        })?;

        let key = self.credentials.key_for(def.provider);
        let client: Arc<dyn ClientWrapper> = match def.provider {
            Provider::OpenAi => {
                let key = key.ok_or_else(|| missing_key_error(def.provider))?;
                match &def.base_url {
                    Some(url) => Arc::new(OpenAIClient::new_with_base_url(
                        key,
                        &def.native_name,
                        url,
                    )),
                    None => Arc::new(OpenAIClient::new_with_model_str(key, &def.native_name)),
                }
            }
            Provider::Anthropic => {
                let key = key.ok_or_else(|| missing_key_error(def.provider))?;
                match &def.base_url {
                    Some(url) => Arc::new(AnthropicClient::new_with_base_url(
                        key,
                        &def.native_name,
                        url,
                    )),
                    None => Arc::new(AnthropicClient::new_with_model_str(key, &def.native_name)),
                }
            }
            Provider::Local => {
                let base_url = def
                    .base_url
                    .as_deref()
                    .unwrap_or("http://localhost:11434/v1");
                Arc::new(LocalClient::new_with_api_key(
                    base_url,
                    &def.native_name,
                    key.unwrap_or(""),
                ))
            }
        };
        Ok(client)
    }

    fn options_for(&self, model_id: &str) -> CompletionOptions {
        let mut options = CompletionOptions::default();
        if let Some(def) = self.registry.get(model_id) {
            options.temperature = def.default_temperature;
            options.max_output_tokens = def.default_max_output_tokens;
        }
        options
    }

    fn model_ids(&self) -> Vec<String> {
        self.registry
            .definitions()
            .into_iter()
            .map(|d| d.id.clone())
            .collect()
    }
}

fn missing_key_error(provider: Provider) -> LlmError {
    LlmError::new(
        LlmErrorKind::AuthError,
        format!("no API key configured for provider {:?}", provider),
    )
}
