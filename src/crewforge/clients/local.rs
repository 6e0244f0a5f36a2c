//! Client wrapper for locally served models reachable over HTTP.
//!
//! Targets any server exposing the OpenAI-compatible chat endpoint — Ollama,
//! llama.cpp's server, vLLM.  Authentication is optional because local
//! servers typically run without it.
//!
//! ```rust,no_run
//! use crewforge::clients::local::LocalClient;
//!
//! // Ollama default port, no API key.
//! let client = LocalClient::new("http://localhost:11434/v1", "llama3.1:8b");
//! ```

use crate::crewforge::client_wrapper::{
    ClientWrapper, Completion, CompletionOptions, LlmError, Message, MessageChunkStream,
};
use crate::crewforge::clients::openai::OpenAIClient;
use async_trait::async_trait;

/// Client wrapper for an OpenAI-compatible model server on the local network.
pub struct LocalClient {
    delegate_client: OpenAIClient,
    model: String,
}

impl LocalClient {
    /// Create a client for the server at `base_url` with no API key.
    pub fn new(base_url: &str, model: &str) -> Self {
        Self::new_with_api_key(base_url, model, "")
    }

    /// Create a client for a local server that does expect a bearer token.
    pub fn new_with_api_key(base_url: &str, model: &str, api_key: &str) -> Self {
        LocalClient {
            delegate_client: OpenAIClient::new_with_base_url(api_key, model, base_url),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for LocalClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        self.delegate_client.complete(messages, options).await
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Option<MessageChunkStream>, LlmError> {
        self.delegate_client.complete_stream(messages, options).await
    }
}
