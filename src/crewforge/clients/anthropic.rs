//! Anthropic client wrapper built on the OpenAI-compatible transport.
//!
//! The alternate cloud provider: the registry substitutes Anthropic models
//! when the primary provider's quota is exhausted.  The wrapper delegates
//! HTTP concerns to the shared OpenAI implementation, so swapping providers
//! only requires a different constructor.

use crate::crewforge::client_wrapper::{
    ClientWrapper, Completion, CompletionOptions, LlmError, Message, MessageChunkStream,
};
use crate::crewforge::clients::openai::OpenAIClient;
use async_trait::async_trait;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Client wrapper for Anthropic's API routed through its OpenAI-compatible
/// surface.
pub struct AnthropicClient {
    /// Delegated client that handles the HTTP interactions.
    delegate_client: OpenAIClient,
    /// Exposed model name.
    model: String,
}

impl AnthropicClient {
    /// Create a client from an API key and explicit model string.
    pub fn new_with_model_str(api_key: &str, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, ANTHROPIC_BASE_URL)
    }

    /// Create a client pointing at a custom Anthropic-compatible base URL.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        AnthropicClient {
            // we reuse the OpenAIClient and delegate the calls to it
            delegate_client: OpenAIClient::new_with_base_url(api_key, model, base_url),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for AnthropicClient {
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
