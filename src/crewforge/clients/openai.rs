//! OpenAI client wrapper exposing the [`ClientWrapper`] trait.
//!
//! This is the primary cloud provider and also the reference implementation
//! of the OpenAI-compatible transport: the Anthropic and local wrappers both
//! delegate to an `OpenAIClient` pointed at a different base URL.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use crewforge::client_wrapper::{ClientWrapper, CompletionOptions, Message, Role};
//! use crewforge::clients::openai::OpenAIClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let client = OpenAIClient::new_with_model_str(&key, "gpt-4.1-mini");
//!     let reply = client
//!         .complete(
//!             &[Message {
//!                 role: Role::User,
//!                 content: Arc::from("Summarize the borrow checker in one line."),
//!             }],
//!             &CompletionOptions::default(),
//!         )
//!         .await?;
//!     println!("{}", reply.message.content);
//!     Ok(())
//! }
//! ```

use crate::crewforge::client_wrapper::{
    ClientWrapper, Completion, CompletionOptions, LlmError, Message, MessageChunkStream,
};
use crate::crewforge::clients::common::{get_shared_http_client, send_chat_request, send_chat_stream};
use async_trait::async_trait;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Client wrapper for OpenAI's Chat Completions API.
pub struct OpenAIClient {
    /// Pooled HTTP client, shared across all wrappers.
    http: reqwest::Client,
    /// Bearer token.  May be empty for local servers that skip auth.
    api_key: String,
    /// Native model identifier sent on the wire.
    model: String,
    /// API root, e.g. `https://api.openai.com/v1`.
    base_url: String,
}

impl OpenAIClient {
    /// Create a client from an API key and explicit model string.
    pub fn new_with_model_str(api_key: &str, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, OPENAI_BASE_URL)
    }

    /// Create a client pointing at a custom OpenAI-compatible base URL.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        OpenAIClient {
            http: get_shared_http_client().clone(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        send_chat_request(
            &self.http,
            &self.base_url,
            &self.api_key,
            &self.model,
            messages,
            options,
        )
        .await
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Option<MessageChunkStream>, LlmError> {
        let stream = send_chat_stream(
            &self.http,
            &self.base_url,
            &self.api_key,
            &self.model,
            messages,
            options,
        )
        .await?;
        Ok(Some(stream))
    }
}
