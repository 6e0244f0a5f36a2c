//! Shared primitives for provider-agnostic LLM clients.
//!
//! The workflow engine talks to every chat-completion provider through the
//! [`ClientWrapper`] trait and the lightweight data types defined here.  The
//! trait abstracts over concrete vendor implementations while the supporting
//! structs describe chat messages, completion options, streaming chunks, and
//! token accounting.
//!
//! # Basic request/response
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
//!
//!     let completion = client
//!         .complete(
//!             &[Message {
//!                 role: Role::User,
//!                 content: Arc::from("Who are you?"),
//!             }],
//!             &CompletionOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("Assistant: {}", completion.message.content);
//!     Ok(())
//! }
//! ```
//!
//! # Error taxonomy
//!
//! Providers fail in wildly different ways; [`LlmError`] normalizes them into
//! the small set of [`LlmErrorKind`]s the engine's retry policy understands.
//! Wrappers **never retry internally** — classification happens here, policy
//! lives in the engine so it is uniform across providers.

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (the task, or another agent's routed output).
    User,
    /// An assistant authored message (model responses).
    Assistant,
}

impl Role {
    /// Wire-format tag for this role (`"system"`, `"user"`, `"assistant"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Represents a generic message to be sent to an LLM.
#[derive(Clone, Debug)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.  Stored as `Arc<str>` so transcripts can be cheaply
    /// cloned by the engine and downstream components.
    pub content: Arc<str>,
}

impl Message {
    /// Convenience constructor.
    pub fn new(role: Role, content: impl AsRef<str>) -> Self {
        Message {
            role,
            content: Arc::from(content.as_ref()),
        }
    }
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug, Default)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another usage report into this one.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A full response from a provider: the assistant message plus accounting.
#[derive(Clone, Debug)]
pub struct Completion {
    /// The assistant's reply.
    pub message: Message,
    /// Token usage for this call, if the provider reported it.
    pub usage: Option<TokenUsage>,
}

/// Represents a chunk of content in a streaming response.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    /// The incremental content delta in this chunk.  May be empty for chunks
    /// that only carry a finish reason.
    pub content: String,
    /// Optional finish reason mirroring the provider specific completion
    /// status (e.g. `"stop"`).
    pub finish_reason: Option<String>,
}

/// Type alias for a stream of message chunks compatible with `Send` executors.
pub type MessageChunkStream = Pin<Box<dyn Stream<Item = Result<MessageChunk, LlmError>> + Send>>;

/// Classification of provider failures, mirrored by the engine's retry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Connection refused, DNS failure, request body never delivered, or a
    /// per-turn deadline firing mid-call.  Retryable.
    Transport,
    /// Provider returned 429 with a rate-limit signature.  Retryable; the
    /// `retry_after` field carries the provider's `Retry-After` hint.
    RateLimit,
    /// Provider returned 5xx.  Retryable.
    ServerError,
    /// Authentication or authorization failure (401/403).  Not retryable.
    AuthError,
    /// Billing quota exhausted without a recovery hint.  Not retryable; the
    /// caller should switch to an alternate model.
    QuotaExhausted,
    /// The provider answered but the body could not be parsed into a
    /// completion.  Retried a bounded number of times.
    MalformedResponse,
    /// The requested model id is not present in the registry.  Not retryable.
    UnknownModel,
    /// The call was cancelled through its [`CancelToken`].  Not retryable.
    Cancelled,
}

impl LlmErrorKind {
    /// Stable string code used in warning events and structured errors.
    pub fn code(&self) -> &'static str {
        match self {
            LlmErrorKind::Transport => "transport_error",
            LlmErrorKind::RateLimit => "provider_rate_limit",
            LlmErrorKind::ServerError => "provider_server_error",
            LlmErrorKind::AuthError => "provider_auth_error",
            LlmErrorKind::QuotaExhausted => "provider_quota_exhausted",
            LlmErrorKind::MalformedResponse => "malformed_response",
            LlmErrorKind::UnknownModel => "unknown_model",
            LlmErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Normalized error surfaced by every [`ClientWrapper`] implementation.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// Which row of the retry table this failure falls under.
    pub kind: LlmErrorKind,
    /// Human-readable detail, safe to log (never contains credentials).
    pub message: String,
    /// Provider-supplied backoff hint, populated for rate-limit responses.
    pub retry_after: Option<Duration>,
}

impl LlmError {
    /// Build an error with no retry hint.
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        LlmError {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether the engine's retry loop may re-attempt this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::Transport
                | LlmErrorKind::RateLimit
                | LlmErrorKind::ServerError
                | LlmErrorKind::MalformedResponse
        )
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl Error for LlmError {}

/// Cooperative cancellation for in-flight LLM calls.
///
/// The engine holds the [`CancelHandle`] and hands clones of the
/// [`CancelToken`] to the adapter.  Firing the handle resolves every
/// outstanding [`CancelToken::cancelled`] future, letting wrappers abort the
/// HTTP request mid-stream.
///
/// ```rust
/// use crewforge::client_wrapper::cancel_pair;
///
/// let (handle, token) = cancel_pair();
/// assert!(!token.is_cancelled());
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// The firing side of a cancellation pair.  See [`CancelToken`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a connected `(CancelHandle, CancelToken)` pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Request cancellation.  Idempotent.
    pub fn cancel(&self) {
        // Send only fails when every token is gone, which makes it a no-op.
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// `true` once the matching handle has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the matching handle fires.  If the handle is dropped
    /// without firing, this future never resolves — callers race it against
    /// the actual work with `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Handle dropped without firing: park forever.
        std::future::pending::<()>().await;
    }
}

/// Per-call knobs accepted by [`ClientWrapper::complete`].
#[derive(Clone, Debug, Default)]
pub struct CompletionOptions {
    /// Sampling temperature in `[0, 2]`.  `None` uses the provider default.
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens.  `None` uses the provider default.
    pub max_output_tokens: Option<u32>,
    /// Cancellation token for aborting the call mid-flight.
    pub cancel: Option<CancelToken>,
}

/// Trait defining the interface to interact with various LLM services.
///
/// All implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks.  Implementations translate engine requests
/// into the provider specific wire format and normalize failures into
/// [`LlmError`]; they never retry on their own.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// The `messages` slice must include any system priming messages the
    /// caller wishes to send.
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError>;

    /// Request a streaming response from the provider.
    ///
    /// Implementors sitting in front of providers without streaming support
    /// can inherit the default implementation, which resolves to `Ok(None)`.
    /// A `Some(MessageChunkStream)` return value must yield [`MessageChunk`]s
    /// mirroring the incremental tokens supplied by the upstream service.
    async fn complete_stream(
        &self,
        _messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<Option<MessageChunkStream>, LlmError> {
        Ok(None)
    }

    /// Return the identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;
}

impl std::fmt::Debug for dyn ClientWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientWrapper")
            .field("model_name", &self.model_name())
            .finish()
    }
}
