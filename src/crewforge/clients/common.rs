//! Shared utilities used across provider client implementations.
//!
//! The helpers in this module capture everything the OpenAI-compatible HTTP
//! surface has in common: a tuned [`reqwest`] client, the chat-completions
//! wire codec, normalization of provider failures into [`LlmError`], and the
//! SSE parsing used for streaming responses.  Individual provider wrappers
//! ([`OpenAIClient`](crate::clients::openai::OpenAIClient),
//! [`AnthropicClient`](crate::clients::anthropic::AnthropicClient),
//! [`LocalClient`](crate::clients::local::LocalClient)) stay thin by
//! delegating here.
//!
//! None of these helpers retry: retry policy belongs to the engine so it is
//! uniform across providers.

use crate::crewforge::client_wrapper::{
    CancelToken, Completion, CompletionOptions, LlmError, LlmErrorKind, Message, MessageChunk,
    MessageChunkStream, Role, TokenUsage,
};
use futures_util::StreamExt;
use lazy_static::lazy_static;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm,
    /// which significantly reduces latency when many concurrent workflows
    /// issue requests to upstream providers.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
///
/// The returned reference can be cloned and reused by individual client
/// wrappers.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Serialize messages and options into an OpenAI-compatible request body.
fn build_request_body(
    model: &str,
    messages: &[Message],
    options: &CompletionOptions,
    stream: bool,
) -> serde_json::Value {
    let wire_messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|msg| {
            serde_json::json!({
                "role": msg.role.as_str(),
                "content": msg.content.as_ref(),
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": wire_messages,
    });
    if let Some(temperature) = options.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(max_tokens) = options.max_output_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if stream {
        body["stream"] = serde_json::json!(true);
    }
    body
}

/// Map a non-success HTTP status plus response body to the normalized taxonomy.
///
/// 429 responses are split: a body mentioning exhausted quota or billing maps
/// to [`LlmErrorKind::QuotaExhausted`] (not retryable), everything else is a
/// plain rate limit carrying the `Retry-After` hint when present.
pub fn classify_http_failure(
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> LlmError {
    let detail = extract_error_message(body);
    match status.as_u16() {
        401 | 403 => LlmError::new(
            LlmErrorKind::AuthError,
            format!("HTTP {}: {}", status.as_u16(), detail),
        ),
        429 => {
            let lowered = body.to_ascii_lowercase();
            if lowered.contains("insufficient_quota")
                || lowered.contains("quota")
                || lowered.contains("billing")
            {
                LlmError::new(
                    LlmErrorKind::QuotaExhausted,
                    format!("HTTP 429: {}", detail),
                )
            } else {
                LlmError {
                    kind: LlmErrorKind::RateLimit,
                    message: format!("HTTP 429: {}", detail),
                    retry_after,
                }
            }
        }
        500..=599 => LlmError::new(
            LlmErrorKind::ServerError,
            format!("HTTP {}: {}", status.as_u16(), detail),
        ),
        _ => LlmError::new(
            LlmErrorKind::MalformedResponse,
            format!("unexpected HTTP {}: {}", status.as_u16(), detail),
        ),
    }
}

/// Pull the `error.message` field out of a JSON error body, falling back to a
/// bounded slice of the raw text.
fn extract_error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = parsed
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }
    let mut truncated: String = body.chars().take(200).collect();
    if truncated.is_empty() {
        truncated.push_str("(empty body)");
    }
    truncated
}

/// Parse the integer-seconds form of a `Retry-After` header.
fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// POST the body and await the response, racing against the cancellation
/// token when one is supplied.  Non-success statuses are classified; success
/// returns the live [`reqwest::Response`] for the caller to consume.
async fn dispatch(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    body: &serde_json::Value,
    cancel: Option<CancelToken>,
) -> Result<reqwest::Response, LlmError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

    let mut request = http
        .post(&url)
        .header("Content-Type", "application/json")
        .json(body);
    if !api_key.is_empty() {
        request = request.header("Authorization", format!("Bearer {}", api_key));
    }

    let send = request.send();
    let resp = match cancel {
        Some(token) => {
            tokio::select! {
                resp = send => resp,
                _ = token.cancelled() => {
                    return Err(LlmError::new(LlmErrorKind::Cancelled, "request cancelled"));
                }
            }
        }
        None => send.await,
    };

    let resp = resp.map_err(|e| {
        if log::log_enabled!(log::Level::Error) {
            log::error!("crewforge::clients::common::dispatch({}): {}", url, e);
        }
        LlmError::new(LlmErrorKind::Transport, e.to_string())
    })?;

    let status = resp.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(&resp);
        let text = resp.text().await.unwrap_or_default();
        return Err(classify_http_failure(status, retry_after, &text));
    }
    Ok(resp)
}

/// Send a chat completion request and surface the assistant content plus
/// token usage.
///
/// This captures the request/response logic shared by every OpenAI-compatible
/// endpoint the registry knows about (OpenAI, Anthropic's compatibility
/// surface, locally served models).
pub async fn send_chat_request(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    messages: &[Message],
    options: &CompletionOptions,
) -> Result<Completion, LlmError> {
    let body = build_request_body(model, messages, options, false);
    let resp = dispatch(http, base_url, api_key, &body, options.cancel.clone()).await?;

    let text = resp
        .text()
        .await
        .map_err(|e| LlmError::new(LlmErrorKind::Transport, e.to_string()))?;
    let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        LlmError::new(
            LlmErrorKind::MalformedResponse,
            format!("response was not JSON: {}", e),
        )
    })?;

    let content = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            LlmError::new(
                LlmErrorKind::MalformedResponse,
                "no assistant content in response",
            )
        })?;

    let usage = parsed.get("usage").map(|u| {
        let input = u
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let output = u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        }
    });

    Ok(Completion {
        message: Message {
            role: Role::Assistant,
            content: Arc::from(content),
        },
        usage,
    })
}

/// Send a streaming chat completion request.
///
/// The returned stream yields one [`MessageChunk`] per SSE delta and ends
/// after the provider's `[DONE]` sentinel.  Cancelling the token mid-stream
/// surfaces [`LlmErrorKind::Cancelled`] as the final item.
pub async fn send_chat_stream(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    messages: &[Message],
    options: &CompletionOptions,
) -> Result<MessageChunkStream, LlmError> {
    let body = build_request_body(model, messages, options, true);
    let resp = dispatch(http, base_url, api_key, &body, options.cancel.clone()).await?;

    let cancel = options.cancel.clone();
    let bytes = resp.bytes_stream();
    let state = (
        Box::pin(bytes),
        String::new(),
        VecDeque::<MessageChunk>::new(),
        false,
        cancel,
    );

    let stream = futures_util::stream::try_unfold(
        state,
        |(mut bytes, mut buf, mut pending, mut done, cancel)| async move {
            loop {
                if let Some(chunk) = pending.pop_front() {
                    return Ok(Some((chunk, (bytes, buf, pending, done, cancel))));
                }
                if done {
                    return Ok(None);
                }

                let next = match &cancel {
                    Some(token) => {
                        tokio::select! {
                            item = bytes.next() => item,
                            _ = token.cancelled() => {
                                return Err(LlmError::new(
                                    LlmErrorKind::Cancelled,
                                    "stream cancelled",
                                ));
                            }
                        }
                    }
                    None => bytes.next().await,
                };

                match next {
                    None => done = true,
                    Some(Err(e)) => {
                        return Err(LlmError::new(LlmErrorKind::Transport, e.to_string()));
                    }
                    Some(Ok(frame)) => {
                        buf.push_str(&String::from_utf8_lossy(&frame));
                        while let Some(pos) = buf.find('\n') {
                            let line: String =
                                buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            let data = match line.strip_prefix("data:") {
                                Some(d) => d.trim(),
                                None => continue,
                            };
                            if data == "[DONE]" {
                                done = true;
                                break;
                            }
                            if data.is_empty() {
                                continue;
                            }
                            if let Ok(event) =
                                serde_json::from_str::<serde_json::Value>(data)
                            {
                                let delta = event
                                    .get("choices")
                                    .and_then(|c| c.get(0))
                                    .and_then(|c| c.get("delta"))
                                    .and_then(|d| d.get("content"))
                                    .and_then(|c| c.as_str())
                                    .unwrap_or("")
                                    .to_string();
                                let finish_reason = event
                                    .get("choices")
                                    .and_then(|c| c.get(0))
                                    .and_then(|c| c.get("finish_reason"))
                                    .and_then(|f| f.as_str())
                                    .map(|s| s.to_string());
                                if !delta.is_empty() || finish_reason.is_some() {
                                    pending.push_back(MessageChunk {
                                        content: delta,
                                        finish_reason,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        },
    );

    Ok(Box::pin(stream))
}
