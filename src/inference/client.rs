//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to the configured model endpoint and walks
//! the fallback chain when a model is unavailable. Transient failures are
//! retried per model with bounded exponential backoff before moving on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client as HttpClient;

use super::config::{model_chain, ModelConfig, ModelsConfig, RetryPolicy};
use super::errors::InferenceError;
use super::tool_call_parser::parse_completion_response;
use super::types::{ChatCompletionRequest, ChatMessage, ModelReply, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout. Hosted models answer well inside this; anything
/// slower is treated as unavailable and retried.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ─── ModelBackend ────────────────────────────────────────────────────────────

/// Anything that can answer a chat completion.
///
/// The workflow, the equivalence oracle, and the extractor all talk to the
/// model through this trait, so tests can script replies without a server.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ModelReply, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
///
/// Holds the resolved model chain; every request starts at the active model.
pub struct InferenceClient {
    http: HttpClient,
    /// Models to try, active model first.
    chain: Vec<(String, ModelConfig)>,
    retry: RetryPolicy,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: &ModelsConfig) -> Result<Self, InferenceError> {
        let (_, active) = super::config::resolve_active_model(config)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: active.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            chain: model_chain(config),
            retry: config.retry,
        })
    }

    /// The display name of the active model.
    pub fn current_model_name(&self) -> &str {
        self.chain
            .first()
            .map(|(_, m)| m.display_name.as_str())
            .unwrap_or("")
    }

    // ─── Chat Completion ─────────────────────────────────────────────────

    /// Send a chat completion request, retrying and falling back as needed.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ModelReply, InferenceError> {
        let mut attempted = Vec::new();

        for (key, model) in &self.chain {
            attempted.push(key.clone());
            let mut attempt: u32 = 0;

            loop {
                match self.send_once(key, model, messages, tools).await {
                    Ok(reply) => return Ok(reply),
                    Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                        let delay = match &e {
                            InferenceError::RateLimited {
                                retry_after_secs: Some(secs),
                                ..
                            } => self.retry.clamp_hint(*secs),
                            _ => self.retry.delay_for(attempt),
                        };
                        tracing::warn!(
                            model = %key,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "transient model failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!(model = %key, error = %e, "model unavailable, trying next in chain");
                        break;
                    }
                    Err(InferenceError::HttpError { status: 404, body }) => {
                        // Model not deployed at this endpoint; the next one may be.
                        tracing::warn!(model = %key, body = %body, "model not found, trying next in chain");
                        break;
                    }
                    // Includes provider-side tool call parse failures, which
                    // the workflow answers with a corrective prompt.
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::error!(attempted = ?attempted, "all models unavailable");
        Err(InferenceError::AllModelsUnavailable { attempted })
    }

    /// Attempt a single request against one model.
    async fn send_once(
        &self,
        key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ModelReply, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let has_tools = tools.map(|t| !t.is_empty()).unwrap_or(false);

        let body = ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages: messages.to_vec(),
            tools: tools.filter(|_| has_tools).map(|t| t.to_vec()),
            tool_choice: has_tools.then(|| "auto".to_string()),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            stream: false,
        };

        // Log the request metadata (not the full body; it can be huge)
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "=== LLM REQUEST ==="
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(api_key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status(&url, status, retry_after, body_text));
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::ResponseError {
                reason: format!("failed to read response body: {e}"),
            })?;

        let reply = parse_completion_response(&body_text)?;
        tracing::info!(
            model = %key,
            tool_calls = reply.tool_calls.len(),
            malformed = reply.malformed_calls.len(),
            finish_reason = ?reply.finish_reason,
            "=== LLM RESPONSE ==="
        );
        Ok(reply)
    }
}

#[async_trait]
impl ModelBackend for InferenceClient {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ModelReply, InferenceError> {
        self.chat_completion(messages, tools).await
    }
}

/// Map a non-2xx status to the matching error variant.
fn classify_status(
    endpoint: &str,
    status: u16,
    retry_after_secs: Option<u64>,
    body: String,
) -> InferenceError {
    match status {
        429 => InferenceError::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after_secs,
        },
        500..=599 => InferenceError::ServerError {
            endpoint: endpoint.to_string(),
            status,
            body,
        },
        _ => InferenceError::HttpError { status, body },
    }
}

// ─── Static Response Fallback ────────────────────────────────────────────────

/// The reply shown when no model in the chain could answer.
pub fn static_fallback_response() -> ModelReply {
    ModelReply::text(
        "I'm having trouble reaching the language model right now. \
         Your answers so far are saved; please send your message again in a moment.",
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────
