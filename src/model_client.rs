//! C6 — `ModelProvider`: the single seam through which every outbound LLM call
//! passes, wrapped with cache lookup (C3), rate limiting (C4), and a bounded
//! retry ladder.
//!
//! `HttpModelProvider` is grounded in the donor crate's
//! `clients/common.rs::send_with_native_tools`: a raw, pooled `reqwest::Client`
//! POSTing a hand-built JSON body to `{base_url}/chat/completions` with a Bearer
//! `Authorization` header, rather than going through a vendor SDK crate — the
//! donor already does this for providers whose SDK doesn't expose a feature it
//! needs, and an OpenAI-compatible chat endpoint is the common denominator across
//! this engine's configured agents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::error::EngineError;
use crate::limiter::Limiter;

/// One message in a chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Token accounting returned alongside a completion (§4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_id: String,
    pub system_text: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// Used both as the cache fingerprint and as a dedup key against double
    /// submission (§4.6).
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Vendor-agnostic seam for a chat-completion call. Implementations own their
/// own HTTP client, auth, and wire format; everything above this trait only
/// ever deals in [`CompletionRequest`]/[`CompletionResponse`].
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EngineError>;
}

#[derive(Serialize)]
struct ChatCompletionRequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponseBody {
    choices: Vec<ChatCompletionChoice>,
    usage: Option<ChatCompletionUsage>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/// A `reqwest`-backed [`ModelProvider`] against an OpenAI-compatible
/// `/chat/completions` endpoint.
pub struct HttpModelProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpModelProvider {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpModelProvider {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EngineError> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: request.system_text,
        });
        messages.extend(request.messages);

        let body = ChatCompletionRequestBody {
            model: &request.model_id,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(request.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(if status.as_u16() == 429 {
                EngineError::Throttled {
                    retry_after: Duration::from_secs(1),
                }
            } else {
                EngineError::ProviderError(format!("provider returned {}", status))
            });
        }

        let parsed: ChatCompletionResponseBody = response
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::BadResponse("provider returned no choices".to_string()))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            text: choice.message.content,
            usage,
        })
    }
}

/// Retry ladder for transient provider/network failures (§4.6, §7): three
/// attempts total, waiting 1s/4s/12s between them.
const RETRY_BACKOFFS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(4)];
const MAX_ATTEMPTS: usize = 3;

/// Wraps a [`ModelProvider`] with cache lookup, rate-limit gating, and the
/// retry ladder every outbound call goes through (§4.6). This is the type
/// agents and the researcher actually hold — never a bare `ModelProvider`.
pub struct ModelClient {
    provider: Arc<dyn ModelProvider>,
    cache: Arc<Cache>,
    limiter: Arc<Limiter>,
    cache_ttl: Duration,
}

impl ModelClient {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        cache: Arc<Cache>,
        limiter: Arc<Limiter>,
        cache_ttl: Duration,
    ) -> Self {
        ModelClient {
            provider,
            cache,
            limiter,
            cache_ttl,
        }
    }

    /// Run a completion end-to-end: cache check, limiter gate, retried call,
    /// cache store. `requester_id` is the per-user concurrency gate key.
    pub async fn complete(
        &self,
        requester_id: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, EngineError> {
        let cache_key = request.idempotency_key.clone();
        if let Some(cached) = self.cache.get("model", &cache_key).await {
            if let Ok(response) = serde_json::from_value::<CompletionResponse>(cached) {
                return Ok(response);
            }
        }

        let cache = self.cache.clone();
        let ttl = self.cache_ttl;
        let provider = self.provider.clone();
        let limiter = self.limiter.clone();
        let requester_id = requester_id.to_string();
        let timeout = request.timeout;
        let model_id = request.model_id.clone();

        let result = self
            .cache
            .get_or_produce("model", &cache_key, ttl, move || {
                let provider = provider.clone();
                let limiter = limiter.clone();
                let request = request.clone_for_retry();
                async move {
                    let response =
                        call_with_retries(&*provider, &*limiter, &requester_id, &model_id, timeout, request)
                            .await?;
                    serde_json::to_value(&response).map_err(|e| EngineError::Internal(e.to_string()))
                }
            })
            .await;

        let _ = cache;
        result.and_then(|v| serde_json::from_value(v).map_err(|e| EngineError::Internal(e.to_string())))
    }
}

impl CompletionRequest {
    fn clone_for_retry(&self) -> CompletionRequest {
        self.clone()
    }
}

async fn call_with_retries(
    provider: &dyn ModelProvider,
    limiter: &Limiter,
    requester_id: &str,
    model_id: &str,
    timeout: Duration,
    request: CompletionRequest,
) -> Result<CompletionResponse, EngineError> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        let _slot = limiter.acquire_llm_slot(requester_id, timeout).await?;
        limiter.try_consume_token(model_id).await?;

        match provider.complete(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                limiter.refund_token(model_id).await;
                if !err.is_transient() || attempt + 1 == MAX_ATTEMPTS {
                    return Err(err);
                }
                last_err = Some(err);
                tokio::time::sleep(RETRY_BACKOFFS[attempt.min(RETRY_BACKOFFS.len() - 1)]).await;
            }
        }
    }
    Err(last_err.unwrap_or(EngineError::Internal("retry ladder exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        failures_before_success: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(EngineError::Network("connection reset".to_string()))
            } else {
                Ok(CompletionResponse {
                    text: "ok".to_string(),
                    usage: TokenUsage::default(),
                })
            }
        }
    }

    struct AlwaysFailsProvider;

    #[async_trait]
    impl ModelProvider for AlwaysFailsProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, EngineError> {
            Err(EngineError::BadRequest("nope".to_string()))
        }
    }

    fn request(key: &str) -> CompletionRequest {
        CompletionRequest {
            model_id: "gpt-test".to_string(),
            system_text: "be terse".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            temperature: 0.2,
            max_tokens: 256,
            timeout: Duration::from_secs(5),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_within_retry_ladder() {
        let provider: Arc<dyn ModelProvider> = Arc::new(FlakyProvider {
            failures_before_success: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let cache = Arc::new(Cache::new());
        let limiter = Arc::new(Limiter::new(5, 5, 60, 10.0));
        let client = ModelClient::new(provider, cache, limiter, Duration::from_secs(60));

        let response = client.complete("u1", request("k1")).await.unwrap();
        assert_eq!(response.text, "ok");
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let provider: Arc<dyn ModelProvider> = Arc::new(AlwaysFailsProvider);
        let cache = Arc::new(Cache::new());
        let limiter = Arc::new(Limiter::new(5, 5, 60, 10.0));
        let client = ModelClient::new(provider, cache, limiter, Duration::from_secs(60));

        let err = client.complete("u1", request("k2")).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn identical_idempotency_key_hits_cache_on_second_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider: Arc<dyn ModelProvider> = Arc::new(FlakyProvider {
            failures_before_success: 0,
            calls: calls.clone(),
        });
        let cache = Arc::new(Cache::new());
        let limiter = Arc::new(Limiter::new(5, 5, 60, 10.0));
        let client = ModelClient::new(provider, cache, limiter, Duration::from_secs(60));

        client.complete("u1", request("shared")).await.unwrap();
        client.complete("u1", request("shared")).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
