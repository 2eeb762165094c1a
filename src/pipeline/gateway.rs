//! LLM gateway: one chat-completion call with retry and backoff.
//!
//! The rest of the pipeline only sees the [`LlmGateway`] trait, so tests and
//! alternative providers plug in without touching retry logic. The shipped
//! implementation, [`HttpGateway`], speaks the OpenAI-compatible
//! chat-completions protocol (OpenRouter by default) over `reqwest`.
//!
//! ## Retry Strategy
//!
//! Timeouts, connection failures, 5xx responses and plain 429s are transient
//! and retried up to `max_retries` times. The delay honours a `Retry-After`
//! header when the server sends one, else doubles from `backoff_base`
//! (1.5 s → 3 s → 6 s …), and is always capped at `max_backoff`.
//!
//! A 429 whose body talks about credits, quota, billing or payment is not a
//! rate limit but an empty wallet: retrying cannot help, so it fails at once,
//! as does every other 4xx.

use crate::config::Credentials;
use crate::error::{is_terminal_429, GatewayError, TERMINAL_429_MARKERS};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// OpenRouter's chat-completions endpoint.
pub const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Longest error body kept in a [`GatewayError`].
const MAX_ERROR_DETAIL: usize = 500;

// ── Request / response types ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Body of a chat-completions request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_cost: Option<f64>,
}

impl Usage {
    /// Sum two usage reports; a field is `None` only if both sides are.
    pub fn merge(self, other: Usage) -> Usage {
        fn add<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a + b),
                (a, b) => a.or(b),
            }
        }
        Usage {
            prompt_tokens: add(self.prompt_tokens, other.prompt_tokens),
            completion_tokens: add(self.completion_tokens, other.completion_tokens),
            total_cost: add(self.total_cost, other.total_cost),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    /// `choices[0].message.content`.
    pub content: String,
    pub usage: Usage,
    /// Model that actually answered, when the provider reports it.
    pub model: Option<String>,
    /// Full response body.
    pub raw: Value,
}

/// Timeout and retry knobs for one [`LlmGateway::chat`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 2,
            backoff_base: Duration::from_millis(1500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Delay before retry number `retry` (1-indexed).
pub fn backoff_delay(retry: u32, policy: &RetryPolicy, retry_after: Option<Duration>) -> Duration {
    let delay = retry_after.unwrap_or_else(|| {
        policy
            .backoff_base
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    });
    delay.min(policy.max_backoff)
}

// ── Gateway trait ────────────────────────────────────────────────────────

/// A chat-completion backend.
///
/// Implementations own their retry behaviour; callers get either a response
/// or a final [`GatewayError`].
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn chat(
        &self,
        request: &ChatRequest,
        credentials: &Credentials,
        policy: &RetryPolicy,
    ) -> Result<ChatResponse, GatewayError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────

/// [`LlmGateway`] over an OpenAI-compatible HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn openrouter() -> Self {
        Self::new(OPENROUTER_CHAT_URL)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_once(
        &self,
        request: &ChatRequest,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<ChatResponse, AttemptFailure> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&credentials.api_key)
            .timeout(timeout)
            .json(request);
        if let Some(ref site_url) = credentials.site_url {
            builder = builder.header("HTTP-Referer", site_url);
        }
        if let Some(ref app_name) = credentials.app_name {
            builder = builder.header("X-Title", app_name);
        }

        let response = builder.send().await.map_err(AttemptFailure::from_reqwest)?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(AttemptFailure::from_reqwest)?;

        if !status.is_success() {
            return Err(AttemptFailure::Status {
                status: status.as_u16(),
                code: provider_error_code(&body),
                detail: error_detail(status.as_u16(), &body),
                retry_after,
            });
        }

        parse_completion(&body).map_err(AttemptFailure::Body)
    }
}

#[async_trait]
impl LlmGateway for HttpGateway {
    async fn chat(
        &self,
        request: &ChatRequest,
        credentials: &Credentials,
        policy: &RetryPolicy,
    ) -> Result<ChatResponse, GatewayError> {
        if credentials.api_key.trim().is_empty() {
            return Err(GatewayError::MissingCredentials);
        }

        let start = Instant::now();
        let mut attempt = 0u32;
        let mut retry_after = None;

        loop {
            if attempt > 0 {
                let delay = backoff_delay(attempt, policy, retry_after.take());
                warn!(
                    "{}: retry {}/{} after {}ms",
                    request.model,
                    attempt,
                    policy.max_retries,
                    delay.as_millis()
                );
                sleep(delay).await;
            }

            match self.send_once(request, credentials, policy.timeout).await {
                Ok(response) => {
                    debug!(
                        "{}: {:?} input tokens, {:?} output tokens, {:?}",
                        request.model,
                        response.usage.prompt_tokens,
                        response.usage.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response);
                }
                Err(failure) => {
                    let attempts = attempt + 1;
                    if !failure.is_retryable() || attempt >= policy.max_retries {
                        return Err(failure.into_error(attempts));
                    }
                    warn!(
                        "{}: attempt {} failed: {}",
                        request.model,
                        attempts,
                        failure.summary()
                    );
                    retry_after = failure.retry_after();
                }
            }
            attempt += 1;
        }
    }
}

/// Why one HTTP attempt failed, before the retry decision.
#[derive(Debug)]
enum AttemptFailure {
    Timeout,
    Connection(String),
    Status {
        status: u16,
        code: Option<String>,
        detail: String,
        retry_after: Option<Duration>,
    },
    Body(GatewayError),
}

impl AttemptFailure {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AttemptFailure::Timeout
        } else {
            AttemptFailure::Connection(err.to_string())
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            AttemptFailure::Timeout | AttemptFailure::Connection(_) => true,
            AttemptFailure::Status { status, detail, .. } => {
                *status >= 500 || (*status == 429 && !is_terminal_429(detail))
            }
            AttemptFailure::Body(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            AttemptFailure::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn summary(&self) -> String {
        match self {
            AttemptFailure::Timeout => "timeout".to_string(),
            AttemptFailure::Connection(detail) => detail.clone(),
            AttemptFailure::Status { status, .. } => format!("HTTP {status}"),
            AttemptFailure::Body(err) => err.to_string(),
        }
    }

    fn into_error(self, attempts: u32) -> GatewayError {
        match self {
            AttemptFailure::Timeout => GatewayError::Timeout { attempts },
            AttemptFailure::Connection(detail) => GatewayError::Connection { detail, attempts },
            AttemptFailure::Status {
                status,
                code,
                detail,
                ..
            } => GatewayError::Http {
                status,
                code,
                detail,
                attempts,
            },
            AttemptFailure::Body(err) => err,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Extract content and usage from a successful response body.
pub fn parse_completion(body: &str) -> Result<ChatResponse, GatewayError> {
    let raw: Value = serde_json::from_str(body).map_err(|e| GatewayError::InvalidJson {
        detail: format!("{e}: {}", truncate(body, MAX_ERROR_DETAIL)),
    })?;

    let content = raw
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::MalformedResponse {
            detail: truncate(body, MAX_ERROR_DETAIL),
        })?
        .to_string();

    let usage = raw.get("usage");
    let field = |name: &str| usage.and_then(|u| u.get(name));
    let usage = Usage {
        prompt_tokens: field("prompt_tokens").and_then(Value::as_u64),
        completion_tokens: field("completion_tokens").and_then(Value::as_u64),
        total_cost: field("total_cost")
            .or_else(|| field("cost"))
            .and_then(Value::as_f64),
    };
    let model = raw.get("model").and_then(Value::as_str).map(str::to_string);

    Ok(ChatResponse {
        content,
        usage,
        model,
        raw,
    })
}

/// `error.code` from a provider error body, as a string.
fn provider_error_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.pointer("/error/code")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `Retry-After` in whole seconds. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Bounded excerpt of an error body.
///
/// For a 429 whose quota marker lies past the cut, the excerpt starts at the
/// marker instead, so the retry decision and later classification still see
/// it.
fn error_detail(status: u16, body: &str) -> String {
    let detail = truncate(body, MAX_ERROR_DETAIL);
    if status != 429 || is_terminal_429(&detail) || !is_terminal_429(body) {
        return detail;
    }
    let marker_at = body.char_indices().map(|(i, _)| i).find(|&i| {
        TERMINAL_429_MARKERS.iter().any(|m| {
            body.get(i..i + m.len())
                .is_some_and(|s| s.eq_ignore_ascii_case(m))
        })
    });
    match marker_at {
        Some(start) => format!("…{}", truncate(&body[start..], MAX_ERROR_DETAIL)),
        None => detail,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().nth(max_chars).is_some() {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(1500),
            max_backoff: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(backoff_delay(1, &policy, None), Duration::from_millis(1500));
        assert_eq!(backoff_delay(2, &policy, None), Duration::from_millis(3000));
        assert_eq!(backoff_delay(3, &policy, None), Duration::from_secs(5));
    }

    #[test]
    fn retry_after_wins_but_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(
            backoff_delay(1, &policy, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            backoff_delay(1, &policy, Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn retry_decisions() {
        let status = |status: u16, detail: &str| AttemptFailure::Status {
            status,
            code: None,
            detail: detail.into(),
            retry_after: None,
        };
        assert!(AttemptFailure::Timeout.is_retryable());
        assert!(AttemptFailure::Connection("reset".into()).is_retryable());
        assert!(status(503, "").is_retryable());
        assert!(status(429, "Rate limit exceeded").is_retryable());
        assert!(!status(429, "Insufficient credits").is_retryable());
        assert!(!status(429, "monthly quota reached").is_retryable());
        assert!(!status(400, "bad request").is_retryable());
        assert!(!status(401, "").is_retryable());
    }

    #[test]
    fn parses_completion_body() {
        let body = r#"{
            "model": "google/gemini-3-flash-preview",
            "choices": [{"message": {"role": "assistant", "content": "{\"cards\": []}"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30, "cost": 0.0004}
        }"#;
        let response = parse_completion(body).unwrap();
        assert_eq!(response.content, r#"{"cards": []}"#);
        assert_eq!(response.usage.prompt_tokens, Some(120));
        assert_eq!(response.usage.completion_tokens, Some(30));
        assert_eq!(response.usage.total_cost, Some(0.0004));
        assert_eq!(response.model.as_deref(), Some("google/gemini-3-flash-preview"));
    }

    #[test]
    fn rejects_non_json_and_missing_content() {
        assert!(matches!(
            parse_completion("<html>oops</html>"),
            Err(GatewayError::InvalidJson { .. })
        ));
        assert!(matches!(
            parse_completion(r#"{"choices": []}"#),
            Err(GatewayError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn extracts_provider_error_code() {
        assert_eq!(
            provider_error_code(r#"{"error": {"code": 402, "message": "no credits"}}"#),
            Some("402".into())
        );
        assert_eq!(
            provider_error_code(r#"{"error": {"code": "rate_limited"}}"#),
            Some("rate_limited".into())
        );
        assert_eq!(provider_error_code("not json"), None);
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn usage_merge() {
        let a = Usage {
            prompt_tokens: Some(10),
            completion_tokens: None,
            total_cost: Some(0.5),
        };
        let b = Usage {
            prompt_tokens: Some(5),
            completion_tokens: Some(3),
            total_cost: None,
        };
        let merged = a.merge(b);
        assert_eq!(merged.prompt_tokens, Some(15));
        assert_eq!(merged.completion_tokens, Some(3));
        assert_eq!(merged.total_cost, Some(0.5));
    }

    #[test]
    fn late_quota_marker_survives_truncation() {
        let body = format!(
            r#"{{"trace": "{}", "error": "Insufficient credits"}}"#,
            "x".repeat(800)
        );
        let detail = error_detail(429, &body);
        assert!(detail.starts_with("…Insufficient credits"));
        assert!(is_terminal_429(&detail));

        let failure = AttemptFailure::Status {
            status: 429,
            code: None,
            detail,
            retry_after: None,
        };
        assert!(!failure.is_retryable());

        let plain = error_detail(503, &body);
        assert_eq!(plain.chars().count(), MAX_ERROR_DETAIL + 1);
        assert!(!plain.contains("Insufficient"));
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }

    #[tokio::test]
    async fn missing_key_fails_fast() {
        let gateway = HttpGateway::new("http://127.0.0.1:9/unused");
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.2,
        };
        let err = gateway
            .chat(&request, &Credentials::new(""), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingCredentials));
    }
}
