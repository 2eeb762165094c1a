//! Configuration types for deck generation.
//!
//! Generation behaviour is controlled through [`GenerationConfig`], built via
//! its [`GenerationConfigBuilder`]. API credentials are deliberately kept out
//! of it: a [`Credentials`] value is passed explicitly with every generation
//! call, so one generator can serve several users with different keys.

use crate::error::DeckGenError;
use crate::pipeline::gateway::{RetryPolicy, OPENROUTER_CHAT_URL};
use crate::pipeline::quality::ScopeThresholds;
use crate::progress::GenerationProgressCallback;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "google/gemini-3-flash-preview";

/// Chunk budget (characters) used when a deck does not set its own.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 3500;

/// Smallest chunk budget the builder accepts.
pub const MIN_CHUNK_CHARS: usize = 200;

/// Configuration for deck generation.
///
/// Built via [`GenerationConfig::builder()`] or using
/// [`GenerationConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_deckgen::GenerationConfig;
///
/// let config = GenerationConfig::builder()
///     .model("openai/gpt-4.1-mini")
///     .max_chunk_chars(2500)
///     .max_retries(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct GenerationConfig {
    /// Model identifier sent to the completion endpoint.
    /// Default: `google/gemini-3-flash-preview`.
    pub model: String,

    /// Chat-completions URL. Default: OpenRouter.
    pub api_url: String,

    /// Sampling temperature for card generation and rewrites. Default: 0.2.
    ///
    /// Corrective JSON requests always use 0.
    pub temperature: f32,

    /// Retries after the first attempt on a transient failure. Default: 2.
    pub max_retries: u32,

    /// Base of the exponential backoff in milliseconds. Default: 1500.
    pub retry_backoff_ms: u64,

    /// Upper bound on any single retry delay in seconds. Default: 60.
    pub max_backoff_secs: u64,

    /// Per-request timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Chunk budget in characters for decks without their own. Default: 3500.
    pub max_chunk_chars: usize,

    /// Thresholds for the out-of-scope heuristic.
    pub scope: ScopeThresholds,

    /// Custom system prompt for card generation. If None, uses built-in default.
    pub system_prompt: Option<String>,

    /// Optional per-chunk progress events.
    pub progress_callback: Option<Arc<dyn GenerationProgressCallback>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_url: OPENROUTER_CHAT_URL.to_string(),
            temperature: 0.2,
            max_retries: 2,
            retry_backoff_ms: 1500,
            max_backoff_secs: 60,
            api_timeout_secs: 120,
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            scope: ScopeThresholds::default(),
            system_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .field("temperature", &self.temperature)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_chunk_chars", &self.max_chunk_chars)
            .field("scope", &self.scope)
            .field("system_prompt", &self.system_prompt.as_ref().map(|_| "<custom>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn GenerationProgressCallback>"),
            )
            .finish()
    }
}

impl GenerationConfig {
    /// Create a new builder for `GenerationConfig`.
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder {
            config: Self::default(),
        }
    }

    /// Gateway retry policy derived from the timeout and backoff settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.api_timeout_secs),
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

/// Builder for [`GenerationConfig`].
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
}

impl fmt::Debug for GenerationConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl GenerationConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_secs(mut self, secs: u64) -> Self {
        self.config.max_backoff_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_chunk_chars(mut self, n: usize) -> Self {
        self.config.max_chunk_chars = n;
        self
    }

    pub fn scope(mut self, thresholds: ScopeThresholds) -> Self {
        self.config.scope = thresholds;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: Arc<dyn GenerationProgressCallback>) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GenerationConfig, DeckGenError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(DeckGenError::InvalidConfig("Model must not be empty".into()));
        }
        if !c.api_url.starts_with("http://") && !c.api_url.starts_with("https://") {
            return Err(DeckGenError::InvalidConfig(format!(
                "API URL must be http(s), got '{}'",
                c.api_url
            )));
        }
        if c.max_chunk_chars < MIN_CHUNK_CHARS {
            return Err(DeckGenError::InvalidConfig(format!(
                "Chunk size must be ≥ {MIN_CHUNK_CHARS} characters, got {}",
                c.max_chunk_chars
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(DeckGenError::InvalidConfig("API timeout must be ≥ 1s".into()));
        }
        let s = &c.scope;
        if !(0.0..=1.0).contains(&s.long_overlap) || !(0.0..=1.0).contains(&s.token_overlap) {
            return Err(DeckGenError::InvalidConfig(
                "Scope overlap thresholds must be within 0–1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

/// API key and attribution headers for the completion endpoint.
///
/// Owned by whoever starts a generation and passed down with each call.
/// `Debug` never prints the key.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    /// Sent as `HTTP-Referer`.
    pub site_url: Option<String>,
    /// Sent as `X-Title`.
    pub app_name: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn site_url(mut self, url: impl Into<String>) -> Self {
        self.site_url = Some(url.into());
        self
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Read `OPENROUTER_API_KEY` (or `OPENROUTER_KEY`), `OPENROUTER_SITE_URL`
    /// and `OPENROUTER_APP_NAME`. A missing key yields an empty one, which the
    /// gateway rejects.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_key: var("OPENROUTER_API_KEY")
                .or_else(|| var("OPENROUTER_KEY"))
                .unwrap_or_default(),
            site_url: var("OPENROUTER_SITE_URL"),
            app_name: var("OPENROUTER_APP_NAME"),
        }
    }

    pub fn has_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &if self.has_key() { "<redacted>" } else { "<missing>" })
            .field("site_url", &self.site_url)
            .field("app_name", &self.app_name)
            .finish()
    }
}
