pub mod providers;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::core::chunker::{HeuristicTokenCounter, TokenCounter};
use crate::core::config::LlmConfig;
use crate::core::retry::Retryable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    Openai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyThreshold {
    /// Ask the service not to filter anything.
    BlockNone,
    ProviderDefault,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub safety: SafetyThreshold,
    pub max_output_tokens: u32,
}

/// What came back from one generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum Generation {
    Text(String),
    /// No usable content: filtered, blocked, or cut off before any text.
    Blocked {
        finish_reason: String,
        safety_ratings: String,
    },
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {message}")]
    Transport { message: String, transient: bool },
    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed to decode LLM response: {0}")]
    Decode(String),
    #[error("no API key configured (set {0})")]
    MissingApiKey(String),
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport { transient, .. } => *transient,
            LlmError::Api { status, message } => {
                *status == 429
                    || *status == 503
                    || message.contains("RESOURCE_EXHAUSTED")
                    || message.contains("UNAVAILABLE")
            }
            LlmError::Decode(_) | LlmError::MissingApiKey(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        // Request URLs can carry credentials; never let them into the message.
        let e = e.without_url();
        LlmError::Transport {
            transient: e.is_timeout() || e.is_connect(),
            message: e.to_string(),
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, LlmError>;

    fn token_counter(&self) -> &dyn TokenCounter {
        &HeuristicTokenCounter
    }
}

pub fn build_provider(config: &LlmConfig, api_key: String) -> Arc<dyn LlmProvider> {
    info!("Using LLM provider {:?} ({})", config.provider, config.model);
    let timeout = Duration::from_secs(config.request_timeout_secs);
    match config.provider {
        ProviderKind::Gemini => Arc::new(
            providers::gemini::GeminiProvider::new(api_key, config.base_url.clone())
                .with_timeout(timeout),
        ),
        ProviderKind::Openai => Arc::new(
            providers::openai::OpenAiProvider::new(api_key, config.base_url.clone())
                .with_timeout(timeout),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_are_retryable() {
        let quota = LlmError::Api {
            status: 429,
            message: "quota".into(),
        };
        let exhausted = LlmError::Api {
            status: 400,
            message: "RESOURCE_EXHAUSTED".into(),
        };
        let bad = LlmError::Api {
            status: 400,
            message: "invalid argument".into(),
        };
        assert!(quota.is_retryable());
        assert!(exhausted.is_retryable());
        assert!(!bad.is_retryable());
        assert!(!LlmError::Decode("x".into()).is_retryable());
    }
}
