use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::core::llm::{
    Generation, GenerationRequest, LlmError, LlmProvider, ProviderKind, http_client,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Chat-completions backend. Safety thresholds have no equivalent here and
/// are ignored.
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: http_client(DEFAULT_TIMEOUT),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }
}

fn interpret(parsed: OpenAiResponse) -> Generation {
    let Some(choice) = parsed.choices.into_iter().next() else {
        return Generation::Blocked {
            finish_reason: "UNKNOWN".to_string(),
            safety_ratings: "N/A".to_string(),
        };
    };
    match choice.message.content {
        Some(text) if !text.trim().is_empty() => Generation::Text(text),
        _ => Generation::Blocked {
            finish_reason: choice
                .finish_reason
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            safety_ratings: choice.message.refusal.unwrap_or_else(|| "N/A".to_string()),
        },
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Openai
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, LlmError> {
        let req = OpenAiRequest {
            model: &request.model,
            messages: vec![OpenAiMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_output_tokens,
        };
        let res = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&req)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: res.text().await.unwrap_or_default(),
            });
        }
        let parsed: OpenAiResponse = res
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;
        Ok(interpret(parsed))
    }
}
