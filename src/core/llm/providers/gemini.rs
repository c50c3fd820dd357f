use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::llm::{
    Generation, GenerationRequest, LlmError, LlmProvider, ProviderKind, SafetyThreshold,
    http_client,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    safety_settings: Vec<SafetySetting>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiResContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResContent {
    #[serde(default)]
    parts: Vec<GeminiResPart>,
}

#[derive(Deserialize)]
struct GeminiResPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Option<Value>,
}

pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl GeminiProvider {
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

fn interpret(parsed: GeminiResponse) -> Generation {
    let first = parsed.candidates.into_iter().next();
    let finish_reason = first.as_ref().and_then(|c| c.finish_reason.clone());

    let text: String = first
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .concat()
        })
        .unwrap_or_default();

    if !text.is_empty() {
        return Generation::Text(text);
    }

    let feedback = parsed.prompt_feedback;
    let finish_reason = finish_reason
        .or_else(|| feedback.as_ref().and_then(|f| f.block_reason.clone()))
        .unwrap_or_else(|| "UNKNOWN".to_string());
    let safety_ratings = feedback
        .and_then(|f| f.safety_ratings)
        .map(|r| r.to_string())
        .unwrap_or_else(|| "N/A".to_string());

    Generation::Blocked {
        finish_reason,
        safety_ratings,
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, LlmError> {
        let safety_settings = match request.safety {
            SafetyThreshold::BlockNone => HARM_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
            SafetyThreshold::ProviderDefault => Vec::new(),
        };

        let req = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![GeminiPart {
                    text: &request.prompt,
                }],
            }],
            safety_settings,
            generation_config: GenerationConfig {
                max_output_tokens: request.max_output_tokens,
            },
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            request.model
        );
        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
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
        let parsed: GeminiResponse = res
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;
        Ok(interpret(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: Value) -> Generation {
        interpret(serde_json::from_value(raw).unwrap())
    }

    #[test]
    fn text_parts_are_concatenated() {
        let out = parse(json!({
            "candidates": [{
                "content": {"parts": [{"text": "## Findings"}, {"text": "\n- ok"}]},
                "finishReason": "STOP"
            }]
        }));
        assert_eq!(out, Generation::Text("## Findings\n- ok".into()));
    }

    #[test]
    fn prompt_block_surfaces_reason_and_ratings() {
        let out = parse(json!({
            "promptFeedback": {
                "blockReason": "SAFETY",
                "safetyRatings": [{"category": "HARM_CATEGORY_HARASSMENT", "probability": "HIGH"}]
            }
        }));
        match out {
            Generation::Blocked {
                finish_reason,
                safety_ratings,
            } => {
                assert_eq!(finish_reason, "SAFETY");
                assert!(safety_ratings.contains("HARM_CATEGORY_HARASSMENT"));
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn empty_candidate_uses_finish_reason() {
        let out = parse(json!({"candidates": [{"finishReason": "MAX_TOKENS"}]}));
        assert_eq!(
            out,
            Generation::Blocked {
                finish_reason: "MAX_TOKENS".into(),
                safety_ratings: "N/A".into(),
            }
        );
    }

    #[test]
    fn request_disables_filters_and_caps_output() {
        let req = GeminiRequest {
            contents: vec![],
            safety_settings: HARM_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
            generation_config: GenerationConfig {
                max_output_tokens: 2048,
            },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(v["safetySettings"].as_array().unwrap().len(), 4);
        assert_eq!(v["safetySettings"][0]["threshold"], "BLOCK_NONE");
    }

    #[tokio::test]
    async fn transport_errors_do_not_expose_the_api_key() {
        let provider = GeminiProvider::new(
            "SECRET-KEY-123".to_string(),
            Some("http://127.0.0.1:1".to_string()),
        )
        .with_timeout(Duration::from_secs(5));
        let request = GenerationRequest {
            model: "gemini-1.5-flash".into(),
            prompt: "hello".into(),
            safety: SafetyThreshold::BlockNone,
            max_output_tokens: 16,
        };

        let err = provider.generate(&request).await.unwrap_err();
        assert!(matches!(err, LlmError::Transport { .. }), "{:?}", err);
        assert!(!err.to_string().contains("SECRET-KEY-123"), "{}", err);
        assert!(!format!("{:?}", err).contains("SECRET-KEY-123"));
    }
}
