use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::core::chunker::chunk_by_tokens;
use crate::core::config::LlmConfig;
use crate::core::llm::{Generation, GenerationRequest, LlmError, LlmProvider, SafetyThreshold};
use crate::core::retry::RetryPolicy;

pub const NO_DATA_MESSAGE: &str =
    "No data available for this audit. The API returned an empty result.";

const MAP_INSTRUCTION: &str = "This is one part of a larger dataset. Please summarize the key findings from this specific chunk of data. Do not draw final conclusions, as you only have a partial view.";

const PARTIAL_SEPARATOR: &str = "\n\n---\n\n";

const DATA_PLACEHOLDER: &str = "[DATA_PLACEHOLDER]";

#[derive(Debug, Error)]
pub enum SummarizationError {
    #[error(
        "The response from the AI was blocked or incomplete. Finish Reason: {finish_reason}. Safety Ratings: {safety_ratings}"
    )]
    Blocked {
        label: String,
        finish_reason: String,
        safety_ratings: String,
    },
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Receives human-readable status lines while a summary is in flight.
pub trait ProgressSink: Send + Sync {
    fn report(&self, status: &str);
}

/// Progress goes to the log.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, status: &str) {
        info!("{}", status);
    }
}

#[derive(Debug, Clone)]
pub struct SummarizerSettings {
    pub model: String,
    pub max_tokens_per_chunk: usize,
    pub final_max_output_tokens: u32,
    pub map_max_output_tokens: u32,
    pub safety: SafetyThreshold,
}

impl SummarizerSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens_per_chunk: config.max_tokens_per_chunk,
            final_max_output_tokens: config.final_max_output_tokens,
            map_max_output_tokens: config.map_max_output_tokens,
            safety: if config.disable_safety_filters {
                SafetyThreshold::BlockNone
            } else {
                SafetyThreshold::ProviderDefault
            },
        }
    }
}

pub struct Summarizer {
    provider: Arc<dyn LlmProvider>,
    settings: SummarizerSettings,
    retry: RetryPolicy,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: SummarizerSettings, retry: RetryPolicy) -> Self {
        Self {
            provider,
            settings,
            retry,
        }
    }

    pub async fn summarize(
        &self,
        prompt: &str,
        data: &str,
        label: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, SummarizationError> {
        if is_empty_payload(data) {
            info!("Skipping summary for '{}': no data", label);
            return Ok(NO_DATA_MESSAGE.to_string());
        }

        let data_string = match serde_json::from_str::<Value>(data) {
            Ok(v) => serde_json::to_string_pretty(&v).unwrap_or_else(|_| data.to_string()),
            Err(_) => data.to_string(),
        };

        let counter = self.provider.token_counter();
        let now = Utc::now();
        let data_tokens = counter.count(&data_string);
        let template = build_full_prompt(prompt, DATA_PLACEHOLDER, label, now);
        let prompt_tokens = counter
            .count(&template)
            .saturating_sub(counter.count(DATA_PLACEHOLDER));
        let total = data_tokens + prompt_tokens;

        if total < self.settings.max_tokens_per_chunk {
            info!("Summarizing '{}' in a single call ({} tokens)", label, total);
            progress.report(&format!("Sending data for '{}' to the LLM...", label));
            let full = build_full_prompt(prompt, &data_string, label, now);
            return self
                .call(full, self.settings.final_max_output_tokens, label)
                .await;
        }

        info!("Data for '{}' is large ({} tokens), starting map-reduce", label, total);
        let budget = self
            .settings
            .max_tokens_per_chunk
            .saturating_sub(prompt_tokens)
            .max(1);
        let chunks = chunk_by_tokens(&data_string, counter, budget);
        info!("Split '{}' into {} chunks", label, chunks.len());

        let mut partials = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            progress.report(&format!(
                "Summarizing chunk {}/{} for '{}'...",
                i + 1,
                chunks.len(),
                label
            ));
            let part_label = format!("{} (Part {})", label, i + 1);
            let full = build_full_prompt(MAP_INSTRUCTION, chunk, &part_label, now);
            let partial = self
                .call(full, self.settings.map_max_output_tokens, &part_label)
                .await?;
            partials.push(partial);
        }

        progress.report(&format!("Creating final summary for '{}'...", label));
        let combined = partials.join(PARTIAL_SEPARATOR);
        let reduce_prompt = format!(
            "{}\n\nThe following are several partial summaries of one larger dataset. Your task is to synthesize them into a single, cohesive summary.",
            prompt
        );
        let full = build_full_prompt(&reduce_prompt, &combined, label, now);
        self.call(full, self.settings.final_max_output_tokens, label)
            .await
    }

    async fn call(
        &self,
        prompt: String,
        max_output_tokens: u32,
        label: &str,
    ) -> Result<String, SummarizationError> {
        let request = GenerationRequest {
            model: self.settings.model.clone(),
            prompt,
            safety: self.settings.safety,
            max_output_tokens,
        };
        let generation = self
            .retry
            .execute(label, || self.provider.generate(&request))
            .await?;
        match generation {
            Generation::Text(text) => Ok(text),
            Generation::Blocked {
                finish_reason,
                safety_ratings,
            } => Err(SummarizationError::Blocked {
                label: label.to_string(),
                finish_reason,
                safety_ratings,
            }),
        }
    }
}

fn is_empty_payload(data: &str) -> bool {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => true,
        Ok(Value::Array(a)) => a.is_empty(),
        Ok(Value::Object(o)) => o.is_empty(),
        Ok(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

/// Wraps `data` with the instruction, a timestamp, and a fence chosen from
/// the data's apparent format.
pub fn build_full_prompt(prompt: &str, data: &str, label: &str, now: DateTime<Utc>) -> String {
    let trimmed = data.trim();
    let first_line = trimmed.lines().next().unwrap_or("");
    let data_section = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        format!("```json\n{}\n```", data)
    } else if first_line.contains(',') {
        format!("```csv\n{}\n```", data)
    } else {
        data.to_string()
    };

    format!(
        "The current date and time is {} UTC.\n\n{}\n\nAnalyze the following data for the '{}' audit:\n\n{}",
        now.format("%Y-%m-%dT%H:%M:%S%.6f"),
        prompt,
        label,
        data_section
    )
}
