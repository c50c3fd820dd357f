pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::auth::AuthContext;
use crate::core::retry::Retryable;
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Envelope key for non-JSON bodies.
pub const RAW_RESULT_KEY: &str = "result";
/// Envelope key when several unkeyed pages were collected.
pub const PAGES_KEY: &str = "results";

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchError {
    pub status: Option<u16>,
    pub message: String,
    pub transient: bool,
}

impl FetchError {
    pub fn http(status: u16, body: &str) -> Self {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| truncate(body, 300));
        let transient =
            status == 429 || status == 503 || is_rate_limit_marker(&detail) || is_rate_limit_marker(body);
        Self {
            status: Some(status),
            message: format!("HTTP Error: {}: {}", status, detail),
            transient,
        }
    }

    pub fn network(message: String, transient: bool) -> Self {
        Self {
            status: None,
            message,
            transient,
        }
    }

    /// A 2xx payload whose `error` field reports a rate limit.
    pub fn from_payload(value: &Value) -> Option<Self> {
        let err = value.get("error")?;
        let text = match err {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if text.contains("429") || is_rate_limit_marker(&text) {
            Some(Self {
                status: Some(429),
                message: format!("rate limited: {}", truncate(&text, 300)),
                transient: true,
            })
        } else {
            None
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.transient
    }
}

fn is_rate_limit_marker(text: &str) -> bool {
    text.contains("RESOURCE_EXHAUSTED") || text.contains("UNAVAILABLE")
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseShape {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Query parameter that carries the token on follow-up requests.
    /// Defaults to `response_token_key` when unset.
    #[serde(default)]
    pub request_token_key: Option<String>,
    /// Response field holding the next-page token.
    #[serde(default)]
    pub response_token_key: Option<String>,
    /// Response field whose list is accumulated across pages.
    #[serde(default)]
    pub results_key: Option<String>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub base_url: String,
    pub path_template: String,
    /// Substituted for `{parent}` in the path template.
    pub parent: Option<String>,
    pub json_body: Option<Value>,
    pub shape: ResponseShape,
}

impl Endpoint {
    pub fn url(&self) -> String {
        let path = match &self.parent {
            Some(parent) if self.path_template.contains("{parent}") => {
                self.path_template.replace("{parent}", parent)
            }
            _ => self.path_template.clone(),
        };
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

pub struct PaginatedFetcher {
    transport: Arc<dyn HttpTransport>,
}

impl PaginatedFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    pub async fn fetch(
        &self,
        endpoint: &Endpoint,
        auth: &AuthContext,
        pagination: &PaginationConfig,
        max_pages: Option<u32>,
    ) -> Result<Value, FetchError> {
        let url = endpoint.url();
        let response_token_key = pagination.response_token_key.as_deref();
        let request_token_key = pagination
            .request_token_key
            .as_deref()
            .or(response_token_key);
        let results_key = pagination.results_key.as_deref();

        let mut items: Vec<Value> = Vec::new();
        let mut pages: Vec<Value> = Vec::new();
        let mut next_token: Option<String> = None;
        let mut page_count: u32 = 0;

        info!(
            "Fetching {} {} (pagination {})",
            endpoint.method.as_str(),
            url,
            if response_token_key.is_some() { "enabled" } else { "disabled" }
        );

        loop {
            page_count += 1;
            if let Some(max) = max_pages
                && max > 0
                && page_count > max
            {
                info!("Reached max_pages limit of {}, stopping", max);
                break;
            }

            let mut query = Vec::new();
            if let Some(size) = pagination.page_size {
                query.push(("pageSize".to_string(), size.to_string()));
            }
            if let (Some(token), Some(key)) = (&next_token, request_token_key) {
                debug!("Fetching page {} with token '{}...'", page_count, truncate(token, 10));
                query.push((key.to_string(), token.clone()));
            } else {
                debug!("Fetching page {} (no token)", page_count);
            }

            let response = self
                .transport
                .send(HttpRequest {
                    method: endpoint.method,
                    url: url.clone(),
                    query,
                    json_body: endpoint.json_body.clone(),
                    headers: auth.headers().to_vec(),
                })
                .await?;

            if !response.is_success() {
                return Err(FetchError::http(response.status, &response.body));
            }

            if response.status == 204 || response.body.trim().is_empty() {
                debug!("Empty response on page {}, stopping", page_count);
                break;
            }

            let data: Value = match serde_json::from_str(&response.body) {
                Ok(v) => v,
                Err(_) => {
                    let nothing_yet = items.is_empty() && pages.is_empty();
                    if endpoint.shape == ResponseShape::Text || nothing_yet {
                        return Ok(json!({ RAW_RESULT_KEY: response.body }));
                    }
                    debug!("Non-JSON body on page {}, stopping", page_count);
                    break;
                }
            };

            match results_key.and_then(|k| data.get(k)) {
                Some(Value::Array(page_items)) => {
                    items.extend(page_items.iter().cloned());
                    debug!(
                        "Aggregated {} results from page {} ({} total)",
                        page_items.len(),
                        page_count,
                        items.len()
                    );
                }
                Some(_) => {
                    debug!("Results key does not point to a list, returning page as-is");
                    return Ok(data);
                }
                // An error body must reach the caller's payload check intact.
                None if data.get("error").is_some() => return Ok(data),
                None if response_token_key.is_none() => return Ok(data),
                None if results_key.is_none() => pages.push(data.clone()),
                None => {}
            }

            let Some(token_key) = response_token_key else {
                break;
            };
            match data.get(token_key).and_then(Value::as_str) {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => {
                    debug!("No next page token, pagination complete");
                    break;
                }
            }
        }

        if let Some(key) = results_key {
            info!("Fetched {} items under '{}'", items.len(), key);
            let mut wrapped = Map::new();
            wrapped.insert(key.to_string(), Value::Array(items));
            return Ok(Value::Object(wrapped));
        }

        if pages.len() == 1 {
            Ok(pages.remove(0))
        } else {
            Ok(json!({ PAGES_KEY: pages }))
        }
    }
}
