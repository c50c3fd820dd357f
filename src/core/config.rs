use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::core::llm::ProviderKind;
use crate::core::retry::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "vigil.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(default = "default_model")]
    pub model: String,

    /// Overrides the provider's public endpoint (self-hosted gateways, tests).
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_tokens_per_chunk")]
    pub max_tokens_per_chunk: usize,

    #[serde(default = "default_final_max_output_tokens")]
    pub final_max_output_tokens: u32,

    #[serde(default = "default_map_max_output_tokens")]
    pub map_max_output_tokens: u32,

    #[serde(default = "default_true")]
    pub disable_safety_filters: bool,

    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Replaces the regional SecOps host.
    #[serde(default)]
    pub chronicle_url: Option<String>,

    #[serde(default)]
    pub resource_manager_url: Option<String>,

    #[serde(default)]
    pub asset_inventory_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Six-field expression for the ticker's own clock.
    #[serde(default = "default_tick_cron")]
    pub tick_cron: String,

    #[serde(default = "default_catch_up_window_secs")]
    pub catch_up_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_task_deadline_secs")]
    pub task_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_max_tokens_per_chunk() -> usize {
    900_000
}
fn default_final_max_output_tokens() -> u32 {
    8192
}
fn default_map_max_output_tokens() -> u32 {
    2048
}
fn default_true() -> bool {
    true
}
fn default_llm_retries() -> u32 {
    5
}
fn default_llm_timeout_secs() -> u64 {
    300
}
fn default_fetch_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    2000
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_tick_cron() -> String {
    "0 * * * * *".to_string()
}
fn default_catch_up_window_secs() -> u64 {
    300
}
fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    256
}
fn default_task_deadline_secs() -> u64 {
    1800
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_db_path() -> String {
    "vigil.db".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            max_tokens_per_chunk: default_max_tokens_per_chunk(),
            final_max_output_tokens: default_final_max_output_tokens(),
            map_max_output_tokens: default_map_max_output_tokens(),
            disable_safety_filters: true,
            max_retries: default_llm_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_fetch_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            chronicle_url: None,
            resource_manager_url: None,
            asset_inventory_url: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_cron: default_tick_cron(),
            catch_up_window_secs: default_catch_up_window_secs(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            task_deadline_secs: default_task_deadline_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl AppConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self, ConfigError> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE_NAME);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;
        let mut config: AppConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: config_path.clone(),
            source,
        })?;

        if config.worker.workers == 0 {
            config.worker.workers = 1;
        }
        if config.worker.queue_capacity == 0 {
            config.worker.queue_capacity = default_queue_capacity();
        }

        info!(
            "Loaded config: provider={:?}, model={}, workers={}, catch_up={}s",
            config.llm.provider,
            config.llm.model,
            config.worker.workers,
            config.scheduler.catch_up_window_secs
        );
        Ok(config)
    }

    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        resolve_relative(data_dir, &self.database.path)
    }

    pub fn log_file_path(&self, data_dir: &Path) -> Option<PathBuf> {
        self.logging
            .file
            .as_deref()
            .map(|f| resolve_relative(data_dir, f))
    }

    pub fn fetch_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch.max_retries,
            Duration::from_millis(self.fetch.retry_base_delay_ms),
        )
    }

    pub fn llm_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.llm.max_retries,
            Duration::from_millis(self.llm.retry_base_delay_ms),
        )
    }

    pub fn catch_up_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.scheduler.catch_up_window_secs as i64)
    }

    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.worker.task_deadline_secs)
    }
}

fn resolve_relative(base: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() { p } else { base.join(p) }
}
