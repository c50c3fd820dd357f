use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::audit::{AuditRunner, ServiceUrls};
use crate::core::config::AppConfig;
use crate::core::discovery::TenantDiscovery;
use crate::core::fetch::transport::ReqwestTransport;
use crate::core::llm::{LlmError, build_provider};
use crate::core::report::ReportBuilder;
use crate::core::store::Store;
use crate::core::summarizer::{ProgressSink, Summarizer, SummarizerSettings};
use crate::core::terminal::print_info;
use crate::core::vault::LLM_API_KEY;
use crate::core::worker::PipelineHandler;
use crate::logging;
use crate::platform::{NativePlatform, Platform};

/// Everything a command needs: data directory, config and an open store.
pub(crate) struct App {
    pub data_dir: PathBuf,
    pub config: AppConfig,
    pub store: Store,
}

/// Summary progress shown in the terminal for interactive commands.
struct TerminalProgress;

impl ProgressSink for TerminalProgress {
    fn report(&self, status: &str) {
        print_info(status);
    }
}

impl App {
    /// Load config, install logging and open the store. One-shot commands
    /// keep log lines off stdout so their own output stays readable.
    pub async fn bootstrap(log_to_stdout: bool) -> Result<Self> {
        let data_dir = NativePlatform::data_dir();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(&data_dir)
                .await
                .with_context(|| format!("failed to create {}", data_dir.display()))?;
            NativePlatform::restrict_dir_permissions(&data_dir);
        }

        let config = AppConfig::load(&data_dir).await?;
        logging::init(
            logging::parse_level(&config.logging.level),
            config.log_file_path(&data_dir).as_deref(),
            !log_to_stdout,
        );

        let store = Store::open(config.database_path(&data_dir)).await?;
        Ok(Self {
            data_dir,
            config,
            store,
        })
    }

    fn service_urls(&self) -> ServiceUrls {
        ServiceUrls {
            chronicle: self.config.fetch.chronicle_url.clone(),
            resource_manager: self.config.fetch.resource_manager_url.clone(),
            asset_inventory: self.config.fetch.asset_inventory_url.clone(),
        }
    }

    fn transport(&self) -> Result<Arc<ReqwestTransport>> {
        let timeout = Duration::from_secs(self.config.fetch.request_timeout_secs);
        Ok(Arc::new(ReqwestTransport::new(timeout)?))
    }

    pub fn audit_runner(&self) -> Result<AuditRunner> {
        Ok(AuditRunner::new(
            self.store.clone(),
            self.transport()?,
            self.config.fetch_retry_policy(),
        )
        .with_service_urls(self.service_urls()))
    }

    pub fn discovery(&self) -> Result<TenantDiscovery> {
        Ok(TenantDiscovery::new(
            self.store.clone(),
            self.transport()?,
            self.config.fetch_retry_policy(),
        )
        .with_service_urls(self.service_urls()))
    }

    /// The env var named by `llm.api_key_env` wins over the vault entry.
    pub async fn llm_api_key(&self) -> Result<String> {
        let env_name = &self.config.llm.api_key_env;
        if let Ok(key) = std::env::var(env_name)
            && !key.trim().is_empty()
        {
            return Ok(key);
        }
        match self.store.vault().get_secret(LLM_API_KEY).await? {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(LlmError::MissingApiKey(format!(
                "{} or run 'vigil secret set llm <key>'",
                env_name
            ))
            .into()),
        }
    }

    pub async fn report_builder(&self, interactive: bool) -> Result<ReportBuilder> {
        let key = self.llm_api_key().await?;
        let provider = build_provider(&self.config.llm, key);
        let summarizer = Summarizer::new(
            provider,
            SummarizerSettings::from_config(&self.config.llm),
            self.config.llm_retry_policy(),
        );
        let builder = ReportBuilder::new(self.store.clone(), Arc::new(summarizer));
        Ok(if interactive {
            builder.with_progress(Arc::new(TerminalProgress))
        } else {
            builder
        })
    }

    pub async fn pipeline_handler(&self, interactive: bool) -> Result<PipelineHandler> {
        Ok(PipelineHandler::new(
            self.store.clone(),
            self.audit_runner()?,
            self.report_builder(interactive).await?,
            self.discovery()?,
        ))
    }
}
