use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::core::auth::AuthStrategy;
use crate::core::fetch::{HttpMethod, PaginationConfig, ResponseShape};

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn default_auth_strategy() -> AuthStrategy {
    AuthStrategy::Gcp
}

fn default_time_unit() -> String {
    "DAY".to_string()
}

fn default_time_value() -> u32 {
    1
}

/// How an audit's data is obtained and post-processed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditKind {
    #[default]
    Api,
    /// Executes a dashboard query; the columnar result is turned into CSV
    /// before summarization.
    DashboardQuery {
        query: String,
        #[serde(default = "default_time_unit")]
        time_unit: String,
        #[serde(default = "default_time_value")]
        time_value: u32,
    },
    /// Reads the project IAM policy and keeps only the listed roles. An empty
    /// list means the built-in SecOps role set.
    IamRoleBindings {
        #[serde(default)]
        roles: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDefinition {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default, alias = "api_path")]
    pub path_template: String,
    #[serde(default = "default_auth_strategy", alias = "auth_method")]
    pub auth_strategy: AuthStrategy,
    #[serde(default)]
    pub pagination_request_token_key: Option<String>,
    #[serde(default, alias = "pagination_token_key")]
    pub pagination_response_token_key: Option<String>,
    #[serde(default)]
    pub pagination_results_key: Option<String>,
    #[serde(default, alias = "default_page_size")]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub response_shape: ResponseShape,
    /// Field unwrapped from the stored payload before summarization.
    #[serde(default)]
    pub response_key: Option<String>,
    #[serde(default, alias = "json_data")]
    pub json_body: Option<Value>,
    #[serde(default)]
    pub kind: AuditKind,
}

impl AuditDefinition {
    pub fn pagination(&self) -> PaginationConfig {
        PaginationConfig {
            request_token_key: self.pagination_request_token_key.clone(),
            response_token_key: self.pagination_response_token_key.clone(),
            results_key: self.pagination_results_key.clone(),
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditPrompt {
    pub audit_name: String,
    pub prompt_text: String,
    pub excluded_fields: Vec<String>,
}

/// A saved cross-audit question: one prompt over the latest runs of several
/// audits at once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insight {
    pub id: i64,
    pub title: String,
    pub prompt: String,
    pub excluded_fields: Vec<String>,
    pub audit_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInsight {
    pub title: String,
    pub prompt: String,
    pub excluded_fields: Vec<String>,
    pub audit_sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "Success",
            RunStatus::Failed => "Failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(RunStatus::Success),
            "Failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRunRecord {
    pub id: i64,
    pub tenant_id: String,
    pub audit_name: String,
    pub category: String,
    pub run_timestamp: DateTime<Utc>,
    pub status: RunStatus,
    /// Pretty-printed JSON result, or `{"error": ...}` for failed runs.
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    RunAudits,
    BuildReport,
    BuildDiffReport,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RunAudits => "run-audits",
            JobKind::BuildReport => "build-report",
            JobKind::BuildDiffReport => "build-diff-report",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "run-audits" => Ok(JobKind::RunAudits),
            "build-report" => Ok(JobKind::BuildReport),
            "build-diff-report" => Ok(JobKind::BuildDiffReport),
            other => Err(format!(
                "unknown job kind '{}' (expected run-audits, build-report or build-diff-report)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleJob {
    pub id: i64,
    pub tenant_id: String,
    pub cron: String,
    pub enabled: bool,
    pub kind: JobKind,
    pub audit_names: Vec<String>,
    /// Last time the ticker claimed this job. Never moves backwards.
    pub last_triggered: Option<DateTime<Utc>>,
    pub name_template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub tenant_id: String,
    pub cron: String,
    pub kind: JobKind,
    pub audit_names: Vec<String>,
    pub name_template: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRecord {
    pub id: i64,
    pub tenant_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub content: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Folder {
    pub id: i64,
    pub name: String,
    pub parent_folder_id: Option<i64>,
    pub organization_id: Option<i64>,
}

/// Connection details for one tenant. Secrets live in the vault.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub name: String,
    pub folder_id: Option<i64>,
    pub region: Option<String>,
    pub customer_id: Option<String>,
    pub soar_url: Option<String>,
    pub bindplane_url: Option<String>,
}

/// Tenant → folders (nearest first) → organization.
#[derive(Debug, Clone, Serialize)]
pub struct TenantLineage {
    pub tenant: TenantConfig,
    pub folders: Vec<Folder>,
    pub organization: Option<Organization>,
    /// Set when a folder loop was detected and the walk stopped early.
    pub cycle_detected: bool,
}
