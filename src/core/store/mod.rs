mod audits;
mod insights;
mod reports;
mod schedules;
mod tenants;
pub mod types;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::vault::SecretsVault;
use crate::platform::{NativePlatform, Platform};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS organizations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        parent_folder_id INTEGER,
        organization_id INTEGER,
        external_id TEXT UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS tenants (
        tenant_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        folder_id INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS tenant_configs (
        tenant_id TEXT PRIMARY KEY,
        region TEXT,
        customer_id TEXT,
        soar_url TEXT,
        bindplane_url TEXT
    )",
    "CREATE TABLE IF NOT EXISTS audit_definitions (
        name TEXT PRIMARY KEY,
        category TEXT NOT NULL,
        definition_json TEXT NOT NULL,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS audit_prompts (
        audit_name TEXT PRIMARY KEY,
        prompt_text TEXT NOT NULL,
        excluded_fields TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE TABLE IF NOT EXISTS schedule_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        cron TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        job_kind TEXT NOT NULL,
        last_triggered TEXT,
        name_template TEXT
    )",
    "CREATE TABLE IF NOT EXISTS schedule_audits (
        schedule_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        audit_name TEXT NOT NULL,
        PRIMARY KEY (schedule_id, audit_name)
    )",
    "CREATE TABLE IF NOT EXISTS audit_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        audit_name TEXT NOT NULL,
        category TEXT NOT NULL,
        run_timestamp TEXT NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_runs_lookup
        ON audit_runs(tenant_id, audit_name, status, run_timestamp, id)",
    "CREATE TABLE IF NOT EXISTS reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        content TEXT NOT NULL,
        status TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS insights (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL UNIQUE,
        prompt TEXT NOT NULL,
        excluded_fields TEXT NOT NULL DEFAULT '[]',
        audit_sources TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS secrets_vault (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// SQLite-backed persistence for configuration, run history and reports.
/// Every write is a single statement committed on its own.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
            NativePlatform::restrict_dir_permissions(parent);
        }
        let db = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        migrate(&db)?;
        info!("Opened store at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Fresh, private database. Nothing touches the filesystem.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        migrate(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn vault(&self) -> SecretsVault {
        SecretsVault::new(self.db.clone())
    }
}

fn migrate(db: &Connection) -> Result<()> {
    for stmt in SCHEMA {
        db.execute(stmt, [])?;
    }
    Ok(())
}
