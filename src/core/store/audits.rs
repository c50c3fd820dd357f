use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::path::Path;
use tracing::info;

use super::Store;
use super::types::{AuditDefinition, AuditPrompt, AuditRunRecord, RunStatus, fmt_ts, parse_ts};

const RUN_COLUMNS: &str = "id, tenant_id, audit_name, category, run_timestamp, status, payload";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRunRecord> {
    let ts: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(AuditRunRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        audit_name: row.get(2)?,
        category: row.get(3)?,
        run_timestamp: parse_ts(&ts)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?,
        payload: row.get(6)?,
    })
}

impl Store {
    pub async fn upsert_audit_definition(&self, def: &AuditDefinition) -> Result<()> {
        let json = serde_json::to_string(def)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO audit_definitions (name, category, definition_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET category=excluded.category,
                definition_json=excluded.definition_json, updated_at=CURRENT_TIMESTAMP",
            params![def.name, def.category, json],
        )?;
        Ok(())
    }

    pub async fn get_audit_definition(&self, name: &str) -> Result<Option<AuditDefinition>> {
        let db = self.db.lock().await;
        let json: Option<String> = db
            .query_row(
                "SELECT definition_json FROM audit_definitions WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(
                serde_json::from_str(&j)
                    .with_context(|| format!("stored definition for '{}' is corrupt", name))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn list_audit_definitions(&self) -> Result<Vec<AuditDefinition>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT definition_json FROM audit_definitions ORDER BY category, name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(serde_json::from_str(&row?)?);
        }
        Ok(results)
    }

    /// Seed definitions from a JSON array file. Existing names are updated.
    pub async fn import_audit_definitions(&self, path: &Path) -> Result<usize> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let defs: Vec<AuditDefinition> = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a JSON array of audit definitions", path.display()))?;
        for def in &defs {
            self.upsert_audit_definition(def).await?;
        }
        info!("Imported {} audit definitions from {}", defs.len(), path.display());
        Ok(defs.len())
    }

    pub async fn set_prompt(&self, audit_name: &str, prompt_text: &str, excluded_fields: &[String]) -> Result<()> {
        let excluded = serde_json::to_string(excluded_fields)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO audit_prompts (audit_name, prompt_text, excluded_fields) VALUES (?1, ?2, ?3)
             ON CONFLICT(audit_name) DO UPDATE SET prompt_text=excluded.prompt_text,
                excluded_fields=excluded.excluded_fields",
            params![audit_name, prompt_text, excluded],
        )?;
        Ok(())
    }

    pub async fn get_prompt(&self, audit_name: &str) -> Result<Option<AuditPrompt>> {
        let db = self.db.lock().await;
        let row: Option<(String, String)> = db
            .query_row(
                "SELECT prompt_text, excluded_fields FROM audit_prompts WHERE audit_name = ?1",
                params![audit_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((prompt_text, excluded)) => Some(AuditPrompt {
                audit_name: audit_name.to_string(),
                prompt_text,
                excluded_fields: serde_json::from_str(&excluded).unwrap_or_default(),
            }),
            None => None,
        })
    }

    pub async fn insert_run(
        &self,
        tenant_id: &str,
        audit_name: &str,
        category: &str,
        run_timestamp: DateTime<Utc>,
        status: RunStatus,
        payload: &str,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO audit_runs (tenant_id, audit_name, category, run_timestamp, status, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tenant_id,
                audit_name,
                category,
                fmt_ts(&run_timestamp),
                status.as_str(),
                payload
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn get_run(&self, id: i64) -> Result<Option<AuditRunRecord>> {
        let db = self.db.lock().await;
        let run = db
            .query_row(
                &format!("SELECT {} FROM audit_runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Newest successful run. Same-timestamp rows fall back to insertion order.
    pub async fn latest_successful_run(&self, tenant_id: &str, audit_name: &str) -> Result<Option<AuditRunRecord>> {
        Ok(self
            .successful_runs(tenant_id, audit_name, 1)
            .await?
            .into_iter()
            .next())
    }

    /// Up to two newest successful runs, newest first.
    pub async fn last_two_successful_runs(&self, tenant_id: &str, audit_name: &str) -> Result<Vec<AuditRunRecord>> {
        self.successful_runs(tenant_id, audit_name, 2).await
    }

    async fn successful_runs(&self, tenant_id: &str, audit_name: &str, limit: u32) -> Result<Vec<AuditRunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM audit_runs
             WHERE tenant_id = ?1 AND audit_name = ?2 AND status = 'Success'
             ORDER BY run_timestamp DESC, id DESC LIMIT ?3",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![tenant_id, audit_name, limit], run_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn list_runs(
        &self,
        tenant_id: Option<&str>,
        audit_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditRunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM audit_runs
             WHERE (?1 IS NULL OR tenant_id = ?1) AND (?2 IS NULL OR audit_name = ?2)
             ORDER BY run_timestamp DESC, id DESC LIMIT ?3",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![tenant_id, audit_name, limit], run_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Delete runs older than `older_than`, optionally for one audit only.
    /// Counts first, then deletes; the two steps are not one transaction.
    pub async fn purge_runs(&self, older_than: DateTime<Utc>, audit_name: Option<&str>) -> Result<usize> {
        let cutoff = fmt_ts(&older_than);
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM audit_runs WHERE run_timestamp < ?1 AND (?2 IS NULL OR audit_name = ?2)",
            params![cutoff, audit_name],
            |row| row.get(0),
        )?;
        if count == 0 {
            return Ok(0);
        }
        let deleted = db.execute(
            "DELETE FROM audit_runs WHERE run_timestamp < ?1 AND (?2 IS NULL OR audit_name = ?2)",
            params![cutoff, audit_name],
        )?;
        info!(
            "Purged {} audit runs older than {} (counted {})",
            deleted, cutoff, count
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::types::AuditKind;

    fn ts(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn latest_successful_breaks_ties_by_id() {
        let store = Store::open_in_memory().unwrap();
        let t = ts("2026-03-01T10:00:00Z");
        store.insert_run("t1", "feeds", "Ingest", t, RunStatus::Success, "{\"v\":1}").await.unwrap();
        let second = store
            .insert_run("t1", "feeds", "Ingest", t, RunStatus::Success, "{\"v\":2}")
            .await
            .unwrap();
        store
            .insert_run("t1", "feeds", "Ingest", ts("2026-03-01T11:00:00Z"), RunStatus::Failed, "{}")
            .await
            .unwrap();

        let latest = store.latest_successful_run("t1", "feeds").await.unwrap().unwrap();
        assert_eq!(latest.id, second);
        assert_eq!(latest.payload, "{\"v\":2}");

        let two = store.last_two_successful_runs("t1", "feeds").await.unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(two[0].id, second);
        assert!(store.latest_successful_run("t2", "feeds").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_respects_cutoff_and_audit_filter() {
        let store = Store::open_in_memory().unwrap();
        let old = ts("2026-01-01T00:00:00Z");
        let new = ts("2026-06-01T00:00:00Z");
        store.insert_run("t1", "a", "c", old, RunStatus::Success, "{}").await.unwrap();
        store.insert_run("t1", "b", "c", old, RunStatus::Success, "{}").await.unwrap();
        store.insert_run("t1", "a", "c", new, RunStatus::Success, "{}").await.unwrap();

        let cutoff = ts("2026-03-01T00:00:00Z");
        assert_eq!(store.purge_runs(cutoff, Some("a")).await.unwrap(), 1);
        assert_eq!(store.purge_runs(cutoff, None).await.unwrap(), 1);
        assert_eq!(store.purge_runs(cutoff, None).await.unwrap(), 0);
        assert_eq!(store.list_runs(None, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn definitions_round_trip_and_import_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audits.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "Feeds", "category": "Ingestion", "path_template": "/v1alpha/{parent}/feeds",
                 "pagination_results_key": "feeds"},
                {"name": "Chronicle IAM", "category": "IAM", "kind": {"type": "iam_role_bindings"}}
            ]"#,
        )
        .unwrap();

        assert_eq!(store.import_audit_definitions(&path).await.unwrap(), 2);
        assert_eq!(store.import_audit_definitions(&path).await.unwrap(), 2);
        let all = store.list_audit_definitions().await.unwrap();
        assert_eq!(all.len(), 2);

        let iam = store.get_audit_definition("Chronicle IAM").await.unwrap().unwrap();
        assert_eq!(iam.kind, AuditKind::IamRoleBindings { roles: vec![] });
        assert!(store.get_audit_definition("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prompts_store_exclusions() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_prompt("Feeds", "Flag disabled feeds.", &["updateTime".to_string()])
            .await
            .unwrap();
        let p = store.get_prompt("Feeds").await.unwrap().unwrap();
        assert_eq!(p.excluded_fields, vec!["updateTime"]);
        assert!(store.get_prompt("Other").await.unwrap().is_none());
    }
}
