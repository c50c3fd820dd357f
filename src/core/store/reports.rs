use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::Store;
use super::types::{ReportRecord, fmt_ts, parse_ts};

const REPORT_COLUMNS: &str = "id, tenant_id, name, created_at, content, status";

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<ReportRecord> {
    let created: String = row.get(3)?;
    Ok(ReportRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_ts(&created)?,
        content: row.get(4)?,
        status: row.get(5)?,
    })
}

/// `# Report: <name>` block used when several reports are exported together.
pub fn render_export_section(report: &ReportRecord) -> String {
    format!(
        "# Report: {}\n**Generated On:** {}\n\n---\n\n{}\n\n",
        report.name,
        report.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.content
    )
}

impl Store {
    pub async fn insert_report(
        &self,
        tenant_id: Option<&str>,
        name: &str,
        created_at: DateTime<Utc>,
        content: &str,
        status: &str,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO reports (tenant_id, name, created_at, content, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tenant_id, name, fmt_ts(&created_at), content, status],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn get_report(&self, id: i64) -> Result<Option<ReportRecord>> {
        let db = self.db.lock().await;
        let report = db
            .query_row(
                &format!("SELECT {} FROM reports WHERE id = ?1", REPORT_COLUMNS),
                params![id],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }

    pub async fn list_reports(&self, tenant_id: Option<&str>) -> Result<Vec<ReportRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM reports WHERE (?1 IS NULL OR tenant_id = ?1)
             ORDER BY created_at DESC, id DESC",
            REPORT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![tenant_id], report_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn rename_report(&self, id: i64, name: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE reports SET name = ?1 WHERE id = ?2",
            params![name, id],
        )?;
        Ok(changed > 0)
    }

    pub async fn delete_reports(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let db = self.db.lock().await;
        let deleted = db.execute(
            &format!("DELETE FROM reports WHERE id IN ({})", placeholders),
            params_from_iter(ids.iter()),
        )?;
        Ok(deleted)
    }

    /// Concatenate the selected reports, oldest first, into one Markdown
    /// document. Unknown ids are skipped.
    pub async fn export_reports(&self, ids: &[i64]) -> Result<String> {
        if ids.is_empty() {
            return Ok(String::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM reports WHERE id IN ({}) ORDER BY created_at ASC, id ASC",
            REPORT_COLUMNS, placeholders
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), report_from_row)?;

        let mut out = String::new();
        for row in rows {
            out.push_str(&render_export_section(&row?));
        }
        Ok(out)
    }
}
