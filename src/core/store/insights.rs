use anyhow::{Result, bail};
use rusqlite::{OptionalExtension, Row, params};

use super::Store;
use super::types::{Insight, NewInsight};

const INSIGHT_COLUMNS: &str = "id, title, prompt, excluded_fields, audit_sources";

fn insight_from_row(row: &Row<'_>) -> rusqlite::Result<Insight> {
    let excluded: String = row.get(3)?;
    let sources: String = row.get(4)?;
    Ok(Insight {
        id: row.get(0)?,
        title: row.get(1)?,
        prompt: row.get(2)?,
        excluded_fields: serde_json::from_str(&excluded).unwrap_or_default(),
        audit_sources: serde_json::from_str(&sources).unwrap_or_default(),
    })
}

fn validate(insight: &NewInsight) -> Result<()> {
    if insight.title.trim().is_empty() {
        bail!("an insight needs a title");
    }
    if insight.prompt.trim().is_empty() {
        bail!("an insight needs a prompt");
    }
    if insight.audit_sources.is_empty() {
        bail!("an insight needs at least one audit source");
    }
    Ok(())
}

impl Store {
    /// Titles are unique; a duplicate is rejected rather than overwritten.
    pub async fn create_insight(&self, insight: &NewInsight) -> Result<i64> {
        validate(insight)?;
        let excluded = serde_json::to_string(&insight.excluded_fields)?;
        let sources = serde_json::to_string(&insight.audit_sources)?;
        let db = self.db.lock().await;
        let exists: Option<i64> = db
            .query_row(
                "SELECT id FROM insights WHERE title = ?1",
                params![insight.title],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            bail!("An insight titled '{}' already exists", insight.title);
        }
        db.execute(
            "INSERT INTO insights (title, prompt, excluded_fields, audit_sources)
             VALUES (?1, ?2, ?3, ?4)",
            params![insight.title, insight.prompt, excluded, sources],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn update_insight(&self, id: i64, insight: &NewInsight) -> Result<bool> {
        validate(insight)?;
        let excluded = serde_json::to_string(&insight.excluded_fields)?;
        let sources = serde_json::to_string(&insight.audit_sources)?;
        let db = self.db.lock().await;
        let taken: Option<i64> = db
            .query_row(
                "SELECT id FROM insights WHERE title = ?1 AND id != ?2",
                params![insight.title, id],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            bail!("An insight titled '{}' already exists", insight.title);
        }
        let changed = db.execute(
            "UPDATE insights SET title = ?1, prompt = ?2, excluded_fields = ?3, audit_sources = ?4
             WHERE id = ?5",
            params![insight.title, insight.prompt, excluded, sources, id],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_insight(&self, id: i64) -> Result<Option<Insight>> {
        let db = self.db.lock().await;
        let insight = db
            .query_row(
                &format!("SELECT {} FROM insights WHERE id = ?1", INSIGHT_COLUMNS),
                params![id],
                insight_from_row,
            )
            .optional()?;
        Ok(insight)
    }

    pub async fn list_insights(&self) -> Result<Vec<Insight>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM insights ORDER BY title",
            INSIGHT_COLUMNS
        ))?;
        let rows = stmt.query_map([], insight_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn delete_insight(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute("DELETE FROM insights WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}
