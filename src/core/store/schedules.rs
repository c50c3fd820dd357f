use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;
use super::types::{JobKind, NewSchedule, ScheduleJob, fmt_ts, parse_ts};

const SCHEDULE_COLUMNS: &str =
    "id, tenant_id, cron, enabled, job_kind, last_triggered, name_template";

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleJob> {
    let kind: String = row.get(4)?;
    let last: Option<String> = row.get(5)?;
    Ok(ScheduleJob {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        cron: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        kind: kind.parse::<JobKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        audit_names: Vec::new(),
        last_triggered: last.as_deref().map(parse_ts).transpose()?,
        name_template: row.get(6)?,
    })
}

fn load_audit_names(db: &Connection, jobs: &mut [ScheduleJob]) -> rusqlite::Result<()> {
    let mut stmt = db.prepare(
        "SELECT audit_name FROM schedule_audits WHERE schedule_id = ?1 ORDER BY position",
    )?;
    for job in jobs.iter_mut() {
        let rows = stmt.query_map(params![job.id], |row| row.get::<_, String>(0))?;
        for name in rows {
            job.audit_names.push(name?);
        }
    }
    Ok(())
}

impl Store {
    pub async fn create_schedule(&self, new: &NewSchedule) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO schedule_jobs (tenant_id, cron, enabled, job_kind, name_template)
             VALUES (?1, ?2, 1, ?3, ?4)",
            params![new.tenant_id, new.cron, new.kind.as_str(), new.name_template],
        )?;
        let id = db.last_insert_rowid();
        for (position, audit) in new.audit_names.iter().enumerate() {
            db.execute(
                "INSERT OR IGNORE INTO schedule_audits (schedule_id, position, audit_name)
                 VALUES (?1, ?2, ?3)",
                params![id, position as i64, audit],
            )?;
        }
        Ok(id)
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Option<ScheduleJob>> {
        let db = self.db.lock().await;
        let job = db
            .query_row(
                &format!("SELECT {} FROM schedule_jobs WHERE id = ?1", SCHEDULE_COLUMNS),
                params![id],
                schedule_from_row,
            )
            .optional()?;
        match job {
            Some(job) => {
                let mut jobs = [job];
                load_audit_names(&db, &mut jobs)?;
                let [job] = jobs;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleJob>> {
        self.query_schedules("SELECT {} FROM schedule_jobs ORDER BY id").await
    }

    pub async fn list_enabled_schedules(&self) -> Result<Vec<ScheduleJob>> {
        self.query_schedules("SELECT {} FROM schedule_jobs WHERE enabled = 1 ORDER BY id")
            .await
    }

    async fn query_schedules(&self, template: &str) -> Result<Vec<ScheduleJob>> {
        let db = self.db.lock().await;
        let sql = template.replacen("{}", SCHEDULE_COLUMNS, 1);
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], schedule_from_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        drop(stmt);
        load_audit_names(&db, &mut jobs)?;
        Ok(jobs)
    }

    pub async fn set_schedule_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE schedule_jobs SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, id],
        )?;
        Ok(changed > 0)
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        db.execute("DELETE FROM schedule_audits WHERE schedule_id = ?1", params![id])?;
        let deleted = db.execute("DELETE FROM schedule_jobs WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Compare-and-set on the watermark: succeeds only if the stored value
    /// is still `observed` and `now` does not move it backwards. Exactly one
    /// of several concurrent tickers wins a given occurrence.
    pub async fn claim_schedule(
        &self,
        id: i64,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let observed = observed.as_ref().map(fmt_ts);
        let now = fmt_ts(&now);
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE schedule_jobs SET last_triggered = ?1
             WHERE id = ?2 AND enabled = 1 AND last_triggered IS ?3
               AND (last_triggered IS NULL OR last_triggered <= ?1)",
            params![now, id, observed],
        )?;
        Ok(changed == 1)
    }
}
