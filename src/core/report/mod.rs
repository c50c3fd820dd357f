pub mod columnar;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::diff::{diff_json_labeled, diff_values, is_unchanged};
use crate::core::store::Store;
use crate::core::store::types::{AuditKind, AuditRunRecord, RunStatus, fmt_ts};
use crate::core::summarizer::{LogProgress, ProgressSink, Summarizer};

pub const REPORT_STATUS_COMPLETED: &str = "Completed";

const NO_RUN_FOUND: &str = "No successful audit run found.";
const DATA_ERROR: &str = "Could not process this audit due to a data error.";
const INSUFFICIENT_HISTORY: &str =
    "*Insufficient history to generate a diff (needs at least 2 successful runs).*";
const NO_CHANGES_REPORT: &str = "## No Significant Changes Detected\n\nNo configuration changes were detected across the selected audits for this period. All systems are consistent with the previous audit run.\n\n";
const STATUS_ONLY_PREFIX: &str = "## Audit Status Summary (No Configuration Changes Detected)\n\nWhile no configuration changes were found, the following audits reported issues or insufficient history:\n\n";
const PAIR_UNCHANGED: &str = "No differences found between the two selected audit runs.";

const DIFF_GUIDANCE: &str = "Lines starting with '+' indicate additions, and lines starting with '-' indicate deletions. Please provide a concise, high-level summary of the most significant changes. Focus on what was added, removed, or modified that would be important for a security team to know. Use Markdown for formatting.";

fn default_prompt(audit_name: &str) -> String {
    format!("Summarize the key findings for the '{}' audit.", audit_name)
}

fn change_report_prompt(audit_name: &str) -> String {
    format!(
        "You are a security analyst. The following is a 'diff' report for the '{}' audit. {}",
        audit_name, DIFF_GUIDANCE
    )
}

fn pair_diff_prompt() -> String {
    format!(
        "You are a security analyst. The following is a 'diff' report showing the changes between two security audits. {} Do not simply list the changes; interpret them.",
        DIFF_GUIDANCE
    )
}

fn section(audit_name: &str, body: &str) -> String {
    format!("## {}\n\n{}\n\n", audit_name, body)
}

/// Drop every key named in `fields`, at any depth, through objects and arrays.
pub fn remove_excluded_fields(value: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return value.clone();
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !fields.iter().any(|f| f == *k))
                .map(|(k, v)| (k.clone(), remove_excluded_fields(v, fields)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| remove_excluded_fields(v, fields))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Expand `{date}` and `{time}` in a name template, or fall back to
/// `<default_prefix> - <date time>`.
pub fn render_report_name(template: Option<&str>, default_prefix: &str, now: DateTime<Utc>) -> String {
    let date = now.format("%Y-%m-%d").to_string();
    let time = now.format("%H:%M").to_string();
    match template.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => t.replace("{date}", &date).replace("{time}", &time),
        None => format!("{} - {} {}", default_prefix, date, time),
    }
}

pub struct ReportBuilder {
    store: Store,
    summarizer: Arc<Summarizer>,
    progress: Arc<dyn ProgressSink>,
}

impl ReportBuilder {
    pub fn new(store: Store, summarizer: Arc<Summarizer>) -> Self {
        Self {
            store,
            summarizer,
            progress: Arc::new(LogProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Summarize the latest successful run of each audit into one report.
    /// Returns the new report id.
    pub async fn build_report(
        &self,
        tenant_id: &str,
        audit_names: &[String],
        name_template: Option<&str>,
    ) -> Result<i64> {
        let mut content = String::new();
        for (i, audit_name) in audit_names.iter().enumerate() {
            self.progress.report(&format!(
                "Processing {} ({}/{})...",
                audit_name,
                i + 1,
                audit_names.len()
            ));
            let body = self.summarize_latest(tenant_id, audit_name).await?;
            content.push_str(&section(audit_name, &body));
        }

        self.progress.report("Finalizing report...");
        let now = Utc::now();
        let name = render_report_name(name_template, "Ad-Hoc Report", now);
        self.store_report(tenant_id, &name, now, &content).await
    }

    async fn summarize_latest(&self, tenant_id: &str, audit_name: &str) -> Result<String> {
        let Some(run) = self.store.latest_successful_run(tenant_id, audit_name).await? else {
            return Ok(NO_RUN_FOUND.to_string());
        };

        let prompt = self.store.get_prompt(audit_name).await?;
        let (prompt_text, excluded) = match prompt {
            Some(p) => (p.prompt_text, p.excluded_fields),
            None => (default_prompt(audit_name), Vec::new()),
        };
        let definition = self.store.get_audit_definition(audit_name).await?;

        let results: Value = match serde_json::from_str(&run.payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("Run {} of '{}' has an unreadable payload: {}", run.id, audit_name, e);
                return Ok(DATA_ERROR.to_string());
            }
        };

        let data = match definition.as_ref().map(|d| &d.kind) {
            Some(AuditKind::DashboardQuery { .. }) => {
                let csv = columnar::columnar_to_csv(&results)?;
                info!(
                    "Converted dashboard results for '{}' to CSV ({} -> {} bytes)",
                    audit_name,
                    run.payload.len(),
                    csv.len()
                );
                csv
            }
            _ => {
                let filtered = remove_excluded_fields(&results, &excluded);
                let response_key = definition.as_ref().and_then(|d| d.response_key.as_deref());
                let unwrapped = match response_key.and_then(|k| filtered.get(k)) {
                    Some(inner) => inner.clone(),
                    None => filtered,
                };
                serde_json::to_string_pretty(&unwrapped)?
            }
        };

        Ok(
            match self
                .summarizer
                .summarize(&prompt_text, &data, audit_name, self.progress.as_ref())
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("Summary for '{}' failed: {}", audit_name, e);
                    format!("Error generating summary: {}", e)
                }
            },
        )
    }

    /// Compare the last two successful runs of each audit and summarize the
    /// changes. Unchanged audits are left out.
    pub async fn build_diff_report(
        &self,
        tenant_id: &str,
        audit_names: &[String],
        name_template: Option<&str>,
    ) -> Result<i64> {
        let mut sections: Vec<String> = Vec::new();
        let mut changes_found = false;

        for (i, audit_name) in audit_names.iter().enumerate() {
            self.progress.report(&format!(
                "Analyzing diffs for {} ({}/{})...",
                audit_name,
                i + 1,
                audit_names.len()
            ));

            let runs = self.store.last_two_successful_runs(tenant_id, audit_name).await?;
            let [latest, previous] = runs.as_slice() else {
                sections.push(section(audit_name, INSUFFICIENT_HISTORY));
                continue;
            };

            let excluded = self
                .store
                .get_prompt(audit_name)
                .await?
                .map(|p| p.excluded_fields)
                .unwrap_or_default();
            let diff_text = diff_runs(
                previous,
                latest,
                &excluded,
                &format!("Previous Run ({})", fmt_ts(&previous.run_timestamp)),
                &format!("Latest Run ({})", fmt_ts(&latest.run_timestamp)),
            );

            if is_unchanged(&diff_text) {
                info!("No changes for '{}'", audit_name);
                continue;
            }
            changes_found = true;

            let label = format!("Diff Summary: {}", audit_name);
            let body = match self
                .summarizer
                .summarize(&change_report_prompt(audit_name), &diff_text, &label, self.progress.as_ref())
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("Diff summary for '{}' failed: {}", audit_name, e);
                    format!("Error generating diff summary: {}", e)
                }
            };
            sections.push(section(audit_name, &body));
        }

        self.progress.report("Finalizing report...");
        let content = if changes_found {
            sections.concat()
        } else if sections.is_empty() {
            NO_CHANGES_REPORT.to_string()
        } else {
            format!("{}{}", STATUS_ONLY_PREFIX, sections.concat())
        };

        let now = Utc::now();
        let name = render_report_name(name_template, "Daily Change Report", now);
        self.store_report(tenant_id, &name, now, &content).await
    }

    /// Diff two specific runs of the same audit for the same tenant. The
    /// older run is treated as the previous one regardless of argument order.
    pub async fn build_pair_diff_report(&self, run_a: i64, run_b: i64) -> Result<i64> {
        self.progress.report("Finding specified audit runs...");
        let (Some(a), Some(b)) = (self.store.get_run(run_a).await?, self.store.get_run(run_b).await?)
        else {
            bail!("One or both of the specified audit runs could not be found.");
        };
        if a.status != RunStatus::Success || b.status != RunStatus::Success {
            bail!("One or both of the selected audits were not successful runs.");
        }
        if a.tenant_id != b.tenant_id || a.audit_name != b.audit_name {
            bail!("The selected audits are not from the same tenant and for the same audit type.");
        }

        let (previous, latest) = if (a.run_timestamp, a.id) < (b.run_timestamp, b.id) {
            (a, b)
        } else {
            (b, a)
        };

        self.progress.report("Generating difference report...");
        let diff_text = diff_runs(
            &previous,
            &latest,
            &[],
            &format!("run_at_{}", fmt_ts(&previous.run_timestamp)),
            &format!("run_at_{}", fmt_ts(&latest.run_timestamp)),
        );

        let content = if is_unchanged(&diff_text) {
            PAIR_UNCHANGED.to_string()
        } else {
            self.progress.report("Summarizing changes with AI...");
            let label = format!("Diff for {}", latest.audit_name);
            match self
                .summarizer
                .summarize(&pair_diff_prompt(), &diff_text, &label, self.progress.as_ref())
                .await
            {
                Ok(summary) => summary,
                Err(e) => format!("Error generating diff summary: {}", e),
            }
        };

        self.progress.report("Finalizing report...");
        let now = Utc::now();
        let name = format!(
            "Diff Report: {} - {}",
            latest.audit_name,
            now.format("%Y-%m-%d %H:%M")
        );
        self.store_report(&latest.tenant_id, &name, now, &content).await
    }

    /// Answer a saved insight for one tenant: the latest successful run of
    /// every source audit goes into one JSON object keyed by audit name and
    /// is summarized with the insight's prompt in a single pass.
    pub async fn build_insight_report(&self, tenant_id: &str, insight_id: i64) -> Result<i64> {
        let Some(insight) = self.store.get_insight(insight_id).await? else {
            bail!("Insight {} not found", insight_id);
        };

        self.progress.report("Fetching audit data...");
        let mut combined = Map::new();
        for audit_name in &insight.audit_sources {
            let entry = match self.store.latest_successful_run(tenant_id, audit_name).await? {
                Some(run) => match serde_json::from_str::<Value>(&run.payload) {
                    Ok(results) => remove_excluded_fields(&results, &insight.excluded_fields),
                    Err(e) => {
                        warn!("Run {} of '{}' has an unreadable payload: {}", run.id, audit_name, e);
                        Value::String(DATA_ERROR.to_string())
                    }
                },
                None => Value::String(NO_RUN_FOUND.to_string()),
            };
            combined.insert(audit_name.clone(), entry);
        }

        self.progress.report("Generating AI summary...");
        let data = serde_json::to_string_pretty(&Value::Object(combined))?;
        let content = match self
            .summarizer
            .summarize(&insight.prompt, &data, &insight.title, self.progress.as_ref())
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Insight '{}' summary failed: {}", insight.title, e);
                format!("Error generating summary: {}", e)
            }
        };

        self.progress.report("Finalizing report...");
        let now = Utc::now();
        let name = format!(
            "Insight Report: {} - {}",
            insight.title,
            now.format("%Y-%m-%d %H:%M")
        );
        self.store_report(tenant_id, &name, now, &content).await
    }

    async fn store_report(&self, tenant_id: &str, name: &str, now: DateTime<Utc>, content: &str) -> Result<i64> {
        let id = self
            .store
            .insert_report(Some(tenant_id), name, now, content, REPORT_STATUS_COMPLETED)
            .await?;
        info!("Stored report {} '{}' ({} bytes)", id, name, content.len());
        Ok(id)
    }
}

/// Unified diff of two stored payloads with exclusions applied to both.
fn diff_runs(previous: &AuditRunRecord, latest: &AuditRunRecord, excluded: &[String], from: &str, to: &str) -> String {
    let parsed = serde_json::from_str::<Value>(&previous.payload)
        .and_then(|p| serde_json::from_str::<Value>(&latest.payload).map(|l| (p, l)));
    match parsed {
        Ok((p, l)) => diff_values(
            &remove_excluded_fields(&p, excluded),
            &remove_excluded_fields(&l, excluded),
            from,
            to,
        ),
        Err(_) => diff_json_labeled(&previous.payload, &latest.payload, from, to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{Generation, GenerationRequest, LlmError, LlmProvider, ProviderKind, SafetyThreshold};
    use crate::core::retry::RetryPolicy;
    use crate::core::store::types::{AuditDefinition, NewInsight};
    use crate::core::summarizer::{NO_DATA_MESSAGE, SummarizerSettings};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Echoes a fixed summary and keeps every prompt it was sent.
    #[derive(Default)]
    struct EchoProvider {
        prompts: Mutex<Vec<String>>,
        blocked: bool,
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gemini
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<Generation, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if self.blocked {
                return Ok(Generation::Blocked {
                    finish_reason: "SAFETY".into(),
                    safety_ratings: "N/A".into(),
                });
            }
            Ok(Generation::Text("LLM summary".into()))
        }
    }

    fn builder(store: &Store, provider: Arc<EchoProvider>) -> ReportBuilder {
        let settings = SummarizerSettings {
            model: "test".into(),
            max_tokens_per_chunk: 100_000,
            final_max_output_tokens: 512,
            map_max_output_tokens: 128,
            safety: SafetyThreshold::BlockNone,
        };
        let summarizer = Summarizer::new(provider, settings, RetryPolicy::immediate(0));
        ReportBuilder::new(store.clone(), Arc::new(summarizer))
    }

    async fn add_run(store: &Store, audit: &str, ts: &str, payload: Value) -> i64 {
        store
            .insert_run(
                "t1",
                audit,
                "Cat",
                ts.parse().unwrap(),
                RunStatus::Success,
                &serde_json::to_string_pretty(&payload).unwrap(),
            )
            .await
            .unwrap()
    }

    #[test]
    fn exclusions_apply_at_every_depth() {
        let value = json!({
            "id": 1,
            "etag": "x",
            "items": [{"etag": "y", "name": "a", "nested": {"etag": "z", "keep": true}}]
        });
        let out = remove_excluded_fields(&value, &["etag".to_string()]);
        assert_eq!(
            out,
            json!({"id": 1, "items": [{"name": "a", "nested": {"keep": true}}]})
        );
    }

    #[test]
    fn report_names_expand_placeholders() {
        let now: DateTime<Utc> = "2026-03-04T05:06:07Z".parse().unwrap();
        assert_eq!(
            render_report_name(Some("Nightly {date} at {time}"), "Ad-Hoc Report", now),
            "Nightly 2026-03-04 at 05:06"
        );
        assert_eq!(
            render_report_name(None, "Ad-Hoc Report", now),
            "Ad-Hoc Report - 2026-03-04 05:06"
        );
        assert_eq!(
            render_report_name(Some("  "), "Daily Change Report", now),
            "Daily Change Report - 2026-03-04 05:06"
        );
    }

    #[tokio::test]
    async fn summary_report_has_one_section_per_audit() {
        let store = Store::open_in_memory().unwrap();
        add_run(&store, "Feeds", "2026-03-01T00:00:00Z", json!({"feeds": [{"id": 1, "secret": "s"}]})).await;
        add_run(&store, "Empty", "2026-03-01T00:00:00Z", json!({})).await;
        store
            .set_prompt("Feeds", "List feeds.", &["secret".to_string()])
            .await
            .unwrap();

        let provider = Arc::new(EchoProvider::default());
        let names = vec!["Feeds".to_string(), "Empty".to_string(), "Missing".to_string()];
        let id = builder(&store, provider.clone())
            .build_report("t1", &names, Some("Weekly {date}"))
            .await
            .unwrap();

        let report = store.get_report(id).await.unwrap().unwrap();
        assert!(report.name.starts_with("Weekly 20"));
        assert_eq!(report.status, "Completed");
        assert_eq!(
            report.content,
            format!(
                "## Feeds\n\nLLM summary\n\n## Empty\n\n{}\n\n## Missing\n\nNo successful audit run found.\n\n",
                NO_DATA_MESSAGE
            )
        );

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("List feeds."));
        assert!(!prompts[0].contains("secret"));
    }

    #[tokio::test]
    async fn dashboard_audits_are_summarized_as_csv() {
        let store = Store::open_in_memory().unwrap();
        let def: AuditDefinition = serde_json::from_value(json!({
            "name": "Top Users",
            "category": "Usage",
            "kind": {"type": "dashboard_query", "query": "q"}
        }))
        .unwrap();
        store.upsert_audit_definition(&def).await.unwrap();
        add_run(
            &store,
            "Top Users",
            "2026-03-01T00:00:00Z",
            json!({"results": [
                {"column": "user", "values": [{"value": {"stringVal": "alice"}}]},
                {"column": "total", "values": [{"value": {"int64Val": "3"}}]}
            ]}),
        )
        .await;

        let provider = Arc::new(EchoProvider::default());
        builder(&store, provider.clone())
            .build_report("t1", &["Top Users".to_string()], None)
            .await
            .unwrap();
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("```csv\nuser,total\nalice,3\n"));
    }

    #[tokio::test]
    async fn blocked_summary_becomes_report_text() {
        let store = Store::open_in_memory().unwrap();
        add_run(&store, "Feeds", "2026-03-01T00:00:00Z", json!({"feeds": [1]})).await;
        let provider = Arc::new(EchoProvider {
            blocked: true,
            ..Default::default()
        });
        let id = builder(&store, provider)
            .build_report("t1", &["Feeds".to_string()], None)
            .await
            .unwrap();
        let report = store.get_report(id).await.unwrap().unwrap();
        assert!(report.content.contains("Error generating summary: The response from the AI was blocked"));
        assert!(report.name.starts_with("Ad-Hoc Report - "));
    }

    #[tokio::test]
    async fn diff_report_without_changes_uses_fixed_body() {
        let store = Store::open_in_memory().unwrap();
        add_run(&store, "Feeds", "2026-03-01T00:00:00Z", json!({"a": 1, "b": 2})).await;
        add_run(&store, "Feeds", "2026-03-02T00:00:00Z", json!({"b": 2, "a": 1})).await;

        let provider = Arc::new(EchoProvider::default());
        let id = builder(&store, provider.clone())
            .build_diff_report("t1", &["Feeds".to_string()], None)
            .await
            .unwrap();
        let report = store.get_report(id).await.unwrap().unwrap();
        assert_eq!(report.content, NO_CHANGES_REPORT);
        assert!(report.name.starts_with("Daily Change Report - "));
        assert!(provider.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn diff_report_notes_only_get_status_prefix() {
        let store = Store::open_in_memory().unwrap();
        add_run(&store, "Feeds", "2026-03-01T00:00:00Z", json!({"a": 1})).await;

        let id = builder(&store, Arc::new(EchoProvider::default()))
            .build_diff_report("t1", &["Feeds".to_string()], None)
            .await
            .unwrap();
        let report = store.get_report(id).await.unwrap().unwrap();
        assert!(report.content.starts_with(STATUS_ONLY_PREFIX));
        assert!(report.content.contains("## Feeds\n\n*Insufficient history"));
    }

    #[tokio::test]
    async fn diff_report_summarizes_changes_after_exclusions() {
        let store = Store::open_in_memory().unwrap();
        add_run(&store, "Feeds", "2026-03-01T00:00:00Z", json!({"feeds": ["a"], "etag": "1"})).await;
        add_run(&store, "Feeds", "2026-03-02T00:00:00Z", json!({"feeds": ["a", "b"], "etag": "2"})).await;
        add_run(&store, "Rules", "2026-03-01T00:00:00Z", json!({"etag": "1"})).await;
        add_run(&store, "Rules", "2026-03-02T00:00:00Z", json!({"etag": "2"})).await;
        store.set_prompt("Rules", "p", &["etag".to_string()]).await.unwrap();

        let provider = Arc::new(EchoProvider::default());
        let names = vec!["Feeds".to_string(), "Rules".to_string()];
        let id = builder(&store, provider.clone())
            .build_diff_report("t1", &names, Some("Changes {date}"))
            .await
            .unwrap();
        let report = store.get_report(id).await.unwrap().unwrap();
        assert_eq!(report.content, "## Feeds\n\nLLM summary\n\n");

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("You are a security analyst."));
        assert!(prompts[0].contains("Previous Run (2026-03-01T00:00:00.000000Z)"));
        assert!(prompts[0].contains("+    \"b\""));
    }

    #[tokio::test]
    async fn pair_diff_validates_and_orders_runs() {
        let store = Store::open_in_memory().unwrap();
        let old = add_run(&store, "Feeds", "2026-03-01T00:00:00Z", json!({"feeds": ["a"]})).await;
        let new = add_run(&store, "Feeds", "2026-03-02T00:00:00Z", json!({"feeds": ["b"]})).await;
        let other = add_run(&store, "Rules", "2026-03-02T00:00:00Z", json!({})).await;
        let failed = store
            .insert_run("t1", "Feeds", "Cat", Utc::now(), RunStatus::Failed, "{}")
            .await
            .unwrap();

        let provider = Arc::new(EchoProvider::default());
        let b = builder(&store, provider.clone());

        let err = b.build_pair_diff_report(old, 999).await.unwrap_err();
        assert!(err.to_string().contains("could not be found"));
        let err = b.build_pair_diff_report(old, failed).await.unwrap_err();
        assert!(err.to_string().contains("not successful"));
        let err = b.build_pair_diff_report(old, other).await.unwrap_err();
        assert!(err.to_string().contains("same tenant"));

        let id = b.build_pair_diff_report(new, old).await.unwrap();
        let report = store.get_report(id).await.unwrap().unwrap();
        assert!(report.name.starts_with("Diff Report: Feeds - "));
        assert_eq!(report.content, "LLM summary");
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("--- run_at_2026-03-01T00:00:00.000000Z"));
        assert!(prompts[0].contains("interpret them"));
    }

    #[tokio::test]
    async fn pair_diff_of_identical_runs_skips_llm() {
        let store = Store::open_in_memory().unwrap();
        let a = add_run(&store, "Feeds", "2026-03-01T00:00:00Z", json!({"x": 1})).await;
        let b = add_run(&store, "Feeds", "2026-03-02T00:00:00Z", json!({"x": 1})).await;
        let provider = Arc::new(EchoProvider::default());
        let id = builder(&store, provider.clone())
            .build_pair_diff_report(a, b)
            .await
            .unwrap();
        assert_eq!(store.get_report(id).await.unwrap().unwrap().content, PAIR_UNCHANGED);
        assert!(provider.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn insight_merges_sources_into_one_summary() {
        let store = Store::open_in_memory().unwrap();
        add_run(&store, "Feeds", "2026-03-01T00:00:00Z", json!({"feeds": [{"name": "okta", "etag": "1"}]})).await;
        add_run(&store, "Feeds", "2026-03-02T00:00:00Z", json!({"feeds": [{"name": "crowdstrike", "etag": "2"}]})).await;
        add_run(&store, "Parsers", "2026-03-01T00:00:00Z", json!({"parsers": [{"logType": "OKTA"}]})).await;
        let insight = store
            .create_insight(&NewInsight {
                title: "Ingestion posture".into(),
                prompt: "Which feeds lack parsers?".into(),
                excluded_fields: vec!["etag".into()],
                audit_sources: vec!["Feeds".into(), "Parsers".into(), "Forwarders".into()],
            })
            .await
            .unwrap();

        let provider = Arc::new(EchoProvider::default());
        let id = builder(&store, provider.clone())
            .build_insight_report("t1", insight)
            .await
            .unwrap();

        let report = store.get_report(id).await.unwrap().unwrap();
        assert!(report.name.starts_with("Insight Report: Ingestion posture - "));
        assert_eq!(report.content, "LLM summary");
        assert_eq!(report.tenant_id.as_deref(), Some("t1"));

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        let prompt = &prompts[0];
        assert!(prompt.contains("Which feeds lack parsers?"));
        assert!(prompt.contains("crowdstrike"));
        assert!(!prompt.contains("okta\""));
        assert!(prompt.contains("\"logType\": \"OKTA\""));
        assert!(prompt.contains("\"Forwarders\": \"No successful audit run found.\""));
        assert!(!prompt.contains("etag"));
    }

    #[tokio::test]
    async fn unknown_insight_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        let err = builder(&store, Arc::new(EchoProvider::default()))
            .build_insight_report("t1", 42)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Insight 42 not found"));
        assert!(store.list_reports(None).await.unwrap().is_empty());
    }
}
