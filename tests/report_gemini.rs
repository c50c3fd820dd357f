mod common;

use axum::extract::State;
use axum::http::{HeaderMap, Uri};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use std::sync::Arc;

use common::{MockServer, Trace};
use vigil::core::config::LlmConfig;
use vigil::core::llm::providers::gemini::GeminiProvider;
use vigil::core::report::ReportBuilder;
use vigil::core::retry::RetryPolicy;
use vigil::core::store::Store;
use vigil::core::store::types::RunStatus;
use vigil::core::summarizer::{Summarizer, SummarizerSettings};

#[derive(Clone)]
struct GeminiState {
    uris: Trace,
    keys: Trace,
    prompts: Trace,
    safety: Trace,
    blocked: bool,
}

async fn generate(
    State(state): State<GeminiState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.uris.push(uri.to_string());
    state.keys.push(
        headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    );
    state.prompts.push(
        body["contents"][0]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    );
    state.safety.push(body["safetySettings"].to_string());

    if state.blocked {
        return Json(json!({
            "candidates": [{"finishReason": "SAFETY"}],
            "promptFeedback": {"safetyRatings": [{"category": "HARM_CATEGORY_HARASSMENT"}]}
        }));
    }
    Json(json!({
        "candidates": [{
            "content": {"parts": [{"text": "MOCK "}, {"text": "SUMMARY"}]},
            "finishReason": "STOP"
        }]
    }))
}

struct Fixture {
    server: MockServer,
    state: GeminiState,
    store: Store,
    builder: ReportBuilder,
}

async fn fixture(blocked: bool) -> Fixture {
    let state = GeminiState {
        uris: Trace::default(),
        keys: Trace::default(),
        prompts: Trace::default(),
        safety: Trace::default(),
        blocked,
    };
    let app = Router::new().fallback(generate).with_state(state.clone());
    let server = MockServer::start(app).await.expect("mock gemini");

    let store = Store::open_in_memory().unwrap();
    let provider = Arc::new(GeminiProvider::new(
        "test-key".to_string(),
        Some(server.base_url.clone()),
    ));
    let summarizer = Summarizer::new(
        provider,
        SummarizerSettings::from_config(&LlmConfig::default()),
        RetryPolicy::immediate(0),
    );
    let builder = ReportBuilder::new(store.clone(), Arc::new(summarizer));
    Fixture {
        server,
        state,
        store,
        builder,
    }
}

async fn add_run(store: &Store, hour: u32, payload: Value) -> i64 {
    store
        .insert_run(
            "acme",
            "Feeds",
            "Ingestion",
            Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap(),
            RunStatus::Success,
            &serde_json::to_string_pretty(&payload).unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn report_is_summarized_through_gemini() {
    let fx = fixture(false).await;
    add_run(
        &fx.store,
        1,
        json!({"feeds": [{"name": "okta", "secret_field": "hunter2"}]}),
    )
    .await;
    fx.store
        .set_prompt("Feeds", "List every feed.", &["secret_field".to_string()])
        .await
        .unwrap();

    let id = fx
        .builder
        .build_report("acme", &["Feeds".to_string(), "Rules".to_string()], Some("Weekly {date}"))
        .await
        .unwrap();
    let report = fx.store.get_report(id).await.unwrap().unwrap();

    assert!(report.name.starts_with("Weekly 20"), "{}", report.name);
    assert_eq!(report.status, "Completed");
    assert_eq!(
        report.content,
        "## Feeds\n\nMOCK SUMMARY\n\n## Rules\n\nNo successful audit run found.\n\n"
    );

    let uris = fx.state.uris.lines();
    assert_eq!(uris.len(), 1);
    assert_eq!(uris[0], "/v1beta/models/gemini-1.5-flash:generateContent");
    assert_eq!(fx.state.keys.lines(), vec!["test-key".to_string()]);

    let prompt = &fx.state.prompts.lines()[0];
    assert!(prompt.contains("List every feed."));
    assert!(prompt.contains("okta"));
    assert!(!prompt.contains("hunter2"));
    assert!(fx.state.safety.lines()[0].contains("BLOCK_NONE"));
    fx.server.shutdown().await;
}

#[tokio::test]
async fn blocked_generation_becomes_an_error_section() {
    let fx = fixture(true).await;
    add_run(&fx.store, 1, json!({"feeds": [{"name": "okta"}]})).await;

    let id = fx
        .builder
        .build_report("acme", &["Feeds".to_string()], None)
        .await
        .unwrap();
    let report = fx.store.get_report(id).await.unwrap().unwrap();

    assert!(report.name.starts_with("Ad-Hoc Report - "));
    assert!(
        report.content.starts_with("## Feeds\n\nError generating summary: "),
        "{}",
        report.content
    );
    fx.server.shutdown().await;
}

#[tokio::test]
async fn change_report_sends_the_diff_and_skips_the_model_when_unchanged() {
    let fx = fixture(false).await;
    add_run(&fx.store, 1, json!({"feeds": [{"name": "okta"}]})).await;
    add_run(&fx.store, 2, json!({"feeds": [{"name": "okta"}, {"name": "crowdstrike"}]})).await;

    let id = fx
        .builder
        .build_diff_report("acme", &["Feeds".to_string()], None)
        .await
        .unwrap();
    let report = fx.store.get_report(id).await.unwrap().unwrap();
    assert!(report.name.starts_with("Daily Change Report - "));
    assert_eq!(report.content, "## Feeds\n\nMOCK SUMMARY\n\n");

    let prompt = &fx.state.prompts.lines()[0];
    assert!(prompt.contains("You are a security analyst."));
    assert!(prompt.contains("+"));
    assert!(prompt.contains("crowdstrike"));

    // A third run identical to the second: nothing to summarize.
    add_run(&fx.store, 3, json!({"feeds": [{"name": "okta"}, {"name": "crowdstrike"}]})).await;
    let id = fx
        .builder
        .build_diff_report("acme", &["Feeds".to_string()], None)
        .await
        .unwrap();
    let report = fx.store.get_report(id).await.unwrap().unwrap();
    assert!(report.content.starts_with("## No Significant Changes Detected"));
    assert_eq!(fx.state.prompts.lines().len(), 1);
    fx.server.shutdown().await;
}

#[tokio::test]
async fn pair_diff_orders_runs_by_time() {
    let fx = fixture(false).await;
    let older = add_run(&fx.store, 1, json!({"rules": ["r1"]})).await;
    let newer = add_run(&fx.store, 2, json!({"rules": ["r1", "r2"]})).await;

    let id = fx
        .builder
        .build_pair_diff_report(newer, older)
        .await
        .unwrap();
    let report = fx.store.get_report(id).await.unwrap().unwrap();
    assert!(report.name.starts_with("Diff Report: Feeds - "));
    assert_eq!(report.content, "MOCK SUMMARY");

    let prompt = &fx.state.prompts.lines()[0];
    assert!(prompt.contains("run_at_2026-03-01T01:00:00.000000Z"));
    assert!(prompt.contains("+    \"r2\""));
    fx.server.shutdown().await;
}

#[tokio::test]
async fn unreachable_model_error_keeps_the_api_key_out_of_the_report() {
    let store = Store::open_in_memory().unwrap();
    add_run(&store, 1, json!({"feeds": [{"name": "okta"}]})).await;
    let provider = Arc::new(GeminiProvider::new(
        "SECRET-KEY-123".to_string(),
        Some("http://127.0.0.1:1".to_string()),
    ));
    let summarizer = Summarizer::new(
        provider,
        SummarizerSettings::from_config(&LlmConfig::default()),
        RetryPolicy::immediate(0),
    );
    let builder = ReportBuilder::new(store.clone(), Arc::new(summarizer));

    let id = builder
        .build_report("acme", &["Feeds".to_string()], None)
        .await
        .unwrap();
    let report = store.get_report(id).await.unwrap().unwrap();
    assert!(
        report.content.starts_with("## Feeds\n\nError generating summary: "),
        "{}",
        report.content
    );
    assert!(!report.content.contains("SECRET-KEY-123"), "{}", report.content);
}
