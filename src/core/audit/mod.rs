pub mod iam;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::auth::{self, AuthStrategy, TenantCredentials};
use crate::core::fetch::{
    Endpoint, FetchError, HttpMethod, HttpTransport, PaginatedFetcher, PaginationConfig,
    ResponseShape,
};
use crate::core::retry::RetryPolicy;
use crate::core::store::Store;
use crate::core::store::types::{AuditDefinition, AuditKind, RunStatus, TenantConfig};

/// Env fallback for the GCP bearer token when the vault has none.
pub const GCP_TOKEN_ENV: &str = "VIGIL_GCP_ACCESS_TOKEN";

pub const ASSET_INVENTORY_URL: &str = "https://cloudasset.googleapis.com";

const DASHBOARD_QUERY_PATH: &str = "v1alpha/{parent}/dashboardQueries:execute";
const UNKNOWN_CATEGORY: &str = "Unknown";

/// Base URLs for the Google APIs. Overridable so tests can point at a local
/// server.
#[derive(Debug, Clone, Default)]
pub struct ServiceUrls {
    /// Replaces `https://{region}-chronicle.googleapis.com` when set.
    pub chronicle: Option<String>,
    /// Replaces the Cloud Resource Manager URL when set.
    pub resource_manager: Option<String>,
    pub asset_inventory: Option<String>,
}

impl ServiceUrls {
    fn chronicle_for(&self, region: &str) -> String {
        self.chronicle
            .clone()
            .unwrap_or_else(|| format!("https://{}-chronicle.googleapis.com", region))
    }

    pub(crate) fn resource_manager(&self) -> String {
        self.resource_manager
            .clone()
            .unwrap_or_else(|| iam::RESOURCE_MANAGER_URL.to_string())
    }

    pub(crate) fn asset_inventory(&self) -> String {
        self.asset_inventory
            .clone()
            .unwrap_or_else(|| ASSET_INVENTORY_URL.to_string())
    }
}

/// Size of the pretty-printed payload in bytes and a rough item count: the
/// length of the first list-valued field, 1 for any other non-empty object,
/// or the length of a top-level list.
pub fn response_details(payload: &Value) -> (usize, usize) {
    let size = serde_json::to_string_pretty(payload)
        .map(|s| s.len())
        .unwrap_or(0);
    let count = match payload {
        Value::Object(map) => map
            .values()
            .find_map(|v| v.as_array().map(Vec::len))
            .unwrap_or(usize::from(!map.is_empty())),
        Value::Array(items) => items.len(),
        Value::Null => 0,
        _ => 1,
    };
    (size, count)
}

pub fn completion_message(audit_name: &str, payload: &Value) -> String {
    let (size, count) = response_details(payload);
    let size_kb = (size as f64 / 1024.0 * 100.0).round() / 100.0;
    format!(
        "Audit '{}' completed successfully. Results: {} items ({} KB).",
        audit_name, count, size_kb
    )
}

pub fn dashboard_query_body(query: &str, time_unit: &str, time_value: u32) -> Value {
    json!({
        "query": {
            "query": query.trim(),
            "input": {
                "relativeTime": {
                    "timeUnit": time_unit,
                    "startTimeVal": time_value.to_string(),
                }
            }
        }
    })
}

pub struct AuditRunner {
    store: Store,
    fetcher: PaginatedFetcher,
    retry: RetryPolicy,
    urls: ServiceUrls,
}

impl AuditRunner {
    pub fn new(store: Store, transport: Arc<dyn HttpTransport>, retry: RetryPolicy) -> Self {
        Self {
            store,
            fetcher: PaginatedFetcher::new(transport),
            retry,
            urls: ServiceUrls::default(),
        }
    }

    pub fn with_service_urls(mut self, urls: ServiceUrls) -> Self {
        self.urls = urls;
        self
    }

    /// Fetch, persist, and describe one audit run.
    pub async fn run_audit(&self, tenant_id: &str, audit_name: &str) -> Result<String> {
        let definition = self.store.get_audit_definition(audit_name).await?;
        let category = definition
            .as_ref()
            .map(|d| d.category.clone())
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());

        info!("Running audit '{}' for tenant {}", audit_name, tenant_id);
        let outcome = match definition {
            Some(def) => self.collect(tenant_id, &def).await,
            None => Err(anyhow!("Audit '{}' not found", audit_name)),
        };

        match outcome {
            Ok(payload) => {
                let body = serde_json::to_string_pretty(&payload)?;
                self.store
                    .insert_run(tenant_id, audit_name, &category, Utc::now(), RunStatus::Success, &body)
                    .await?;
                let message = completion_message(audit_name, &payload);
                info!("{}", message);
                Ok(message)
            }
            Err(e) => {
                warn!("Audit '{}' failed for tenant {}: {}", audit_name, tenant_id, e);
                let body = serde_json::to_string_pretty(&json!({ "error": e.to_string() }))?;
                self.store
                    .insert_run(tenant_id, audit_name, &category, Utc::now(), RunStatus::Failed, &body)
                    .await?;
                Err(e)
            }
        }
    }

    async fn credentials(&self, tenant_id: &str) -> Result<TenantCredentials> {
        let mut creds = self.store.vault().tenant_credentials(tenant_id).await?;
        if creds.gcp_access_token.is_none() {
            creds.gcp_access_token = std::env::var(GCP_TOKEN_ENV).ok();
        }
        Ok(creds)
    }

    async fn collect(&self, tenant_id: &str, def: &AuditDefinition) -> Result<Value> {
        let creds = self.credentials(tenant_id).await?;

        if let AuditKind::IamRoleBindings { roles } = &def.kind {
            let auth = auth::resolve(AuthStrategy::Gcp, &creds)?;
            let endpoint = Endpoint {
                method: HttpMethod::Post,
                base_url: self.urls.resource_manager(),
                path_template: iam::policy_path(tenant_id),
                parent: None,
                json_body: Some(json!({})),
                shape: ResponseShape::Json,
            };
            let policy = self
                .fetch_with_retry(&def.name, &endpoint, &auth, &PaginationConfig::default(), None)
                .await?;
            check_error_payload(&policy)?;
            return Ok(iam::reduce_policy(tenant_id, &policy, roles));
        }

        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| anyhow!("Tenant is not configured."))?;
        let auth = auth::resolve(def.auth_strategy, &creds)?;
        let mut endpoint = self.endpoint_for(def, &tenant)?;

        if let AuditKind::DashboardQuery {
            query,
            time_unit,
            time_value,
        } = &def.kind
        {
            endpoint.method = HttpMethod::Post;
            endpoint.json_body = Some(dashboard_query_body(query, time_unit, *time_value));
            if def.path_template.trim().is_empty() {
                endpoint.path_template = DASHBOARD_QUERY_PATH.to_string();
            }
        }

        let payload = self
            .fetch_with_retry(&def.name, &endpoint, &auth, &def.pagination(), def.max_pages)
            .await?;
        check_error_payload(&payload)?;
        Ok(payload)
    }

    fn endpoint_for(&self, def: &AuditDefinition, tenant: &TenantConfig) -> Result<Endpoint> {
        let (base_url, parent) = match def.auth_strategy {
            AuthStrategy::Gcp => {
                let region = tenant
                    .region
                    .as_deref()
                    .context("Tenant has no SecOps region configured")?;
                let customer = tenant
                    .customer_id
                    .as_deref()
                    .context("Tenant has no SecOps customer id configured")?;
                (
                    self.urls.chronicle_for(region),
                    Some(format!(
                        "projects/{}/locations/{}/instances/{}",
                        tenant.tenant_id, region, customer
                    )),
                )
            }
            AuthStrategy::SoarApiKey => (
                tenant.soar_url.clone().context("Tenant has no SOAR URL configured")?,
                None,
            ),
            AuthStrategy::BindplaneApiKey => (
                tenant
                    .bindplane_url
                    .clone()
                    .context("Tenant has no BindPlane URL configured")?,
                None,
            ),
        };

        Ok(Endpoint {
            method: def.method,
            base_url,
            path_template: def.path_template.clone(),
            parent,
            json_body: def.json_body.clone(),
            shape: def.response_shape,
        })
    }

    async fn fetch_with_retry(
        &self,
        label: &str,
        endpoint: &Endpoint,
        auth: &auth::AuthContext,
        pagination: &PaginationConfig,
        max_pages: Option<u32>,
    ) -> Result<Value, FetchError> {
        let fetcher = &self.fetcher;
        self.retry
            .execute_with_payload_check(
                label,
                || fetcher.fetch(endpoint, auth, pagination, max_pages),
                FetchError::from_payload,
            )
            .await
    }
}

/// A 2xx body that still reports an error fails the run.
pub(crate) fn check_error_payload(payload: &Value) -> Result<()> {
    let Some(err) = payload.get("error") else {
        return Ok(());
    };
    let detail = payload
        .get("details")
        .or_else(|| err.get("message"))
        .unwrap_or(err);
    match detail {
        Value::String(s) => bail!("{}", s),
        other => bail!("{}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fetch::{HttpRequest, HttpResponse};
    use crate::core::store::types::RunStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct CannedTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl CannedTransport {
        fn new(bodies: &[(u16, &str)]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    bodies
                        .iter()
                        .map(|(status, body)| HttpResponse {
                            status: *status,
                            body: body.to_string(),
                        })
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for CannedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
            self.requests.lock().unwrap().push(request);
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or(HttpResponse {
                status: 204,
                body: String::new(),
            }))
        }
    }

    fn definition(name: &str, kind: AuditKind) -> AuditDefinition {
        serde_json::from_value(json!({
            "name": name,
            "category": "Ingestion",
            "path_template": "v1alpha/{parent}/feeds",
            "pagination_response_token_key": "nextPageToken",
            "pagination_results_key": "feeds",
        }))
        .map(|mut d: AuditDefinition| {
            d.kind = kind;
            d
        })
        .unwrap()
    }

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_tenant(&TenantConfig {
                tenant_id: "acme".into(),
                name: "Acme".into(),
                region: Some("eu".into()),
                customer_id: Some("cust-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .vault()
            .set_tenant_secret("acme", AuthStrategy::Gcp, "token-1")
            .await
            .unwrap();
        store
    }

    fn runner(store: &Store, transport: Arc<CannedTransport>) -> AuditRunner {
        AuditRunner::new(store.clone(), transport, RetryPolicy::immediate(2)).with_service_urls(
            ServiceUrls {
                chronicle: Some("http://secops.test".into()),
                resource_manager: Some("http://crm.test".into()),
                asset_inventory: None,
            },
        )
    }

    #[test]
    fn details_count_first_list_or_single_object() {
        assert_eq!(response_details(&json!({"feeds": [1, 2, 3]})).1, 3);
        assert_eq!(response_details(&json!({"name": "x"})).1, 1);
        assert_eq!(response_details(&json!({})).1, 0);
        assert_eq!(response_details(&json!([1, 2])).1, 2);
    }

    #[test]
    fn completion_message_reports_kb() {
        let msg = completion_message("Feeds", &json!({"feeds": [1]}));
        assert!(msg.starts_with("Audit 'Feeds' completed successfully. Results: 1 items ("));
        assert!(msg.ends_with(" KB)."));
    }

    #[tokio::test]
    async fn successful_run_is_persisted_pretty() {
        let store = seeded_store().await;
        store
            .upsert_audit_definition(&definition("Feeds", AuditKind::Api))
            .await
            .unwrap();
        let transport = CannedTransport::new(&[
            (200, r#"{"feeds":[{"id":1}],"nextPageToken":"abc"}"#),
            (200, r#"{"feeds":[{"id":2}]}"#),
        ]);

        let msg = runner(&store, transport.clone()).run_audit("acme", "Feeds").await.unwrap();
        assert!(msg.contains("2 items"));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(
            requests[0].url,
            "http://secops.test/v1alpha/projects/acme/locations/eu/instances/cust-1/feeds"
        );
        assert_eq!(requests[0].headers[0].1, "Bearer token-1");
        assert_eq!(requests[1].query, vec![("nextPageToken".to_string(), "abc".to_string())]);

        let run = store.latest_successful_run("acme", "Feeds").await.unwrap().unwrap();
        assert_eq!(run.category, "Ingestion");
        assert!(run.payload.contains("\n  \"feeds\""));
    }

    #[tokio::test]
    async fn http_failure_is_recorded_as_failed_run() {
        let store = seeded_store().await;
        store
            .upsert_audit_definition(&definition("Feeds", AuditKind::Api))
            .await
            .unwrap();
        let transport = CannedTransport::new(&[(403, r#"{"error":{"message":"denied"}}"#)]);

        let err = runner(&store, transport).run_audit("acme", "Feeds").await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP Error: 403: denied");

        let runs = store.list_runs(Some("acme"), Some("Feeds"), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        let payload: Value = serde_json::from_str(&runs[0].payload).unwrap();
        assert_eq!(payload["error"], "HTTP Error: 403: denied");
    }

    #[tokio::test]
    async fn unknown_audit_and_missing_tenant_fail_with_records() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_audit_definition(&definition("Feeds", AuditKind::Api))
            .await
            .unwrap();
        let r = runner(&store, CannedTransport::new(&[]));

        let err = r.run_audit("ghost", "Nope").await.unwrap_err();
        assert_eq!(err.to_string(), "Audit 'Nope' not found");

        store
            .vault()
            .set_tenant_secret("ghost", AuthStrategy::Gcp, "t")
            .await
            .unwrap();
        let err = r.run_audit("ghost", "Feeds").await.unwrap_err();
        assert_eq!(err.to_string(), "Tenant is not configured.");

        let runs = store.list_runs(Some("ghost"), None, 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
        assert!(runs.iter().any(|r| r.category == "Unknown"));
    }

    #[tokio::test]
    async fn payload_rate_limit_is_retried() {
        let store = seeded_store().await;
        store
            .upsert_audit_definition(&definition("Feeds", AuditKind::Api))
            .await
            .unwrap();
        let transport = CannedTransport::new(&[
            (200, r#"{"error":{"code":429,"message":"quota"}}"#),
            (200, r#"{"feeds":[{"id":1}]}"#),
        ]);

        runner(&store, transport.clone()).run_audit("acme", "Feeds").await.unwrap();
        assert_eq!(transport.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dashboard_query_posts_relative_time_body() {
        let store = seeded_store().await;
        let mut def = definition(
            "Top Users",
            AuditKind::DashboardQuery {
                query: " $e.principal.user.userid ".into(),
                time_unit: "DAY".into(),
                time_value: 7,
            },
        );
        def.path_template = String::new();
        def.pagination_results_key = None;
        def.pagination_response_token_key = None;
        store.upsert_audit_definition(&def).await.unwrap();
        let transport = CannedTransport::new(&[(200, r#"{"results":[]}"#)]);

        runner(&store, transport.clone()).run_audit("acme", "Top Users").await.unwrap();
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert!(requests[0].url.ends_with("/instances/cust-1/dashboardQueries:execute"));
        let body = requests[0].json_body.clone().unwrap();
        assert_eq!(body["query"]["query"], "$e.principal.user.userid");
        assert_eq!(body["query"]["input"]["relativeTime"]["startTimeVal"], "7");
    }

    #[tokio::test]
    async fn iam_audit_reduces_policy() {
        let store = seeded_store().await;
        store
            .upsert_audit_definition(&definition(
                "IAM",
                AuditKind::IamRoleBindings {
                    roles: vec!["roles/chronicle.admin".into()],
                },
            ))
            .await
            .unwrap();
        let transport = CannedTransport::new(&[(
            200,
            r#"{"bindings":[{"role":"roles/chronicle.admin","members":["user:a@x.io"]}]}"#,
        )]);

        runner(&store, transport.clone()).run_audit("acme", "IAM").await.unwrap();
        assert_eq!(
            transport.requests.lock().unwrap()[0].url,
            "http://crm.test/v1/projects/acme:getIamPolicy"
        );
        let run = store.latest_successful_run("acme", "IAM").await.unwrap().unwrap();
        let payload: Value = serde_json::from_str(&run.payload).unwrap();
        assert_eq!(payload["roles"]["roles/chronicle.admin"][0], "user:a@x.io");
    }

    #[tokio::test]
    async fn missing_credentials_fail_the_run() {
        let store = seeded_store().await;
        let mut def = definition("Cases", AuditKind::Api);
        def.auth_strategy = AuthStrategy::SoarApiKey;
        store.upsert_audit_definition(&def).await.unwrap();

        let err = runner(&store, CannedTransport::new(&[]))
            .run_audit("acme", "Cases")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("soar_api_key"));
    }
}
