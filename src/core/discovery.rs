use anyhow::{Result, bail};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::audit::{GCP_TOKEN_ENV, ServiceUrls, check_error_payload};
use crate::core::auth::{self, AuthContext, AuthStrategy, TenantCredentials};
use crate::core::fetch::{
    Endpoint, FetchError, HttpMethod, HttpTransport, PaginatedFetcher, PaginationConfig,
    ResponseShape,
};
use crate::core::retry::RetryPolicy;
use crate::core::store::Store;

pub const DEFAULT_SERVICE_FILTER: &str = "chronicle.googleapis.com";

/// Vault entry for the organization-wide token used by discovery. Falls back
/// to the tenant token env var when unset.
pub const DISCOVERY_TOKEN_KEY: &str = "discovery_gcp_access_token";

const SERVICE_ASSET: &str = "serviceusage.googleapis.com/Service";
const FOLDER_ASSET: &str = "cloudresourcemanager.googleapis.com/Folder";
const PROJECT_ASSET: &str = "cloudresourcemanager.googleapis.com/Project";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum NodeKind {
    Project,
    Folder,
    Organization,
}

impl NodeKind {
    fn collection(&self) -> &'static str {
        match self {
            NodeKind::Project => "projects",
            NodeKind::Folder => "folders",
            NodeKind::Organization => "organizations",
        }
    }
}

/// Split `//cloudresourcemanager.googleapis.com/folders/42` (or a bare
/// `folders/42`) into its kind and id. Trailing segments are ignored, so a
/// service asset name resolves to its project.
fn parse_resource(reference: &str) -> Option<(NodeKind, String)> {
    let path = match reference.strip_prefix("//") {
        Some(rest) => rest.split_once('/')?.1,
        None => reference,
    };
    let mut parts = path.split('/');
    let kind = match parts.next()? {
        "projects" => NodeKind::Project,
        "folders" => NodeKind::Folder,
        "organizations" => NodeKind::Organization,
        _ => return None,
    };
    let id = parts.next().filter(|id| !id.is_empty())?;
    Some((kind, id.to_string()))
}

/// Shell-style match supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[derive(Debug, Clone)]
struct ResourceNode {
    parent: Option<(NodeKind, String)>,
    display_name: Option<String>,
}

/// Projects and folders from one asset listing, keyed by kind and id.
#[derive(Debug, Default)]
struct Inventory {
    nodes: HashMap<(NodeKind, String), ResourceNode>,
    services: Vec<(String, String)>,
}

/// Where a project sits: its folders nearest first, and the organization
/// the walk ended at, if any.
#[derive(Debug, Default, PartialEq)]
struct Ancestry {
    folders: Vec<String>,
    organization: Option<String>,
}

impl Inventory {
    fn from_assets(assets: &[Value]) -> Self {
        let mut inventory = Inventory::default();
        for asset in assets {
            let Some(name) = asset.get("name").and_then(Value::as_str) else {
                continue;
            };
            let asset_type = asset.get("assetType").and_then(Value::as_str).unwrap_or_default();
            let resource = asset.get("resource");
            let parent = resource
                .and_then(|r| r.get("parent"))
                .and_then(Value::as_str)
                .and_then(parse_resource);

            match asset_type {
                SERVICE_ASSET => {
                    let service = name.rsplit('/').next().unwrap_or_default().to_string();
                    if let Some((NodeKind::Project, project)) = parent.or_else(|| parse_resource(name)) {
                        inventory.services.push((project, service));
                    }
                }
                FOLDER_ASSET | PROJECT_ASSET => {
                    let Some(key) = parse_resource(name) else {
                        continue;
                    };
                    let data = resource.and_then(|r| r.get("data"));
                    let display_name = data
                        .and_then(|d| d.get("displayName").or_else(|| d.get("name")))
                        .and_then(Value::as_str)
                        .filter(|s| !s.trim().is_empty())
                        .map(str::to_string);
                    inventory.nodes.insert(key, ResourceNode { parent, display_name });
                }
                other => debug!("Skipping asset {} of type {}", name, other),
            }
        }
        inventory
    }

    /// Project ids running a service whose name matches `filter`, sorted.
    fn projects_with_service(&self, filter: &str) -> BTreeSet<String> {
        self.services
            .iter()
            .filter(|(_, service)| glob_match(filter, service))
            .map(|(project, _)| project.clone())
            .collect()
    }

    fn ancestry(&self, project_id: &str) -> Ancestry {
        let mut ancestry = Ancestry::default();
        let mut visited = HashSet::new();
        let mut next = self
            .nodes
            .get(&(NodeKind::Project, project_id.to_string()))
            .and_then(|n| n.parent.clone());

        while let Some((kind, id)) = next {
            match kind {
                NodeKind::Folder => {
                    if !visited.insert(id.clone()) {
                        warn!("Folder cycle at folders/{} while placing project {}", id, project_id);
                        break;
                    }
                    next = self
                        .nodes
                        .get(&(NodeKind::Folder, id.clone()))
                        .and_then(|n| n.parent.clone());
                    ancestry.folders.push(id);
                }
                NodeKind::Organization => {
                    ancestry.organization = Some(id);
                    break;
                }
                NodeKind::Project => break,
            }
        }
        ancestry
    }

    fn display_name(&self, kind: NodeKind, id: &str) -> Option<String> {
        self.nodes
            .get(&(kind, id.to_string()))
            .and_then(|n| n.display_name.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub tenants: usize,
    pub new_tenants: usize,
    pub folders: usize,
    pub organizations: usize,
}

impl fmt::Display for DiscoverySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tenant(s) found ({} new) across {} folder(s) and {} organization(s)",
            self.tenants, self.new_tenants, self.folders, self.organizations
        )
    }
}

/// Finds projects running a matching service under an organization and
/// registers them as tenants, mirroring their folder hierarchy.
pub struct TenantDiscovery {
    store: Store,
    fetcher: PaginatedFetcher,
    retry: RetryPolicy,
    urls: ServiceUrls,
}

impl TenantDiscovery {
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

    pub async fn discover(&self, organization_id: &str, service_filter: &str) -> Result<DiscoverySummary> {
        let organization_id = organization_id.trim().trim_start_matches("organizations/");
        if organization_id.is_empty() {
            bail!("An organization id is required for discovery");
        }
        let filter = match service_filter.trim() {
            "" => DEFAULT_SERVICE_FILTER,
            f => f,
        };

        let auth = auth::resolve(AuthStrategy::Gcp, &self.credentials().await?)?;
        let assets = self.list_assets(organization_id, &auth).await?;
        let inventory = Inventory::from_assets(&assets);
        let projects = inventory.projects_with_service(filter);
        info!(
            "Discovery scanned {} asset(s) in organizations/{}: {} project(s) match '{}'",
            assets.len(),
            organization_id,
            projects.len(),
            filter
        );

        let mut summary = DiscoverySummary::default();
        let mut org_rows: HashMap<String, i64> = HashMap::new();
        let mut folder_rows: HashMap<String, i64> = HashMap::new();
        let mut names: HashMap<(NodeKind, String), String> = HashMap::new();

        for project in &projects {
            let ancestry = inventory.ancestry(project);
            let org_row = match &ancestry.organization {
                Some(org) => match org_rows.get(org) {
                    Some(row) => Some(*row),
                    None => {
                        let row = self.store.upsert_organization(&format!("Organization {}", org)).await?;
                        org_rows.insert(org.clone(), row);
                        Some(row)
                    }
                },
                None => None,
            };

            let mut parent_row = None;
            for (depth, folder) in ancestry.folders.iter().rev().enumerate() {
                if let Some(row) = folder_rows.get(folder) {
                    parent_row = Some(*row);
                    continue;
                }
                let name = self
                    .display_name(&inventory, NodeKind::Folder, folder, &auth, &mut names)
                    .await;
                let organization = if depth == 0 { org_row } else { None };
                let row = self
                    .store
                    .upsert_discovered_folder(folder, &name, parent_row, organization)
                    .await?;
                folder_rows.insert(folder.clone(), row);
                parent_row = Some(row);
            }

            let name = self
                .display_name(&inventory, NodeKind::Project, project, &auth, &mut names)
                .await;
            if self.store.place_tenant(project, &name, parent_row).await? {
                info!("Discovered new tenant {} ({})", name, project);
                summary.new_tenants += 1;
            }
            summary.tenants += 1;
        }

        summary.folders = folder_rows.len();
        summary.organizations = org_rows.len();
        info!("Discovery complete: {}", summary);
        Ok(summary)
    }

    async fn credentials(&self) -> Result<TenantCredentials> {
        let token = match self.store.vault().get_secret(DISCOVERY_TOKEN_KEY).await? {
            Some(token) if !token.trim().is_empty() => Some(token),
            _ => std::env::var(GCP_TOKEN_ENV).ok(),
        };
        Ok(TenantCredentials {
            gcp_access_token: token,
            ..Default::default()
        })
    }

    async fn list_assets(&self, organization_id: &str, auth: &AuthContext) -> Result<Vec<Value>> {
        let endpoint = Endpoint {
            method: HttpMethod::Get,
            base_url: self.urls.asset_inventory(),
            path_template: format!(
                "v1/organizations/{}/assets?contentType=RESOURCE&assetTypes={}&assetTypes={}&assetTypes={}",
                organization_id, SERVICE_ASSET, FOLDER_ASSET, PROJECT_ASSET
            ),
            parent: None,
            json_body: None,
            shape: ResponseShape::Json,
        };
        let pagination = PaginationConfig {
            request_token_key: Some("pageToken".to_string()),
            response_token_key: Some("nextPageToken".to_string()),
            results_key: Some("assets".to_string()),
            page_size: None,
        };
        let payload = self.fetch_with_retry("asset inventory", &endpoint, auth, &pagination).await?;
        check_error_payload(&payload)?;
        Ok(payload
            .get("assets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Asset data first, then a Resource Manager lookup, then the bare id.
    /// Lookups are cached for the run and failures fall back quietly.
    async fn display_name(
        &self,
        inventory: &Inventory,
        kind: NodeKind,
        id: &str,
        auth: &AuthContext,
        cache: &mut HashMap<(NodeKind, String), String>,
    ) -> String {
        if let Some(name) = inventory.display_name(kind, id) {
            return name;
        }
        let key = (kind, id.to_string());
        if let Some(name) = cache.get(&key) {
            return name.clone();
        }

        let endpoint = Endpoint {
            method: HttpMethod::Get,
            base_url: self.urls.resource_manager(),
            path_template: format!("v3/{}/{}", kind.collection(), id),
            parent: None,
            json_body: None,
            shape: ResponseShape::Json,
        };
        let label = format!("{}/{}", kind.collection(), id);
        let name = match self
            .fetch_with_retry(&label, &endpoint, auth, &PaginationConfig::default())
            .await
        {
            Ok(body) => body
                .get("displayName")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
            Err(e) => {
                warn!("Could not look up the display name of {}: {}", label, e);
                None
            }
        }
        .unwrap_or_else(|| id.to_string());

        cache.insert(key, name.clone());
        name
    }

    async fn fetch_with_retry(
        &self,
        label: &str,
        endpoint: &Endpoint,
        auth: &AuthContext,
        pagination: &PaginationConfig,
    ) -> Result<Value, FetchError> {
        let fetcher = &self.fetcher;
        self.retry
            .execute_with_payload_check(
                label,
                || fetcher.fetch(endpoint, auth, pagination, None),
                FetchError::from_payload,
            )
            .await
    }
}
