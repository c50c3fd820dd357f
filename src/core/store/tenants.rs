use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use tracing::warn;

use super::Store;
use super::types::{Folder, Organization, TenantConfig, TenantLineage};

fn folder_by_id(db: &Connection, id: i64) -> rusqlite::Result<Option<Folder>> {
    db.query_row(
        "SELECT id, name, parent_folder_id, organization_id FROM folders WHERE id = ?1",
        params![id],
        |row| {
            Ok(Folder {
                id: row.get(0)?,
                name: row.get(1)?,
                parent_folder_id: row.get(2)?,
                organization_id: row.get(3)?,
            })
        },
    )
    .optional()
}

fn organization_by_id(db: &Connection, id: i64) -> rusqlite::Result<Option<Organization>> {
    db.query_row(
        "SELECT id, name FROM organizations WHERE id = ?1",
        params![id],
        |row| {
            Ok(Organization {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        },
    )
    .optional()
}

impl Store {
    pub async fn upsert_organization(&self, name: &str) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO organizations (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        let id = db.query_row(
            "SELECT id FROM organizations WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_folder_id: Option<i64>,
        organization_id: Option<i64>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO folders (name, parent_folder_id, organization_id) VALUES (?1, ?2, ?3)",
            params![name, parent_folder_id, organization_id],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn set_folder_parent(&self, folder_id: i64, parent_folder_id: Option<i64>) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE folders SET parent_folder_id = ?1 WHERE id = ?2",
            params![parent_folder_id, folder_id],
        )?;
        Ok(changed > 0)
    }

    /// Create or refresh a folder known by an external id such as a GCP
    /// folder number. An existing organization link is kept when none is given.
    pub async fn upsert_discovered_folder(
        &self,
        external_id: &str,
        name: &str,
        parent_folder_id: Option<i64>,
        organization_id: Option<i64>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO folders (name, parent_folder_id, organization_id, external_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(external_id) DO UPDATE SET name=excluded.name,
                parent_folder_id=excluded.parent_folder_id,
                organization_id=COALESCE(excluded.organization_id, folders.organization_id)",
            params![name, parent_folder_id, organization_id, external_id],
        )?;
        let id = db.query_row(
            "SELECT id FROM folders WHERE external_id = ?1",
            params![external_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Register a tenant under a folder without touching its connection
    /// settings. Existing tenants keep their name and only move. Returns true
    /// when the tenant is new.
    pub async fn place_tenant(&self, tenant_id: &str, name: &str, folder_id: Option<i64>) -> Result<bool> {
        let db = self.db.lock().await;
        let existing: Option<String> = db
            .query_row(
                "SELECT tenant_id FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        db.execute(
            "INSERT INTO tenants (tenant_id, name, folder_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id) DO UPDATE SET folder_id=excluded.folder_id",
            params![tenant_id, name, folder_id],
        )?;
        Ok(existing.is_none())
    }

    pub async fn upsert_tenant(&self, config: &TenantConfig) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO tenants (tenant_id, name, folder_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id) DO UPDATE SET name=excluded.name, folder_id=excluded.folder_id",
            params![config.tenant_id, config.name, config.folder_id],
        )?;
        db.execute(
            "INSERT INTO tenant_configs (tenant_id, region, customer_id, soar_url, bindplane_url)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id) DO UPDATE SET region=excluded.region,
                customer_id=excluded.customer_id, soar_url=excluded.soar_url,
                bindplane_url=excluded.bindplane_url",
            params![
                config.tenant_id,
                config.region,
                config.customer_id,
                config.soar_url,
                config.bindplane_url
            ],
        )?;
        Ok(())
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantConfig>> {
        let db = self.db.lock().await;
        let tenant = db
            .query_row(
                "SELECT t.tenant_id, t.name, t.folder_id, c.region, c.customer_id, c.soar_url, c.bindplane_url
                 FROM tenants t LEFT JOIN tenant_configs c ON c.tenant_id = t.tenant_id
                 WHERE t.tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok(TenantConfig {
                        tenant_id: row.get(0)?,
                        name: row.get(1)?,
                        folder_id: row.get(2)?,
                        region: row.get(3)?,
                        customer_id: row.get(4)?,
                        soar_url: row.get(5)?,
                        bindplane_url: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }

    /// Walk tenant → folder → parent folders → organization by id. A folder
    /// seen twice ends the walk instead of looping.
    pub async fn tenant_lineage(&self, tenant_id: &str) -> Result<Option<TenantLineage>> {
        let Some(tenant) = self.get_tenant(tenant_id).await? else {
            return Ok(None);
        };

        let db = self.db.lock().await;
        let mut folders = Vec::new();
        let mut visited = HashSet::new();
        let mut cycle_detected = false;
        let mut next = tenant.folder_id;

        while let Some(folder_id) = next {
            if !visited.insert(folder_id) {
                warn!(
                    "Folder cycle detected at folder {} while resolving tenant {}",
                    folder_id, tenant_id
                );
                cycle_detected = true;
                break;
            }
            let Some(folder) = folder_by_id(&db, folder_id)? else {
                break;
            };
            next = folder.parent_folder_id;
            folders.push(folder);
        }

        // The top-most folder decides the organization when several set one.
        let organization = match folders.iter().rev().find_map(|f| f.organization_id) {
            Some(id) => organization_by_id(&db, id)?,
            None => None,
        };

        Ok(Some(TenantLineage {
            tenant,
            folders,
            organization,
            cycle_detected,
        }))
    }
}
