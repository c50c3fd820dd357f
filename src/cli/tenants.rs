use anyhow::{Result, bail};
use console::style;

use super::{App, ParsedArgs, parse_id};
use crate::core::auth::AuthStrategy;
use crate::core::discovery::{DEFAULT_SERVICE_FILTER, DISCOVERY_TOKEN_KEY};
use crate::core::store::types::TenantConfig;
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};
use crate::core::vault::{LLM_API_KEY, tenant_key};

fn tenant_help() {
    GuideSection::new("vigil tenant")
        .command("set <id> --name N", "Create or update a tenant")
        .info("  --region R --customer-id C --soar-url U --bindplane-url U --folder ID")
        .command("show <id>", "Show tenant configuration and stored secrets")
        .command("lineage <id>", "Show folder and organization ancestry")
        .command("org <name>", "Create an organization")
        .command("folder <name> [--parent ID] [--org ID]", "Create a folder")
        .command("reparent <folder_id> [--parent ID]", "Move a folder; omit --parent to detach")
        .command("discover <org_id> [--services GLOB]", "Register projects running a service")
        .print();
    println!();
}

pub async fn run_tenant_command(app: &App, sub_cmd: &str, args: &ParsedArgs) -> Result<()> {
    match sub_cmd {
        "set" => set_tenant(app, args).await,
        "show" => show_tenant(app, args).await,
        "lineage" => show_lineage(app, args).await,
        "org" => {
            let Some(name) = args.positional(0) else {
                bail!("usage: vigil tenant org <name>");
            };
            let id = app.store.upsert_organization(name).await?;
            print_success(&format!("Organization '{}' has id {}.", name, id));
            Ok(())
        }
        "folder" => {
            let Some(name) = args.positional(0) else {
                bail!("usage: vigil tenant folder <name> [--parent ID] [--org ID]");
            };
            let parent = args.parse_value::<i64>("parent")?;
            let org = args.parse_value::<i64>("org")?;
            let id = app.store.create_folder(name, parent, org).await?;
            print_success(&format!("Folder '{}' created with id {}.", name, id));
            Ok(())
        }
        "reparent" => {
            let folder_id = parse_id(args.positional(0), "folder id")?;
            let parent = args.parse_value::<i64>("parent")?;
            if app.store.set_folder_parent(folder_id, parent).await? {
                print_success(&format!("Folder {} moved.", folder_id));
            } else {
                print_warn(&format!("Folder {} not found.", folder_id));
            }
            Ok(())
        }
        "discover" => {
            let Some(org) = args.positional(0) else {
                bail!("usage: vigil tenant discover <org_id> [--services GLOB]");
            };
            let filter = args.value("services").unwrap_or(DEFAULT_SERVICE_FILTER);
            print_info(&format!("Scanning {} for projects running '{}'...", org, filter));
            let summary = app.discovery()?.discover(org, filter).await?;
            print_success(&format!("Discovery finished: {}.", summary));
            Ok(())
        }
        _ => {
            tenant_help();
            Ok(())
        }
    }
}

/// Flags not given keep their stored value.
fn merge_tenant(existing: Option<TenantConfig>, tenant_id: &str, args: &ParsedArgs) -> Result<TenantConfig> {
    let mut config = existing.unwrap_or_else(|| TenantConfig {
        tenant_id: tenant_id.to_string(),
        ..Default::default()
    });
    if let Some(name) = args.value("name") {
        config.name = name.to_string();
    }
    if let Some(folder) = args.parse_value::<i64>("folder")? {
        config.folder_id = Some(folder);
    }
    let optional = [
        ("region", &mut config.region),
        ("customer-id", &mut config.customer_id),
        ("soar-url", &mut config.soar_url),
        ("bindplane-url", &mut config.bindplane_url),
    ];
    for (flag, slot) in optional {
        if let Some(value) = args.value(flag) {
            *slot = Some(value.to_string());
        }
    }
    if config.name.is_empty() {
        bail!("--name is required for a new tenant");
    }
    Ok(config)
}

async fn set_tenant(app: &App, args: &ParsedArgs) -> Result<()> {
    let Some(tenant_id) = args.positional(0) else {
        bail!("usage: vigil tenant set <id> --name N [--region R] ...");
    };
    let existing = app.store.get_tenant(tenant_id).await?;
    let config = merge_tenant(existing, tenant_id, args)?;
    app.store.upsert_tenant(&config).await?;
    print_success(&format!("Tenant '{}' saved.", tenant_id));
    Ok(())
}

fn or_dash(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".to_string())
}

async fn show_tenant(app: &App, args: &ParsedArgs) -> Result<()> {
    let Some(tenant_id) = args.positional(0) else {
        bail!("usage: vigil tenant show <id>");
    };
    let Some(tenant) = app.store.get_tenant(tenant_id).await? else {
        bail!("Tenant '{}' not found", tenant_id);
    };
    let secrets = app.store.vault().tenant_secret_names(tenant_id).await?;
    GuideSection::new(&format!("Tenant {}", tenant.tenant_id))
        .status("Name", &tenant.name)
        .status(
            "Folder",
            &tenant
                .folder_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
        .status("Region", &or_dash(&tenant.region))
        .status("Customer", &or_dash(&tenant.customer_id))
        .status("SOAR", &or_dash(&tenant.soar_url))
        .status("BindPlane", &or_dash(&tenant.bindplane_url))
        .status(
            "Secrets",
            &if secrets.is_empty() {
                "none".to_string()
            } else {
                secrets.join(", ")
            },
        )
        .print();
    println!();
    Ok(())
}

async fn show_lineage(app: &App, args: &ParsedArgs) -> Result<()> {
    let Some(tenant_id) = args.positional(0) else {
        bail!("usage: vigil tenant lineage <id>");
    };
    let Some(lineage) = app.store.tenant_lineage(tenant_id).await? else {
        bail!("Tenant '{}' not found", tenant_id);
    };

    let mut section = GuideSection::new(&format!("Lineage of {}", lineage.tenant.tenant_id))
        .status("Tenant", &lineage.tenant.name);
    for folder in &lineage.folders {
        section = section.status("Folder", &format!("{} (#{})", folder.name, folder.id));
    }
    section = section.status(
        "Organization",
        &lineage
            .organization
            .as_ref()
            .map(|o| format!("{} (#{})", o.name, o.id))
            .unwrap_or_else(|| "-".to_string()),
    );
    section.print();
    if lineage.cycle_detected {
        print_warn("Folder hierarchy contains a cycle; walk stopped at the repeated folder.");
    }
    println!();
    Ok(())
}

pub async fn run_secret_command(app: &App, sub_cmd: &str, args: &ParsedArgs) -> Result<()> {
    let vault = app.store.vault();
    match sub_cmd {
        "set" => match args.positional.as_slice() {
            [target, value] if target == "llm" => {
                vault.set_secret(LLM_API_KEY, value).await?;
                print_success("LLM API key stored.");
                Ok(())
            }
            [target, value] if target == "discovery" => {
                vault.set_secret(DISCOVERY_TOKEN_KEY, value).await?;
                print_success("Discovery token stored.");
                Ok(())
            }
            [tenant_id, strategy, value] => {
                let strategy: AuthStrategy = strategy.parse()?;
                vault.set_tenant_secret(tenant_id, strategy, value).await?;
                print_success(&format!(
                    "Stored {} for tenant '{}'.",
                    style(strategy.secret_name()).cyan(),
                    tenant_id
                ));
                Ok(())
            }
            _ => bail!(
                "usage: vigil secret set llm|discovery <value> | vigil secret set <tenant> <GCP|SOAR_API_KEY|BINDPLANE_API_KEY> <value>"
            ),
        },
        "remove" => {
            let (Some(tenant_id), Some(strategy)) = (args.positional(0), args.positional(1)) else {
                bail!("usage: vigil secret remove <tenant> <strategy>");
            };
            let strategy: AuthStrategy = strategy.parse()?;
            let key = tenant_key(tenant_id, strategy.secret_name());
            if vault.remove_secret(&key).await? {
                print_success(&format!("Removed {} for '{}'.", strategy.secret_name(), tenant_id));
            } else {
                print_info("Nothing to remove.");
            }
            Ok(())
        }
        _ => {
            GuideSection::new("vigil secret")
                .command("set llm <key>", "Store the LLM API key")
                .command("set discovery <token>", "Store the organization token used by discovery")
                .command("set <tenant> <strategy> <value>", "Store a tenant credential")
                .command("remove <tenant> <strategy>", "Delete a tenant credential")
                .info("Strategies: GCP, SOAR_API_KEY, BINDPLANE_API_KEY")
                .print();
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(raw: &[&str]) -> ParsedArgs {
        let args: Vec<String> = raw.iter().map(|s| s.to_string()).collect();
        ParsedArgs::parse(&args, 0)
    }

    #[test]
    fn new_tenant_needs_a_name() {
        let err = merge_tenant(None, "t1", &parsed(&["--region", "us"])).unwrap_err();
        assert!(err.to_string().contains("--name"));
    }

    #[test]
    fn update_keeps_unspecified_fields() {
        let existing = TenantConfig {
            tenant_id: "t1".into(),
            name: "Acme".into(),
            folder_id: Some(3),
            region: Some("us".into()),
            customer_id: Some("c-1".into()),
            soar_url: None,
            bindplane_url: None,
        };
        let merged = merge_tenant(Some(existing), "t1", &parsed(&["--soar-url", "https://soar"])).unwrap();
        assert_eq!(merged.name, "Acme");
        assert_eq!(merged.folder_id, Some(3));
        assert_eq!(merged.region.as_deref(), Some("us"));
        assert_eq!(merged.soar_url.as_deref(), Some("https://soar"));
    }
}
