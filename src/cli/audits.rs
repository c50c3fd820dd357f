use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use super::{App, ParsedArgs, parse_id};
use crate::core::diff::diff_json_labeled;
use crate::core::store::types::{RunStatus, fmt_ts};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};
use crate::core::worker::purge_old_runs;

const DEFAULT_RUN_LIMIT: u32 = 20;

fn audit_help() {
    GuideSection::new("vigil audit")
        .command("run <tenant> [--audit NAME]...", "Run audits (all defined when none given)")
        .command("runs [--tenant T] [--audit NAME] [--limit N]", "List recent runs")
        .command("show <run_id>", "Print a stored run payload")
        .command("list", "List audit definitions")
        .command("import <file.json>", "Seed definitions from a JSON array")
        .print();
    println!();
}

pub async fn run_audit_command(app: &App, sub_cmd: &str, args: &ParsedArgs) -> Result<()> {
    match sub_cmd {
        "run" => run_audits(app, args).await,
        "runs" => list_runs(app, args).await,
        "show" => show_run(app, args).await,
        "list" => list_definitions(app).await,
        "import" => {
            let Some(file) = args.positional(0) else {
                bail!("usage: vigil audit import <file.json>");
            };
            let count = app.store.import_audit_definitions(Path::new(file)).await?;
            print_success(&format!("Imported {} audit definitions.", count));
            Ok(())
        }
        _ => {
            audit_help();
            Ok(())
        }
    }
}

async fn run_audits(app: &App, args: &ParsedArgs) -> Result<()> {
    let Some(tenant_id) = args.positional(0) else {
        bail!("usage: vigil audit run <tenant> [--audit NAME]...");
    };
    let mut audit_names = args.values("audit");
    if audit_names.is_empty() {
        audit_names = app
            .store
            .list_audit_definitions()
            .await?
            .into_iter()
            .map(|d| d.name)
            .collect();
    }
    if audit_names.is_empty() {
        print_warn("No audit definitions found. Run 'vigil audit import <file>' first.");
        return Ok(());
    }

    let runner = app.audit_runner()?;
    let mut failed = 0;
    for name in &audit_names {
        print_info(&format!("Running '{}' for {}...", name, tenant_id));
        match runner.run_audit(tenant_id, name).await {
            Ok(message) => print_success(&message),
            Err(e) => {
                failed += 1;
                print_error(&format!("Audit '{}' failed: {:#}", name, e));
            }
        }
    }
    if failed > 0 {
        print_warn(&format!("{} of {} audits failed.", failed, audit_names.len()));
    }
    Ok(())
}

async fn list_runs(app: &App, args: &ParsedArgs) -> Result<()> {
    let limit = args.parse_value::<u32>("limit")?.unwrap_or(DEFAULT_RUN_LIMIT);
    let runs = app
        .store
        .list_runs(args.value("tenant"), args.value("audit"), limit)
        .await?;
    if runs.is_empty() {
        print_info("No audit runs stored.");
        return Ok(());
    }

    let mut section = GuideSection::new("Audit Runs");
    for run in &runs {
        let status = match run.status {
            RunStatus::Success => style(run.status.as_str()).green().to_string(),
            RunStatus::Failed => style(run.status.as_str()).red().to_string(),
        };
        section = section.status(
            &format!("#{}", run.id),
            &format!(
                "{} {} / {} [{}]",
                fmt_ts(&run.run_timestamp),
                run.tenant_id,
                run.audit_name,
                status
            ),
        );
    }
    section.print();
    println!();
    Ok(())
}

async fn show_run(app: &App, args: &ParsedArgs) -> Result<()> {
    let id = parse_id(args.positional(0), "run id")?;
    let Some(run) = app.store.get_run(id).await? else {
        bail!("Audit run {} not found", id);
    };
    GuideSection::new(&format!("Run #{}", run.id))
        .status("Tenant", &run.tenant_id)
        .status("Audit", &run.audit_name)
        .status("Category", &run.category)
        .status("When", &fmt_ts(&run.run_timestamp))
        .status("Status", run.status.as_str())
        .print();
    println!("\n{}", run.payload);
    Ok(())
}

async fn list_definitions(app: &App) -> Result<()> {
    let defs = app.store.list_audit_definitions().await?;
    if defs.is_empty() {
        print_info("No audit definitions stored.");
        return Ok(());
    }
    let mut category = String::new();
    let mut section: Option<GuideSection> = None;
    for def in defs {
        if def.category != category {
            if let Some(done) = section.take() {
                done.print();
            }
            category = def.category.clone();
            section = Some(GuideSection::new(&category));
        }
        let description = def.description.clone().unwrap_or_default();
        section = section.map(|s| s.command(&def.name, &description));
    }
    if let Some(done) = section {
        done.print();
    }
    println!();
    Ok(())
}

pub async fn run_prompt_command(app: &App, sub_cmd: &str, args: &ParsedArgs) -> Result<()> {
    match sub_cmd {
        "set" => {
            let Some(audit_name) = args.positional(0) else {
                bail!("usage: vigil prompt set <audit> (--text TEXT | --file PATH) [--exclude a,b]");
            };
            let text = match (args.value("text"), args.value("file")) {
                (Some(text), _) => text.to_string(),
                (None, Some(path)) => tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read {}", path))?,
                (None, None) => bail!("--text or --file is required"),
            };
            let excluded = args.values("exclude");
            app.store.set_prompt(audit_name, &text, &excluded).await?;
            print_success(&format!(
                "Prompt for '{}' saved ({} excluded fields).",
                audit_name,
                excluded.len()
            ));
            Ok(())
        }
        "show" => {
            let Some(audit_name) = args.positional(0) else {
                bail!("usage: vigil prompt show <audit>");
            };
            match app.store.get_prompt(audit_name).await? {
                Some(prompt) => {
                    GuideSection::new(&format!("Prompt: {}", audit_name))
                        .status("Excluded", &prompt.excluded_fields.join(", "))
                        .print();
                    println!("\n{}\n", prompt.prompt_text);
                }
                None => print_info(&format!("No prompt set for '{}'.", audit_name)),
            }
            Ok(())
        }
        _ => {
            GuideSection::new("vigil prompt")
                .command("set <audit> --text T [--exclude a,b]", "Set the summary prompt")
                .command("show <audit>", "Print the stored prompt")
                .print();
            println!();
            Ok(())
        }
    }
}

pub async fn purge(app: &App, args: &ParsedArgs) -> Result<()> {
    let Some(days) = args.parse_value::<u32>("older-than-days")? else {
        bail!("usage: vigil purge --older-than-days N [--audit NAME]");
    };
    let status = purge_old_runs(&app.store, days, args.value("audit")).await?;
    print_success(&status);
    Ok(())
}

/// Diff two JSON files on disk; no store or config involved.
pub async fn diff_files(args: &ParsedArgs) -> Result<()> {
    let (Some(old), Some(new)) = (args.positional(0), args.positional(1)) else {
        bail!("usage: vigil diff <old.json> <new.json>");
    };
    let old_text = tokio::fs::read_to_string(old)
        .await
        .with_context(|| format!("failed to read {}", old))?;
    let new_text = tokio::fs::read_to_string(new)
        .await
        .with_context(|| format!("failed to read {}", new))?;
    println!("{}", diff_json_labeled(&old_text, &new_text, old, new));
    Ok(())
}
