use anyhow::{Context, Result, bail};
use console::style;

use super::{App, ParsedArgs, parse_id};
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};

fn report_help() {
    GuideSection::new("vigil report")
        .command("build <tenant> --audit NAME... [--name T]", "Summarize the latest runs")
        .info("  build, diff and pair accept --quiet to skip printing the report")
        .command("diff <tenant> --audit NAME... [--name T]", "Summarize changes since the previous run")
        .command("pair <run_a> <run_b>", "Summarize changes between two runs")
        .command("list [--tenant T]", "List stored reports")
        .command("show <id>", "Print a report")
        .command("export <id>... [--out FILE]", "Export reports as Markdown")
        .command("rename <id> <name>", "Rename a report")
        .command("delete <id>...", "Delete reports")
        .print();
    println!();
}

fn tenant_and_audits(args: &ParsedArgs, usage: &str) -> Result<(String, Vec<String>)> {
    let Some(tenant_id) = args.positional(0) else {
        bail!("usage: {}", usage);
    };
    let audits = args.values("audit");
    if audits.is_empty() {
        bail!("at least one --audit is required");
    }
    Ok((tenant_id.to_string(), audits))
}

fn parse_ids(raw: &[String]) -> Result<Vec<i64>> {
    raw.iter()
        .map(|id| parse_id(Some(id), "report id"))
        .collect()
}

/// `--quiet` prints only the confirmation line.
pub(super) async fn show_created(app: &App, id: i64, args: &ParsedArgs) -> Result<()> {
    if let Some(report) = app.store.get_report(id).await? {
        print_success(&format!("Report {} saved as '{}'.", id, report.name));
        if !args.switch("quiet") {
            println!("\n{}\n", report.content);
        }
    }
    Ok(())
}

pub async fn run_report_command(app: &App, sub_cmd: &str, args: &ParsedArgs) -> Result<()> {
    match sub_cmd {
        "build" => {
            let (tenant_id, audits) =
                tenant_and_audits(args, "vigil report build <tenant> --audit NAME...")?;
            let builder = app.report_builder(true).await?;
            let id = builder
                .build_report(&tenant_id, &audits, args.value("name"))
                .await?;
            show_created(app, id, args).await
        }
        "diff" => {
            let (tenant_id, audits) =
                tenant_and_audits(args, "vigil report diff <tenant> --audit NAME...")?;
            let builder = app.report_builder(true).await?;
            let id = builder
                .build_diff_report(&tenant_id, &audits, args.value("name"))
                .await?;
            show_created(app, id, args).await
        }
        "pair" => {
            let run_a = parse_id(args.positional(0), "first run id")?;
            let run_b = parse_id(args.positional(1), "second run id")?;
            let builder = app.report_builder(true).await?;
            let id = builder.build_pair_diff_report(run_a, run_b).await?;
            show_created(app, id, args).await
        }
        "list" => {
            let reports = app.store.list_reports(args.value("tenant")).await?;
            if reports.is_empty() {
                print_info("No reports stored.");
                return Ok(());
            }
            let mut section = GuideSection::new("Reports");
            for report in &reports {
                section = section.status(
                    &format!("#{}", report.id),
                    &format!(
                        "{} {} ({}) [{}]",
                        report.created_at.format("%Y-%m-%d %H:%M"),
                        style(&report.name).bold(),
                        report.tenant_id.as_deref().unwrap_or("-"),
                        report.status
                    ),
                );
            }
            section.print();
            println!();
            Ok(())
        }
        "show" => {
            let id = parse_id(args.positional(0), "report id")?;
            let Some(report) = app.store.get_report(id).await? else {
                bail!("Report {} not found", id);
            };
            GuideSection::new(&report.name)
                .status("Generated", &report.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .status("Status", &report.status)
                .print();
            println!("\n{}\n", report.content);
            Ok(())
        }
        "export" => {
            let ids = parse_ids(&args.positional)?;
            if ids.is_empty() {
                bail!("usage: vigil report export <id>... [--out FILE]");
            }
            let markdown = app.store.export_reports(&ids).await?;
            if markdown.is_empty() {
                print_warn("None of the given reports exist.");
                return Ok(());
            }
            match args.value("out") {
                Some(path) => {
                    tokio::fs::write(path, &markdown)
                        .await
                        .with_context(|| format!("failed to write {}", path))?;
                    print_success(&format!("Exported {} report(s) to {}.", ids.len(), path));
                }
                None => println!("{}", markdown),
            }
            Ok(())
        }
        "rename" => {
            let id = parse_id(args.positional(0), "report id")?;
            let name = args.positional[1..].join(" ");
            if name.trim().is_empty() {
                bail!("usage: vigil report rename <id> <name>");
            }
            if app.store.rename_report(id, name.trim()).await? {
                print_success(&format!("Report {} renamed to '{}'.", id, name.trim()));
            } else {
                print_warn(&format!("Report {} not found.", id));
            }
            Ok(())
        }
        "delete" => {
            let ids = parse_ids(&args.positional)?;
            if ids.is_empty() {
                bail!("usage: vigil report delete <id>...");
            }
            let deleted = app.store.delete_reports(&ids).await?;
            print_success(&format!("Deleted {} report(s).", deleted));
            Ok(())
        }
        _ => {
            report_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_must_be_numeric() {
        assert_eq!(parse_ids(&["3".into(), "7".into()]).unwrap(), vec![3, 7]);
        assert!(parse_ids(&["3".into(), "seven".into()]).is_err());
    }

    #[test]
    fn build_needs_tenant_and_audit() {
        let args: Vec<String> = ["t1"].iter().map(|s| s.to_string()).collect();
        let err = tenant_and_audits(&ParsedArgs::parse(&args, 0), "usage").unwrap_err();
        assert!(err.to_string().contains("--audit"));
        assert!(tenant_and_audits(&ParsedArgs::default(), "vigil report build").is_err());
    }
}
