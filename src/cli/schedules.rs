use anyhow::{Result, bail};
use console::style;

use super::{App, ParsedArgs, parse_id};
use crate::core::scheduler::parse_schedule;
use crate::core::store::types::{JobKind, NewSchedule, fmt_ts};
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};

fn schedule_help() {
    GuideSection::new("vigil schedule")
        .command("add <tenant> --cron EXPR --kind KIND --audit NAME...", "Create a schedule")
        .info("  KIND: run-audits | build-report | build-diff-report")
        .info("  --name TEMPLATE names reports; {date} and {time} are filled in")
        .command("list", "List schedules")
        .command("enable|disable <id>", "Toggle a schedule")
        .command("remove <id>", "Delete a schedule")
        .print();
    println!();
}

/// Validate flags into a schedule. The cron expression is checked up front
/// so a typo does not sit silently in the table.
fn new_schedule(args: &ParsedArgs) -> Result<NewSchedule> {
    let Some(tenant_id) = args.positional(0) else {
        bail!("usage: vigil schedule add <tenant> --cron EXPR --kind KIND --audit NAME...");
    };
    let cron = args.require("cron")?;
    parse_schedule(cron)?;
    let kind = args
        .require("kind")?
        .parse::<JobKind>()
        .map_err(anyhow::Error::msg)?;
    let audit_names = args.values("audit");
    if audit_names.is_empty() {
        bail!("at least one --audit is required");
    }
    Ok(NewSchedule {
        tenant_id: tenant_id.to_string(),
        cron: cron.to_string(),
        kind,
        audit_names,
        name_template: args.value("name").map(str::to_string),
    })
}

pub async fn run_schedule_command(app: &App, sub_cmd: &str, args: &ParsedArgs) -> Result<()> {
    match sub_cmd {
        "add" => {
            let new = new_schedule(args)?;
            let id = app.store.create_schedule(&new).await?;
            print_success(&format!(
                "Schedule {} created: {} '{}' for {}.",
                id, new.kind, new.cron, new.tenant_id
            ));
            Ok(())
        }
        "list" => {
            let jobs = app.store.list_schedules().await?;
            if jobs.is_empty() {
                print_info("No schedules defined.");
                return Ok(());
            }
            let mut section = GuideSection::new("Schedules");
            for job in &jobs {
                let state = if job.enabled {
                    style("enabled").green().to_string()
                } else {
                    style("disabled").dim().to_string()
                };
                let last = job
                    .last_triggered
                    .as_ref()
                    .map(fmt_ts)
                    .unwrap_or_else(|| "never".to_string());
                section = section.status(
                    &format!("#{}", job.id),
                    &format!(
                        "{} '{}' {} [{}] {} (last: {})",
                        job.tenant_id,
                        job.cron,
                        job.kind,
                        job.audit_names.join(", "),
                        state,
                        last
                    ),
                );
            }
            section.print();
            println!();
            Ok(())
        }
        "enable" | "disable" => {
            let id = parse_id(args.positional(0), "schedule id")?;
            let enabled = sub_cmd == "enable";
            if app.store.set_schedule_enabled(id, enabled).await? {
                print_success(&format!("Schedule {} {}d.", id, sub_cmd));
            } else {
                print_warn(&format!("Schedule {} not found.", id));
            }
            Ok(())
        }
        "remove" => {
            let id = parse_id(args.positional(0), "schedule id")?;
            if app.store.delete_schedule(id).await? {
                print_success(&format!("Schedule {} removed.", id));
            } else {
                print_warn(&format!("Schedule {} not found.", id));
            }
            Ok(())
        }
        _ => {
            schedule_help();
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
    fn builds_schedule_from_flags() {
        let new = new_schedule(&parsed(&[
            "t1", "--cron", "0 6 * * 1", "--kind", "build-diff-report", "--audit", "Feeds,Rules",
            "--name", "Weekly {date}",
        ]))
        .unwrap();
        assert_eq!(new.tenant_id, "t1");
        assert_eq!(new.kind, JobKind::BuildDiffReport);
        assert_eq!(new.audit_names, vec!["Feeds", "Rules"]);
        assert_eq!(new.name_template.as_deref(), Some("Weekly {date}"));
    }

    #[test]
    fn rejects_bad_cron_and_kind() {
        assert!(new_schedule(&parsed(&["t1", "--cron", "nope", "--kind", "run-audits", "--audit", "A"])).is_err());
        let err = new_schedule(&parsed(&["t1", "--cron", "* * * * *", "--kind", "later", "--audit", "A"]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown job kind"));
    }

    #[test]
    fn needs_an_audit() {
        let err = new_schedule(&parsed(&["t1", "--cron", "* * * * *", "--kind", "run-audits"])).unwrap_err();
        assert!(err.to_string().contains("--audit"));
    }
}
