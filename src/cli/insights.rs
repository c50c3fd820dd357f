use anyhow::{Result, bail};
use console::style;

use super::reports::show_created;
use super::{App, ParsedArgs, parse_id};
use crate::core::store::types::{Insight, NewInsight};
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};

fn insight_help() {
    GuideSection::new("vigil insight")
        .command("add <title> --prompt P --audit NAME...", "Save a cross-audit question")
        .info("  --exclude FIELD... drops fields from every source before summarizing")
        .command("update <id> [--title T] [--prompt P] [--audit NAME...]", "Change an insight")
        .command("list", "List saved insights")
        .command("show <id>", "Print an insight")
        .command("delete <id>", "Delete an insight")
        .command("run <tenant> <id> [--quiet]", "Generate an insight report")
        .print();
    println!();
}

/// Start from `existing` and overwrite whatever flags were given.
fn merge_insight(existing: Option<&Insight>, args: &ParsedArgs) -> NewInsight {
    let mut insight = match existing {
        Some(i) => NewInsight {
            title: i.title.clone(),
            prompt: i.prompt.clone(),
            excluded_fields: i.excluded_fields.clone(),
            audit_sources: i.audit_sources.clone(),
        },
        None => NewInsight {
            title: String::new(),
            prompt: String::new(),
            excluded_fields: Vec::new(),
            audit_sources: Vec::new(),
        },
    };
    if let Some(title) = args.value("title") {
        insight.title = title.to_string();
    }
    if let Some(prompt) = args.value("prompt") {
        insight.prompt = prompt.to_string();
    }
    let audits = args.values("audit");
    if !audits.is_empty() {
        insight.audit_sources = audits;
    }
    if args.switch("exclude") {
        insight.excluded_fields.clear();
    } else {
        let excluded = args.values("exclude");
        if !excluded.is_empty() {
            insight.excluded_fields = excluded;
        }
    }
    insight
}

pub async fn run_insight_command(app: &App, sub_cmd: &str, args: &ParsedArgs) -> Result<()> {
    match sub_cmd {
        "add" => {
            let Some(title) = args.positional(0) else {
                bail!("usage: vigil insight add <title> --prompt P --audit NAME...");
            };
            let mut insight = merge_insight(None, args);
            insight.title = title.to_string();
            let id = app.store.create_insight(&insight).await?;
            print_success(&format!("Insight '{}' saved with id {}.", insight.title, id));
            Ok(())
        }
        "update" => {
            let id = parse_id(args.positional(0), "insight id")?;
            let Some(existing) = app.store.get_insight(id).await? else {
                bail!("Insight {} not found", id);
            };
            let insight = merge_insight(Some(&existing), args);
            app.store.update_insight(id, &insight).await?;
            print_success(&format!("Insight {} updated.", id));
            Ok(())
        }
        "list" => {
            let insights = app.store.list_insights().await?;
            if insights.is_empty() {
                print_info("No insights saved.");
                return Ok(());
            }
            let mut section = GuideSection::new("Insights");
            for insight in &insights {
                section = section.status(
                    &format!("#{}", insight.id),
                    &format!(
                        "{} [{}]",
                        style(&insight.title).bold(),
                        insight.audit_sources.join(", ")
                    ),
                );
            }
            section.print();
            println!();
            Ok(())
        }
        "show" => {
            let id = parse_id(args.positional(0), "insight id")?;
            let Some(insight) = app.store.get_insight(id).await? else {
                bail!("Insight {} not found", id);
            };
            let excluded = if insight.excluded_fields.is_empty() {
                "none".to_string()
            } else {
                insight.excluded_fields.join(", ")
            };
            GuideSection::new(&insight.title)
                .status("Sources", &insight.audit_sources.join(", "))
                .status("Excluded", &excluded)
                .print();
            println!("\n{}\n", insight.prompt);
            Ok(())
        }
        "delete" => {
            let id = parse_id(args.positional(0), "insight id")?;
            if app.store.delete_insight(id).await? {
                print_success(&format!("Insight {} deleted.", id));
            } else {
                print_warn(&format!("Insight {} not found.", id));
            }
            Ok(())
        }
        "run" => {
            let Some(tenant_id) = args.positional(0) else {
                bail!("usage: vigil insight run <tenant> <id> [--quiet]");
            };
            let insight_id = parse_id(args.positional(1), "insight id")?;
            let builder = app.report_builder(true).await?;
            let id = builder.build_insight_report(tenant_id, insight_id).await?;
            show_created(app, id, args).await
        }
        _ => {
            insight_help();
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

    fn saved() -> Insight {
        Insight {
            id: 1,
            title: "Coverage".into(),
            prompt: "Which feeds lack parsers?".into(),
            excluded_fields: vec!["etag".into()],
            audit_sources: vec!["Feeds".into(), "Parsers".into()],
        }
    }

    #[test]
    fn new_insight_takes_flags() {
        let insight = merge_insight(
            None,
            &parsed(&["--prompt", "Summarize", "--audit", "Feeds,Rules", "--exclude", "etag"]),
        );
        assert_eq!(insight.prompt, "Summarize");
        assert_eq!(insight.audit_sources, vec!["Feeds", "Rules"]);
        assert_eq!(insight.excluded_fields, vec!["etag"]);
    }

    #[test]
    fn update_keeps_unspecified_fields() {
        let existing = saved();
        let merged = merge_insight(Some(&existing), &parsed(&["--prompt", "Anything stale?"]));
        assert_eq!(merged.title, "Coverage");
        assert_eq!(merged.prompt, "Anything stale?");
        assert_eq!(merged.audit_sources, existing.audit_sources);
        assert_eq!(merged.excluded_fields, existing.excluded_fields);
    }

    #[test]
    fn bare_exclude_clears_the_list() {
        let merged = merge_insight(Some(&saved()), &parsed(&["--exclude"]));
        assert!(merged.excluded_fields.is_empty());
    }
}
