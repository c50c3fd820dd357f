mod app;
mod audits;
mod daemon;
mod insights;
mod reports;
mod schedules;
mod tenants;

use anyhow::Result;
use console::style;

use crate::core::terminal::{GuideSection, print_error};

pub(crate) use app::App;

fn print_help() {
    GuideSection::new("Pipeline")
        .command("daemon", "Run the scheduler and worker pool until Ctrl+C")
        .command("tick", "Evaluate every enabled schedule once, now")
        .command("purge", "Delete audit runs older than N days")
        .print();

    GuideSection::new("Audits")
        .command("audit run", "Run audits for a tenant and store the results")
        .command("audit runs", "List stored audit runs")
        .command("audit import", "Seed audit definitions from a JSON file")
        .command("prompt set", "Set the summary prompt and excluded fields")
        .command("diff", "Compare two JSON files")
        .print();

    GuideSection::new("Reports")
        .command("report build", "Summarize the latest runs into a report")
        .command("report diff", "Summarize changes between the last two runs")
        .command("report pair", "Summarize changes between two specific runs")
        .command("report list|show", "Browse stored reports")
        .command("report export", "Export reports as one Markdown document")
        .command("report rename|delete", "Manage stored reports")
        .command("insight add|list|show", "Save questions asked across several audits")
        .command("insight run", "Answer an insight from the latest runs")
        .print();

    GuideSection::new("Configuration")
        .command("tenant set|show|lineage", "Manage tenants and their hierarchy")
        .command("tenant org|folder", "Create organizations and folders")
        .command("tenant discover", "Register tenants found in an organization")
        .command("secret set", "Store a tenant credential or the LLM key")
        .command("schedule add|list", "Create and list schedules")
        .command("schedule enable|disable|remove", "Manage a schedule")
        .print();

    println!(
        "\n {} {} <command> [subcommand] [--flags]\n",
        style("Usage:").bold(),
        style("vigil").green()
    );
}

/// Positional arguments and `--flag value` pairs after a command prefix.
/// A flag followed by another flag (or nothing) is a switch.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct ParsedArgs {
    pub positional: Vec<String>,
    flags: Vec<(String, String)>,
    switches: Vec<String>,
}

impl ParsedArgs {
    pub fn parse(args: &[String], start: usize) -> Self {
        let mut parsed = ParsedArgs::default();
        let mut i = start;
        while i < args.len() {
            let arg = &args[i];
            if let Some(name) = arg.strip_prefix("--") {
                if i + 1 < args.len() && !args[i + 1].starts_with("--") {
                    parsed.flags.push((name.to_string(), args[i + 1].clone()));
                    i += 2;
                } else {
                    parsed.switches.push(name.to_string());
                    i += 1;
                }
            } else {
                parsed.positional.push(arg.clone());
                i += 1;
            }
        }
        parsed
    }

    /// Last value given for `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for a repeatable flag; comma-separated lists are split.
    pub fn values(&self, name: &str) -> Vec<String> {
        self.flags
            .iter()
            .filter(|(k, _)| k == name)
            .flat_map(|(_, v)| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn switch(&self, name: &str) -> bool {
        self.switches.iter().any(|s| s == name)
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&str> {
        self.value(name)
            .ok_or_else(|| anyhow::anyhow!("--{} is required", name))
    }

    pub fn parse_value<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.value(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| anyhow::anyhow!("invalid --{} '{}': {}", name, raw, e))
            })
            .transpose()
    }
}

pub(crate) fn parse_id(raw: Option<&str>, what: &str) -> Result<i64> {
    let raw = raw.ok_or_else(|| anyhow::anyhow!("missing {}", what))?;
    raw.parse::<i64>()
        .map_err(|_| anyhow::anyhow!("invalid {} '{}'", what, raw))
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    match cmd {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "diff" => audits::diff_files(&ParsedArgs::parse(&args, 2)).await,
        "daemon" => {
            let app = App::bootstrap(true).await?;
            daemon::run_daemon(&app).await
        }
        "tick" => {
            let app = App::bootstrap(true).await?;
            daemon::run_single_tick(&app).await
        }
        "purge" => {
            let app = App::bootstrap(false).await?;
            audits::purge(&app, &ParsedArgs::parse(&args, 2)).await
        }
        "audit" => {
            let app = App::bootstrap(false).await?;
            audits::run_audit_command(&app, sub_cmd, &ParsedArgs::parse(&args, 3)).await
        }
        "prompt" => {
            let app = App::bootstrap(false).await?;
            audits::run_prompt_command(&app, sub_cmd, &ParsedArgs::parse(&args, 3)).await
        }
        "tenant" => {
            let app = App::bootstrap(false).await?;
            tenants::run_tenant_command(&app, sub_cmd, &ParsedArgs::parse(&args, 3)).await
        }
        "secret" => {
            let app = App::bootstrap(false).await?;
            tenants::run_secret_command(&app, sub_cmd, &ParsedArgs::parse(&args, 3)).await
        }
        "schedule" => {
            let app = App::bootstrap(false).await?;
            schedules::run_schedule_command(&app, sub_cmd, &ParsedArgs::parse(&args, 3)).await
        }
        "report" => {
            let app = App::bootstrap(false).await?;
            reports::run_report_command(&app, sub_cmd, &ParsedArgs::parse(&args, 3)).await
        }
        "insight" => {
            let app = App::bootstrap(false).await?;
            insights::run_insight_command(&app, sub_cmd, &ParsedArgs::parse(&args, 3)).await
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
