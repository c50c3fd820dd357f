use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

/// A titled block of aligned rows for help screens and command summaries.
pub struct GuideSection {
    title: String,
    rows: Vec<GuideRow>,
}

enum GuideRow {
    Command(String, String),
    Status(String, String),
    Info(String),
    Blank,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows
            .push(GuideRow::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.rows
            .push(GuideRow::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn info(mut self, text: &str) -> Self {
        self.rows.push(GuideRow::Info(text.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.rows.push(GuideRow::Blank);
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .rows
            .iter()
            .filter_map(|r| match r {
                GuideRow::Command(name, _) => Some(name.len()),
                GuideRow::Status(label, _) => Some(label.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        for row in &self.rows {
            match row {
                GuideRow::Command(name, desc) => {
                    println!(
                        "   {:width$}  {}",
                        style(name).green().bold(),
                        style(desc).dim(),
                        width = width
                    );
                }
                GuideRow::Status(label, value) => {
                    println!("   {:width$}  {}", style(label).cyan(), value, width = width);
                }
                GuideRow::Info(text) => println!("   {}", text),
                GuideRow::Blank => println!(),
            }
        }
    }
}
