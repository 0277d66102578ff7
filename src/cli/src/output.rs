//! Terminal output for the GSM CLI: tables, JSON and YAML.

use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    /// Render as a formatted table
    #[default]
    Table,
    /// Render as JSON
    Json,
    /// Render as YAML
    Yaml,
}

pub fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "[INFO]".blue().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "[WARN]".yellow().bold(), msg);
}

/// Render `item` as JSON or YAML text.
pub fn render<T: Serialize + ?Sized>(item: &T, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Table | OutputFormat::Json => serde_json::to_string_pretty(item)?,
        OutputFormat::Yaml => serde_yaml::to_string(item)?,
    })
}

fn print_rendered<T: Serialize + ?Sized>(item: &T, format: OutputFormat) {
    match render(item, format) {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => print_error(&format!("Failed to render output: {}", e)),
    }
}

/// Print rows as a table, or the serialized rows for JSON/YAML.
pub fn print_list<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No results found.".dimmed());
                return;
            }
            let table = Table::new(items)
                .with(Style::rounded())
                .with(Modify::new(Columns::first()).with(Alignment::left()))
                .to_string();
            println!("{}", table);
        }
        _ => print_rendered(items, format),
    }
}

/// Print a single item; tables fall back to pretty JSON.
pub fn print_item<T: Serialize>(item: &T, format: OutputFormat) {
    print_rendered(item, format);
}

pub fn print_detail(key: &str, value: &str) {
    println!("  {}: {}", key.cyan(), value);
}

pub fn print_header(title: &str) {
    println!();
    println!("{}", title.bold().underline());
    println!();
}

/// Color a health status word.
pub fn status_colored(status: &str) -> ColoredString {
    match status {
        "healthy" => status.green(),
        "degraded" => status.yellow(),
        _ => status.red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_json_and_yaml() {
        let item = serde_json::json!({ "host": "www.example.com" });
        assert!(render(&item, OutputFormat::Json).unwrap().contains("\"host\""));
        assert!(render(&item, OutputFormat::Yaml).unwrap().contains("host: www.example.com"));
    }
}
