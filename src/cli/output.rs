// Output formatting utilities for CLI
use colored::*;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format for CLI listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse output format from string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown output format \"{}\" (expected table or json)", other),
        }
    }
}

/// Render rows as a table, or as a JSON array.
pub fn render_list<T>(rows: &[T], format: OutputFormat, empty: &str) -> anyhow::Result<String>
where
    T: Tabled + Serialize,
{
    Ok(match format {
        OutputFormat::Table if rows.is_empty() => empty.yellow().to_string(),
        OutputFormat::Table => Table::new(rows).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(rows)?,
    })
}

/// Print a list of rows in the specified format
pub fn print_list<T>(rows: &[T], format: OutputFormat, empty: &str) -> anyhow::Result<()>
where
    T: Tabled + Serialize,
{
    println!("{}", render_list(rows, format, empty)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}
