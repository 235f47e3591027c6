//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use prm_lib::resource::LEVEL_FULL;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table of rows
pub fn print_table<T: Tabled>(items: &[T]) {
    if items.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(items).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Resource level, with the unrestricted level spelled out
pub fn format_level(level: i32) -> String {
    if level == LEVEL_FULL {
        "FULL".green().to_string()
    } else if level == 0 {
        level.to_string().red().to_string()
    } else {
        level.to_string().yellow().to_string()
    }
}

/// Utilization in percent of one cpu, e.g. `250%`
pub fn format_util(util: f64) -> String {
    format!("{:.0}%", util)
}

/// Optional float, `-` when absent
pub fn format_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "ready" => status.green().to_string(),
        "degraded" => status.yellow().to_string(),
        "unhealthy" | "not ready" => status.red().to_string(),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_level_full() {
        colored::control::set_override(false);
        assert_eq!(format_level(LEVEL_FULL), "FULL");
        assert_eq!(format_level(3), "3");
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_util(249.6), "250%");
        assert_eq!(format_opt(None), "-");
        assert_eq!(format_opt(Some(1.234)), "1.23");
    }
}
