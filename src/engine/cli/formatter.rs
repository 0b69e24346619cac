//! CLI Output Formatting Module
//! Consistent, colorized output for terminal UX

use colored::Colorize;
use serde_json::Value;

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.len()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    /// Print one record as indented JSON
    pub fn record(record: &Value) {
        let pretty = serde_json::to_string_pretty(record).unwrap_or_else(|_| record.to_string());
        for line in pretty.lines() {
            println!("  {}", line.bright_white());
        }
    }

    /// Print raw JSON (for scripting)
    pub fn json(value: &Value) {
        println!("{}", value);
    }
}

/// "1 record" / "3 records"
pub fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

/// Summary of a write command. Duplicates skipped by an insert are only
/// logged, so `count` is what was submitted rather than what changed.
pub fn processed(action: &str, collection: &str, count: usize) -> String {
    format!("{} on '{}' processed {}", action, collection, plural(count, "record"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plural() {
        assert_eq!(plural(1, "record"), "1 record");
        assert_eq!(plural(0, "record"), "0 records");
        assert_eq!(plural(3, "key"), "3 keys");
    }

    #[test]
    fn test_processed_does_not_claim_writes() {
        let line = processed("insert", "admins", 3);
        assert_eq!(line, "insert on 'admins' processed 3 records");
        assert!(!line.contains("inserted"));
    }
}
