//! Terminal output helpers.

use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;

#[derive(Debug, Clone, Copy, Default)]
pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn print(&self, line: &str) {
        println!("{line}");
    }

    pub fn section(&self, title: &str) {
        println!();
        println!("{}", title.bright_white().bold());
        println!("{}", "─".repeat(title.chars().count()).dimmed());
    }

    pub fn info(&self, label: &str, value: &str) {
        println!("  {} {}", label.bright_blue(), value);
    }

    pub fn list_item(&self, item: &str) {
        println!("  {} {}", "•".dimmed(), item);
    }

    pub fn status(&self, message: &str) {
        println!("{}", message.dimmed());
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", "✓".bright_green(), message);
    }

    pub fn warning(&self, message: &str) {
        eprintln!("{} {}", "!".yellow().bold(), message.yellow());
    }
}

/// "in 5m", "2h ago" and so on.
pub fn format_relative_time(at: DateTime<Utc>) -> String {
    let delta = at - Utc::now();
    let secs = delta.num_seconds();
    let magnitude = secs.unsigned_abs();
    let amount = match magnitude {
        0..=59 => format!("{magnitude}s"),
        60..=3599 => format!("{}m", magnitude / 60),
        3600..=86_399 => format!("{}h", magnitude / 3600),
        _ => format!("{}d", magnitude / 86_400),
    };
    if secs >= 0 {
        format!("in {amount}")
    } else {
        format!("{amount} ago")
    }
}
