//! Terminal rendering helpers for CLI surfaces.

use crate::core::broker::BrokerEvent;
use crate::core::safety::InjectionResult;
use colored::Colorize;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// One-line verdict, e.g. `BLOCKED 1.00  Role injection (pretend) | Jailbreak keyword`.
pub fn render_verdict(result: &InjectionResult) -> String {
    let tag = if result.blocked {
        "BLOCKED".bright_red().bold()
    } else if result.flagged {
        "FLAGGED".bright_yellow().bold()
    } else {
        "CLEAN".bright_green().bold()
    };
    if result.reasons.is_empty() {
        format!("{} {:.2}", tag, result.score)
    } else {
        format!("{} {:.2}  {}", tag, result.score, result.reasons.join(" | "))
    }
}

pub fn render_event(event: &BrokerEvent) -> String {
    let detail = event
        .detail
        .as_ref()
        .map(|d| compact_line(&d.to_string(), 80))
        .unwrap_or_default();
    format!(
        "{} {:<24} {:<18} {:<16} {}",
        event.ts,
        compact_line(&event.actor, 24),
        event.op,
        event.status,
        detail
    )
}
