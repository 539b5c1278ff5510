//! Text summary builder for CLI output.
//!
//! Formats the end-of-run counters as human-readable lines for text mode.

use crate::stats::{format_uptime, RunSummary};
use std::time::Duration;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(summary: &RunSummary) -> TextSummary {
    let mut lines = vec![
        "== Run summary ==".to_string(),
        format!("Jobs Completed: {}", summary.jobs_completed),
        format!("Kudos Earned: {:.2}", summary.kudos_earned),
        format!(
            "Uptime: {}",
            format_uptime(Duration::from_secs(summary.uptime_secs))
        ),
    ];
    if let Some(rate) = summary.kudos_per_hour {
        lines.push(format!("Kudos Rate: {rate:.2} / hour"));
    }
    match summary.exit_code {
        Some(code) => lines.push(format!("Exit Code: {code}")),
        None => lines.push("Exit Code: -".to_string()),
    }
    TextSummary { lines }
}
