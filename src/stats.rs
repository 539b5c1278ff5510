use crate::classifier::Classification;
use crate::model::{StatusCategory, StatusEvent};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Counters for the current worker run. Reset when a new process starts.
#[derive(Debug, Clone)]
pub struct RunStatistics {
    pub jobs_completed: u64,
    pub kudos_earned: f64,
    pub started_at: Option<Instant>,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self {
            jobs_completed: 0,
            kudos_earned: 0.0,
            started_at: None,
        }
    }
}

impl RunStatistics {
    pub fn reset(&mut self, now: Instant) {
        *self = Self {
            started_at: Some(now),
            ..Default::default()
        };
    }

    /// Fold one classified line into the counters.
    /// Returns true when a counter changed.
    pub fn record(&mut self, c: &Classification) -> bool {
        let mut changed = false;
        if c.category == StatusCategory::JobCompleted {
            self.jobs_completed += 1;
            changed = true;
        }
        if let Some(k) = c.kudos {
            self.kudos_earned += k;
            changed = true;
        }
        changed
    }

    pub fn record_status(&mut self, ev: &StatusEvent) -> bool {
        self.record(&Classification {
            category: ev.category,
            kudos: ev.kudos,
        })
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        self.started_at
            .map(|t0| now.saturating_duration_since(t0))
            .unwrap_or_default()
    }

    pub fn kudos_per_hour(&self, now: Instant) -> Option<f64> {
        let secs = self.uptime(now).as_secs();
        if secs == 0 {
            return None;
        }
        Some(self.kudos_earned / secs as f64 * 3600.0)
    }

    pub fn jobs_label(&self) -> String {
        format!("Jobs Completed: {}", self.jobs_completed)
    }

    pub fn kudos_label(&self) -> String {
        format!("Kudos Earned: {:.2}", self.kudos_earned)
    }
}

impl RunStatistics {
    pub fn summary(&self, now: Instant, exit_code: Option<i32>) -> RunSummary {
        RunSummary {
            jobs_completed: self.jobs_completed,
            kudos_earned: self.kudos_earned,
            uptime_secs: self.uptime(now).as_secs(),
            kudos_per_hour: self.kudos_per_hour(now),
            exit_code,
        }
    }
}

/// End-of-run snapshot for headless output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub jobs_completed: u64,
    pub kudos_earned: f64,
    pub uptime_secs: u64,
    pub kudos_per_hour: Option<f64>,
    pub exit_code: Option<i32>,
}

/// Format a duration as `HH:MM:SS`; hours are not wrapped at 24.
pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
