//! Worker output classification.
//!
//! Rules are evaluated top to bottom and the first match wins, so a line that
//! mentions both an error and kudos is reported as an error.

use crate::model::StatusCategory;

/// Marker the worker prints before the kudos awarded for a job.
pub const KUDOS_MARKER: &str = "Kudos earned:";

#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    /// Case-sensitive substring.
    Contains(&'static str),
    /// Substring compared against the lowercased line; the needle must be lowercase.
    ContainsIgnoreCase(&'static str),
    AnyOf(&'static [Matcher]),
    AllOf(&'static [Matcher]),
}

impl Matcher {
    fn matches(&self, line: &str, lower: &str) -> bool {
        match self {
            Matcher::Contains(needle) => line.contains(needle),
            Matcher::ContainsIgnoreCase(needle) => lower.contains(needle),
            Matcher::AnyOf(ms) => ms.iter().any(|m| m.matches(line, lower)),
            Matcher::AllOf(ms) => ms.iter().all(|m| m.matches(line, lower)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub matcher: Matcher,
    pub category: StatusCategory,
}

pub const RULES: &[Rule] = &[
    Rule {
        matcher: Matcher::AnyOf(&[
            Matcher::Contains("Job completed"),
            Matcher::Contains("Finished generating"),
        ]),
        category: StatusCategory::JobCompleted,
    },
    Rule {
        matcher: Matcher::AllOf(&[Matcher::Contains("Waiting for"), Matcher::Contains("jobs")]),
        category: StatusCategory::Online,
    },
    Rule {
        matcher: Matcher::AnyOf(&[
            Matcher::Contains("Starting worker"),
            Matcher::Contains("Initializing"),
        ]),
        category: StatusCategory::Starting,
    },
    Rule {
        matcher: Matcher::AnyOf(&[
            Matcher::ContainsIgnoreCase("error"),
            Matcher::ContainsIgnoreCase("exception"),
        ]),
        category: StatusCategory::Error,
    },
    Rule {
        matcher: Matcher::AnyOf(&[
            Matcher::Contains("WARNING"),
            Matcher::ContainsIgnoreCase("warning"),
        ]),
        category: StatusCategory::Warning,
    },
    Rule {
        matcher: Matcher::Contains("INFO"),
        category: StatusCategory::Info,
    },
    Rule {
        matcher: Matcher::Contains("Loading model"),
        category: StatusCategory::ModelLoading,
    },
    Rule {
        matcher: Matcher::ContainsIgnoreCase("kudos"),
        category: StatusCategory::Kudos,
    },
    Rule {
        matcher: Matcher::ContainsIgnoreCase("maintenance mode"),
        category: StatusCategory::Maintenance,
    },
    Rule {
        matcher: Matcher::AllOf(&[
            Matcher::ContainsIgnoreCase("downloaded"),
            Matcher::ContainsIgnoreCase("model"),
        ]),
        category: StatusCategory::ModelDownload,
    },
];

/// Marker of the line announcing the job currently being generated.
pub const PROCESSING_MARKER: &str = "Processing job";

/// Lines kept in the jobs list, whatever their category.
const JOB_ACTIVITY: Matcher = Matcher::AnyOf(&[
    Matcher::Contains("Job completed"),
    Matcher::Contains("Finished generating"),
    Matcher::Contains(PROCESSING_MARKER),
    Matcher::Contains("Kudos earned"),
]);

pub fn is_job_activity(line: &str) -> bool {
    JOB_ACTIVITY.matches(line, &line.to_lowercase())
}

pub fn is_processing_job(line: &str) -> bool {
    line.contains(PROCESSING_MARKER)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub category: StatusCategory,
    pub kudos: Option<f64>,
}

/// Classify one output line against [`RULES`].
pub fn classify(line: &str) -> Classification {
    classify_with(RULES, line)
}

pub fn classify_with(rules: &[Rule], line: &str) -> Classification {
    let lower = line.to_lowercase();
    let category = rules
        .iter()
        .find(|r| r.matcher.matches(line, &lower))
        .map(|r| r.category)
        .unwrap_or(StatusCategory::Unclassified);

    let kudos = if category.is_job_related() {
        extract_kudos(line)
    } else {
        None
    };

    Classification { category, kudos }
}

/// Parse the number following `Kudos earned:`, if any.
pub fn extract_kudos(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once(KUDOS_MARKER)?;
    let token = rest.split_whitespace().next()?;
    // Tolerate trailing punctuation such as "3.2," or "3.2)".
    let token = token.trim_end_matches(|c: char| !c.is_ascii_digit());
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(line: &str) -> StatusCategory {
        classify(line).category
    }

    #[test]
    fn error_lines() {
        assert_eq!(cat("ERROR: x"), StatusCategory::Error);
        assert_eq!(cat("Traceback: ValueError raised"), StatusCategory::Error);
        assert_eq!(cat("unhandled Exception in thread"), StatusCategory::Error);
    }

    #[test]
    fn kudos_line_extracts_value() {
        let c = classify("Kudos earned: 12.5");
        assert_eq!(c.category, StatusCategory::Kudos);
        assert_eq!(c.kudos, Some(12.5));
    }

    #[test]
    fn unmatched_text_passes_through() {
        let c = classify("random text");
        assert_eq!(c.category, StatusCategory::Unclassified);
        assert_eq!(c.kudos, None);
    }

    #[test]
    fn error_wins_over_kudos() {
        assert_eq!(cat("error while reporting kudos"), StatusCategory::Error);
    }

    #[test]
    fn finished_generating_is_job_with_kudos() {
        let c = classify("Finished generating image, Kudos earned: 3.2");
        assert_eq!(c.category, StatusCategory::JobCompleted);
        assert_eq!(c.kudos, Some(3.2));
    }

    #[test]
    fn job_marker_beats_error_check() {
        assert_eq!(
            cat("Job completed with 0 errors"),
            StatusCategory::JobCompleted
        );
    }

    #[test]
    fn info_marker_is_case_sensitive() {
        assert_eq!(cat("2024 | INFO | pinging"), StatusCategory::Info);
        assert_eq!(cat("some info text"), StatusCategory::Unclassified);
    }

    #[test]
    fn warning_matches_either_case() {
        assert_eq!(cat("WARNING low vram"), StatusCategory::Warning);
        assert_eq!(cat("deprecation warning"), StatusCategory::Warning);
    }

    #[test]
    fn info_precedes_kudos_and_model_loading() {
        assert_eq!(cat("INFO Loading model AlbedoBase"), StatusCategory::Info);
        assert_eq!(cat("INFO total kudos 5"), StatusCategory::Info);
    }

    #[test]
    fn online_requires_both_markers() {
        assert_eq!(cat("Waiting for new jobs"), StatusCategory::Online);
        assert_eq!(cat("Waiting for lock"), StatusCategory::Unclassified);
    }

    #[test]
    fn remaining_categories() {
        assert_eq!(cat("Initializing safety checker"), StatusCategory::Starting);
        assert_eq!(cat("Loading model Deliberate"), StatusCategory::ModelLoading);
        assert_eq!(cat("Entering Maintenance Mode"), StatusCategory::Maintenance);
        assert_eq!(cat("Downloaded Model stable_cascade"), StatusCategory::ModelDownload);
    }

    #[test]
    fn malformed_kudos_value_is_swallowed() {
        let c = classify("Kudos earned: lots");
        assert_eq!(c.category, StatusCategory::Kudos);
        assert_eq!(c.kudos, None);
        assert_eq!(extract_kudos("Kudos earned:"), None);
    }

    #[test]
    fn kudos_not_extracted_for_error_lines() {
        assert_eq!(classify("ERROR Kudos earned: 4").kudos, None);
    }

    #[test]
    fn trailing_punctuation_is_tolerated() {
        assert_eq!(extract_kudos("Kudos earned: 7.25, total 100"), Some(7.25));
    }

    #[test]
    fn custom_rule_table() {
        let rules = [Rule {
            matcher: Matcher::ContainsIgnoreCase("kudos"),
            category: StatusCategory::Kudos,
        }];
        assert_eq!(
            classify_with(&rules, "ERROR kudos").category,
            StatusCategory::Kudos
        );
    }

    #[test]
    fn job_activity_covers_processing_and_kudos_lines() {
        assert!(is_job_activity("Processing job 1234 for model Deliberate"));
        assert!(is_job_activity("Kudos earned: 4.5"));
        assert!(is_job_activity("Job completed"));
        assert!(!is_job_activity("Waiting for new jobs"));
        assert!(is_processing_job("Processing job 1234"));
        assert!(!is_processing_job("Job completed"));
    }
}
