//! Static view of the worker's own log files under `<worker>/logs`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Log files the worker writes: `bridge*` carry everything, `trace*` only
/// warnings and errors.
pub const LOG_FILES: &[&str] = &[
    "bridge.log",
    "bridge_1.log",
    "bridge_2.log",
    "trace.log",
    "trace_1.log",
    "trace_2.log",
];

pub const TAIL_LINES: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTail {
    pub path: PathBuf,
    pub lines: Vec<String>,
    pub total: usize,
}

impl LogTail {
    pub fn truncated(&self) -> bool {
        self.total > self.lines.len()
    }
}

pub fn log_path(folder: &Path, name: &str) -> PathBuf {
    crate::shell::logs_dir(folder).join(name)
}

/// Last `max` lines of `path`, decoding invalid UTF-8 lossily.
pub fn tail(path: &Path, max: usize) -> Result<LogTail> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(max);
    Ok(LogTail {
        path: path.to_path_buf(),
        lines: all[start..].iter().map(|l| l.trim_end().to_string()).collect(),
        total: all.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TempDir;

    #[test]
    fn keeps_only_the_last_lines() {
        let dir = TempDir::new("logtail");
        let body: String = (0..620).map(|i| format!("line {i}\n")).collect();
        let path = dir.write("logs/bridge.log", &body);
        let t = tail(&path, TAIL_LINES).unwrap();
        assert_eq!(t.total, 620);
        assert_eq!(t.lines.len(), 500);
        assert_eq!(t.lines[0], "line 120");
        assert_eq!(t.lines.last().map(String::as_str), Some("line 619"));
        assert!(t.truncated());
    }

    #[test]
    fn short_file_is_returned_whole() {
        let dir = TempDir::new("logtail-short");
        let path = dir.write("logs/trace.log", "a\r\nb\n");
        let t = tail(&path, TAIL_LINES).unwrap();
        assert_eq!(t.lines, ["a", "b"]);
        assert!(!t.truncated());
        assert_eq!(log_path(dir.path(), "trace.log"), path);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new("logtail-missing");
        assert!(tail(&log_path(dir.path(), "bridge.log"), 10).is_err());
    }
}
