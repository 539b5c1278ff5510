use crate::catalog::ModelGroup;
use crate::classifier;
use crate::config::WorkerConfig;
use crate::logfile::{LogTail, LOG_FILES};
use crate::model::{now_timestamp, InfoEvent, StatusCategory, WorkerEvent, WorkerState};
use crate::stats::RunStatistics;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

pub const TAB_TITLES: [&str; 5] = ["Dashboard", "Logs", "Models", "Config", "Help"];
pub const TAB_DASHBOARD: usize = 0;
pub const TAB_LOGS: usize = 1;
pub const TAB_MODELS: usize = 2;
pub const TAB_CONFIG: usize = 3;
pub const TAB_HELP: usize = 4;

const MAX_LOG_LINES: usize = 5000;
const MAX_RECENT_JOBS: usize = 20;

/// One rendered line in the log pane.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub text: String,
    pub category: Option<StatusCategory>,
    pub error: bool,
}

/// Where the Logs tab reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Direct,
    File(usize),
}

impl LogSource {
    pub fn label(self) -> &'static str {
        match self {
            LogSource::Direct => "Direct Output",
            LogSource::File(i) => LOG_FILES.get(i).copied().unwrap_or("?"),
        }
    }

    pub fn next(self) -> Self {
        match self {
            LogSource::Direct => LogSource::File(0),
            LogSource::File(i) if i + 1 < LOG_FILES.len() => LogSource::File(i + 1),
            LogSource::File(_) => LogSource::Direct,
        }
    }
}

pub struct UiState {
    pub tab: usize,
    pub worker_state: WorkerState,
    /// Headline status derived from the last status-changing output line.
    pub status: String,
    /// Last informational message, shown in the footer.
    pub info: String,
    pub stats: RunStatistics,
    pub pid: Option<u32>,
    pub script: Option<PathBuf>,
    pub last_exit_code: Option<i32>,
    pub worker_folder: Option<PathBuf>,

    pub log: VecDeque<LogLine>,
    /// Lines scrolled up from the bottom; 0 follows new output.
    pub log_scroll: usize,
    pub auto_scroll: bool,
    pub log_source: LogSource,
    pub file_tail: Option<LogTail>,
    pub recent_jobs: VecDeque<String>,
    /// Last "Processing job" line of the current run.
    pub current_job: Option<String>,
    /// Packages reported missing, awaiting an install confirmation.
    pub pending_install: Option<Vec<String>>,

    pub config: Option<WorkerConfig>,
    pub config_path: Option<PathBuf>,
    pub config_selected: usize,
    /// Input buffer while a config field is being edited.
    pub editing: Option<String>,

    pub models: Option<Vec<ModelGroup>>,
    pub models_scroll: usize,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: TAB_DASHBOARD,
            worker_state: WorkerState::Stopped,
            status: WorkerState::Stopped.label().to_string(),
            info: String::new(),
            stats: RunStatistics::default(),
            pid: None,
            script: None,
            last_exit_code: None,
            worker_folder: None,
            log: VecDeque::new(),
            log_scroll: 0,
            auto_scroll: true,
            log_source: LogSource::Direct,
            file_tail: None,
            recent_jobs: VecDeque::new(),
            current_job: None,
            pending_install: None,
            config: None,
            config_path: None,
            config_selected: 0,
            editing: None,
            models: None,
            models_scroll: 0,
        }
    }
}

impl UiState {
    pub fn push_log(&mut self, line: LogLine) {
        self.log.push_back(line);
        if self.log.len() > MAX_LOG_LINES {
            self.log.pop_front();
        }
        // Keep a scrolled view anchored on the same text.
        if !self.auto_scroll || self.log_scroll > 0 {
            self.log_scroll = (self.log_scroll + 1).min(self.log.len().saturating_sub(1));
        }
    }

    /// Front-end message, timestamped like worker output.
    pub fn push_note(&mut self, msg: impl Into<String>, error: bool) {
        let msg = msg.into();
        self.info = msg.clone();
        self.push_log(LogLine {
            text: format!("[{}] {msg}", now_timestamp()),
            category: None,
            error,
        });
    }

    pub fn scroll_up(&mut self, n: usize) {
        self.log_scroll = (self.log_scroll + n).min(self.log.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(n);
    }

    /// Fold one controller event into the view state.
    pub fn apply_event(&mut self, ev: WorkerEvent, now: Instant) {
        match ev {
            WorkerEvent::StateChanged { state } => {
                self.worker_state = state;
                if matches!(state, WorkerState::Stopped | WorkerState::Stopping | WorkerState::Starting) {
                    self.status = state.label().to_string();
                }
                if state == WorkerState::Stopped {
                    self.pid = None;
                    self.current_job = None;
                }
            }
            WorkerEvent::Started { pid, script } => {
                self.stats.reset(now);
                self.recent_jobs.clear();
                self.current_job = None;
                self.pid = pid;
                self.script = Some(script);
                self.last_exit_code = None;
                self.status = WorkerState::Running.label().to_string();
                self.push_note("Worker process started", false);
            }
            WorkerEvent::Output(s) => {
                self.stats.record_status(&s);
                if let Some(label) = s.category.status_label() {
                    self.status = label.to_string();
                }
                let line = s.display_line();
                if classifier::is_processing_job(&s.text) {
                    self.current_job = Some(s.text.clone());
                }
                if s.category == StatusCategory::JobCompleted || classifier::is_job_activity(&s.text) {
                    self.recent_jobs.push_front(line.clone());
                    self.recent_jobs.truncate(MAX_RECENT_JOBS);
                }
                self.push_log(LogLine {
                    text: line,
                    category: Some(s.category),
                    error: s.category == StatusCategory::Error,
                });
            }
            WorkerEvent::Info(info) => {
                if let InfoEvent::DependenciesMissing { packages } = &info {
                    self.pending_install = Some(packages.clone());
                }
                self.push_note(info.to_message(), info.is_error());
            }
            WorkerEvent::Exited { code, .. } => {
                self.last_exit_code = code;
            }
            WorkerEvent::ConfigLoaded { path, config } => {
                self.config_path = Some(path);
                self.config = Some(*config);
            }
        }
    }

    pub fn config_field_count(&self) -> usize {
        self.config
            .as_ref()
            .map(|c| c.display_fields().len())
            .unwrap_or(0)
    }

    /// Key of the selected config field.
    pub fn selected_config_key(&self) -> Option<&'static str> {
        self.config
            .as_ref()
            .and_then(|c| c.display_fields().get(self.config_selected).map(|(k, _)| *k))
    }
}
