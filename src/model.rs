use crate::config::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Coarse status category assigned to one line of worker output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    JobCompleted,
    Online,
    Starting,
    Error,
    Warning,
    Info,
    ModelLoading,
    Kudos,
    Maintenance,
    ModelDownload,
    Unclassified,
}

impl StatusCategory {
    /// Prefix shown in front of the line in the log pane.
    pub fn prefix(self) -> &'static str {
        match self {
            StatusCategory::JobCompleted => "✅ ",
            StatusCategory::Online => "🟢 ",
            StatusCategory::Starting => "⏳ ",
            StatusCategory::Error => "⚠️ ERROR: ",
            StatusCategory::Warning => "⚠️ WARNING: ",
            StatusCategory::Info => "",
            StatusCategory::ModelLoading => "🔄 Loading model: ",
            StatusCategory::Kudos => "💰 ",
            StatusCategory::Maintenance => "⚠️ MAINTENANCE: ",
            StatusCategory::ModelDownload => "📥 ",
            StatusCategory::Unclassified => "",
        }
    }

    /// Worker status label for categories that change the headline status.
    pub fn status_label(self) -> Option<&'static str> {
        match self {
            StatusCategory::Online => Some("Worker is online and waiting for jobs"),
            StatusCategory::Starting => Some("Worker initialization in progress"),
            StatusCategory::Maintenance => Some("Worker is in maintenance mode"),
            StatusCategory::ModelLoading => Some("Loading models"),
            _ => None,
        }
    }

    pub fn is_job_related(self) -> bool {
        matches!(self, StatusCategory::JobCompleted | StatusCategory::Kudos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One classified line of worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub timestamp: String,
    pub text: String,
    pub category: StatusCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kudos: Option<f64>,
    pub stream: OutputStream,
}

impl StatusEvent {
    /// Text as rendered in the log pane: timestamp, category prefix, line.
    pub fn display_line(&self) -> String {
        format!("[{}] {}{}", self.timestamp, self.category.prefix(), self.text)
    }
}

/// Lifecycle of the supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    pub fn label(self) -> &'static str {
        match self {
            WorkerState::Stopped => "Not Running",
            WorkerState::Starting => "Starting",
            WorkerState::Running => "Running",
            WorkerState::Stopping => "Stopping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerEvent {
    StateChanged {
        state: WorkerState,
    },
    Started {
        pid: Option<u32>,
        script: PathBuf,
    },
    Output(StatusEvent),
    Info(InfoEvent),
    Exited {
        code: Option<i32>,
        requested: bool,
    },
    ConfigLoaded {
        path: PathBuf,
        #[serde(serialize_with = "crate::config::serialize_masked")]
        config: Box<WorkerConfig>,
    },
}

/// Structured messages emitted by the controller and consumed by UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    Warning(String),
    Error(String),
    StartingWith { script: PathBuf, strategy: String },
    ScriptNotFound { folder: PathBuf },
    WorkerFolderNotSet,
    AlreadyRunning,
    InstallingDependency { package: String },
    DependencyInstalled { package: String },
    DependencyFailed { package: String, detail: String },
    DependenciesMissing { packages: Vec<String> },
    ConfigSaved { path: PathBuf },
    NotRunning,
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Warning(msg) => format!("Warning: {msg}"),
            InfoEvent::Error(msg) => format!("Error: {msg}"),
            InfoEvent::StartingWith { script, strategy } => {
                let name = script
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| script.display().to_string());
                format!("Starting worker using {strategy}: {name}...")
            }
            InfoEvent::ScriptNotFound { folder } => {
                format!("Could not find a worker script in {}", folder.display())
            }
            InfoEvent::WorkerFolderNotSet => "Please select the worker folder first.".into(),
            InfoEvent::AlreadyRunning => "Worker is already running".into(),
            InfoEvent::InstallingDependency { package } => format!("Installing {package}..."),
            InfoEvent::DependencyInstalled { package } => {
                format!("Successfully installed {package}")
            }
            InfoEvent::DependencyFailed { package, detail } => {
                format!("Could not install {package}: {detail}")
            }
            InfoEvent::DependenciesMissing { packages } => format!(
                "Worker not started. The following required packages are missing: {}",
                packages.join(", ")
            ),
            InfoEvent::ConfigSaved { path } => format!("Configuration saved: {}", path.display()),
            InfoEvent::NotRunning => "Worker is not running".into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            InfoEvent::Error(_)
                | InfoEvent::DependencyFailed { .. }
                | InfoEvent::DependenciesMissing { .. }
                | InfoEvent::ScriptNotFound { .. }
                | InfoEvent::WorkerFolderNotSet
        )
    }
}

/// Local wall-clock timestamp used for status lines.
pub fn now_timestamp() -> String {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    now.format(time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| "now".into())
}
