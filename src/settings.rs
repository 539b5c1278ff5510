//! Small JSON cache remembering the worker folder between sessions.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "horde-worker-tui";
const SETTINGS_FILE: &str = "gui_settings.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub worker_folder: Option<PathBuf>,
    #[serde(default)]
    pub config_file: Option<PathBuf>,
}

impl AppSettings {
    pub fn for_folder(folder: &Path) -> Self {
        Self {
            worker_folder: Some(folder.to_path_buf()),
            config_file: Some(crate::config::config_path(folder)),
        }
    }

    /// Drop remembered paths that no longer exist on disk.
    pub fn retain_existing(mut self) -> Self {
        if self.worker_folder.as_deref().is_some_and(|p| !p.exists()) {
            self.worker_folder = None;
        }
        if self.config_file.as_deref().is_some_and(|p| !p.exists()) {
            self.config_file = None;
        }
        self
    }
}

pub fn settings_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn settings_path() -> PathBuf {
    settings_dir().join(SETTINGS_FILE)
}

/// Directory for the front-end's own log file.
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("logs")
}

pub fn load() -> Result<AppSettings> {
    load_from(&settings_path())
}

pub fn save(settings: &AppSettings) -> Result<PathBuf> {
    let path = settings_path();
    save_to(&path, settings)?;
    Ok(path)
}

pub fn load_from(path: &Path) -> Result<AppSettings> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let settings: AppSettings =
        serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))?;
    Ok(settings.retain_existing())
}

pub fn save_to(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create settings dir")?;
    }
    let data = serde_json::to_vec_pretty(settings)?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
