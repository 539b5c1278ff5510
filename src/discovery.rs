//! Locating the worker installation and its launcher script.

use crate::supervisor::Platform;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INSTALL_DIR_NAME: &str = "horde-worker-reGen";
const ARCHIVE_DIR_NAME: &str = "horde-worker-reGen-main";

/// Files whose presence marks a directory as a worker installation.
pub const INSTALL_MARKERS: &[&str] = &[
    "horde-bridge.cmd",
    "horde-bridge.sh",
    "bridgeData_template.yaml",
    "run_worker.py",
];

const WINDOWS_SCRIPTS: &[&str] = &["horde-bridge.cmd", "horde-bridge-directml.cmd", "run_worker.py"];
const UNIX_SCRIPTS: &[&str] = &["horde-bridge.sh", "horde-bridge-rocm.sh", "run_worker.py"];
const PACKAGE_SCRIPT: &str = "horde_worker_regen/run_worker.py";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("worker folder not set")]
    WorkerFolderNotSet,
    #[error("worker folder does not exist: {}", .0.display())]
    FolderMissing(PathBuf),
    #[error("no worker script found in {}", folder.display())]
    ScriptNotFound { folder: PathBuf, tried: Vec<PathBuf> },
}

/// Launcher scripts to try, in order, for `platform`.
pub fn script_candidates(folder: &Path, platform: Platform) -> Vec<PathBuf> {
    let names = match platform {
        Platform::Windows => WINDOWS_SCRIPTS,
        Platform::Unix => UNIX_SCRIPTS,
    };
    names
        .iter()
        .chain(std::iter::once(&PACKAGE_SCRIPT))
        .map(|name| folder.join(name))
        .collect()
}

/// First existing launcher script in `folder`.
pub fn resolve_script(folder: Option<&Path>, platform: Platform) -> Result<PathBuf, DiscoveryError> {
    let folder = folder
        .filter(|f| !f.as_os_str().is_empty())
        .ok_or(DiscoveryError::WorkerFolderNotSet)?;
    if !folder.is_dir() {
        return Err(DiscoveryError::FolderMissing(folder.to_path_buf()));
    }
    let tried = script_candidates(folder, platform);
    match tried.iter().find(|p| p.is_file()) {
        Some(script) => {
            tracing::debug!(script = %script.display(), "resolved worker script");
            Ok(script.clone())
        }
        None => Err(DiscoveryError::ScriptNotFound {
            folder: folder.to_path_buf(),
            tried,
        }),
    }
}

pub fn is_installation(dir: &Path) -> bool {
    dir.is_dir() && INSTALL_MARKERS.iter().any(|m| dir.join(m).is_file())
}

/// Conventional install locations, most likely first.
pub fn installation_candidates(home: &Path, platform: Platform) -> Vec<PathBuf> {
    let mut out = vec![
        home.join(INSTALL_DIR_NAME),
        home.join("Downloads").join(INSTALL_DIR_NAME),
    ];
    match platform {
        Platform::Windows => {
            out.push(PathBuf::from("C:/").join(INSTALL_DIR_NAME));
            out.push(PathBuf::from("D:/").join(INSTALL_DIR_NAME));
        }
        Platform::Unix => {
            out.push(home.join("projects").join(INSTALL_DIR_NAME));
            out.push(PathBuf::from("/opt").join(INSTALL_DIR_NAME));
        }
    }
    out.push(home.join(ARCHIVE_DIR_NAME));
    out
}

pub fn discover_in(home: &Path, platform: Platform) -> Option<PathBuf> {
    installation_candidates(home, platform)
        .into_iter()
        .find(|dir| is_installation(dir))
}

/// Search the conventional locations under the user's home directory.
pub fn discover_installation() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let found = discover_in(&home, Platform::current());
    match &found {
        Some(dir) => tracing::info!(folder = %dir.display(), "found worker installation"),
        None => tracing::info!("no worker installation found in default locations"),
    }
    found
}
