//! Application-level orchestration.
//!
//! This module owns the worker lifecycle (start/stop/restart) and start
//! preparation such as script resolution, config persistence and the
//! dependency bootstrap. UI/CLI layers call into this module to keep
//! responsibilities separated.

mod controller;
mod prepare;

pub(crate) use controller::{run_controller, UiCommand};

use crate::config;
use crate::supervisor::StartOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Everything the controller needs, resolved once from CLI arguments and the
/// settings cache.
#[derive(Debug, Clone)]
pub(crate) struct ControllerOptions {
    pub worker_folder: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub start: StartOptions,
    pub stop_grace: Duration,
    pub start_on_launch: bool,
    /// Check the worker's runtime packages before every start.
    pub check_dependencies: bool,
}

impl ControllerOptions {
    /// Explicit config file, else `bridgeData.yaml` in the worker folder.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config_file
            .clone()
            .or_else(|| self.worker_folder.as_deref().map(config::config_path))
    }
}
