//! Start preparation.
//!
//! Everything that must succeed before a worker process is spawned: locating
//! the launcher, user-confirmed package installs, the optional runtime
//! dependency check, persisting the configuration, and the bootstrap for
//! interpreter launches. Failures are reported as events and abort the start;
//! nothing here is fatal to the front-end.

use super::ControllerOptions;
use crate::config::{self, WorkerConfig};
use crate::discovery::{self, DiscoveryError};
use crate::model::{InfoEvent, WorkerEvent};
use crate::supervisor::{bootstrap, LaunchPlan, LaunchStrategy, Supervisor};
use std::path::Path;
use tokio::sync::mpsc::UnboundedSender;

fn emit(tx: &UnboundedSender<WorkerEvent>, info: InfoEvent) {
    let _ = tx.send(WorkerEvent::Info(info));
}

/// Per-run preparation switches decided by the controller.
#[derive(Debug, Clone, Default)]
pub(crate) struct StartRequest {
    /// Write the in-memory config before launch. Off while the file on disk
    /// could not be read, so it is never replaced by defaults.
    pub save_config: bool,
    /// Packages the user agreed to install before this start.
    pub install: Vec<String>,
}

/// Resolve, save and bootstrap. `None` means the start was aborted and the
/// reason has already been emitted.
pub(crate) async fn prepare_start(
    opts: &ControllerOptions,
    supervisor: &Supervisor,
    config: &WorkerConfig,
    request: &StartRequest,
    event_tx: &UnboundedSender<WorkerEvent>,
) -> Option<LaunchPlan> {
    let script = match discovery::resolve_script(
        opts.worker_folder.as_deref(),
        supervisor.options().platform,
    ) {
        Ok(script) => script,
        Err(DiscoveryError::WorkerFolderNotSet) => {
            emit(event_tx, InfoEvent::WorkerFolderNotSet);
            return None;
        }
        Err(DiscoveryError::ScriptNotFound { folder, tried }) => {
            tracing::warn!(folder = %folder.display(), tried = tried.len(), "no worker script");
            emit(event_tx, InfoEvent::ScriptNotFound { folder });
            return None;
        }
        Err(e) => {
            emit(event_tx, InfoEvent::Error(e.to_string()));
            return None;
        }
    };

    let python = &supervisor.options().python;
    for package in &request.install {
        if !install_one(python, package, event_tx).await {
            return None;
        }
    }

    if opts.check_dependencies {
        let missing = bootstrap::missing_modules(python, bootstrap::RUNTIME_MODULES).await;
        if !missing.is_empty() {
            let packages = missing.iter().map(|(_, p)| p.to_string()).collect();
            emit(event_tx, InfoEvent::DependenciesMissing { packages });
            return None;
        }
    }

    match opts.config_path() {
        Some(path) if request.save_config => match config::save(config, &path) {
            Ok(()) => emit(event_tx, InfoEvent::ConfigSaved { path }),
            Err(e) => emit(
                event_tx,
                InfoEvent::Warning(format!("Could not save configuration: {e}")),
            ),
        },
        Some(path) => {
            tracing::warn!(path = %path.display(), "unreadable configuration left untouched");
            emit(
                event_tx,
                InfoEvent::Warning(format!(
                    "{} could not be read and was not saved; the worker uses the file as it is",
                    path.display()
                )),
            );
        }
        None => {}
    }

    let plan = match supervisor.plan(&script) {
        Ok(plan) => plan,
        Err(e) => {
            emit(event_tx, InfoEvent::Error(e.to_string()));
            return None;
        }
    };

    if plan.strategy == LaunchStrategy::Interpreter
        && !ensure_dependencies(supervisor, event_tx).await
    {
        return None;
    }

    emit(
        event_tx,
        InfoEvent::StartingWith {
            script: plan.script.clone(),
            strategy: plan.strategy.describe().to_string(),
        },
    );
    Some(plan)
}

async fn install_one(python: &Path, package: &str, event_tx: &UnboundedSender<WorkerEvent>) -> bool {
    emit(
        event_tx,
        InfoEvent::InstallingDependency {
            package: package.to_string(),
        },
    );
    match bootstrap::install_package(python, package).await {
        Ok(()) => {
            emit(
                event_tx,
                InfoEvent::DependencyInstalled {
                    package: package.to_string(),
                },
            );
            true
        }
        Err(detail) => {
            emit(
                event_tx,
                InfoEvent::DependencyFailed {
                    package: package.to_string(),
                    detail,
                },
            );
            false
        }
    }
}

/// Install missing critical modules once each. False when any install failed.
async fn ensure_dependencies(supervisor: &Supervisor, event_tx: &UnboundedSender<WorkerEvent>) -> bool {
    let python = &supervisor.options().python;
    for (module, package) in bootstrap::missing_modules(python, bootstrap::CRITICAL_MODULES).await {
        tracing::info!(module, package, "critical module missing");
        if !install_one(python, package, event_tx).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{Platform, StartOptions};
    use crate::test_support::TempDir;
    use std::path::PathBuf;
    use std::time::Duration;

    fn options(folder: Option<PathBuf>) -> ControllerOptions {
        ControllerOptions {
            worker_folder: folder,
            config_file: None,
            start: StartOptions {
                platform: Platform::Unix,
                ..Default::default()
            },
            stop_grace: Duration::from_secs(1),
            start_on_launch: false,
            check_dependencies: false,
        }
    }

    fn saving() -> StartRequest {
        StartRequest {
            save_config: true,
            install: Vec::new(),
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<InfoEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let WorkerEvent::Info(info) = ev {
                out.push(info);
            }
        }
        out
    }

    #[tokio::test]
    async fn unset_folder_aborts_before_anything_else() {
        let opts = options(None);
        let sup = Supervisor::new(opts.start.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let plan = prepare_start(&opts, &sup, &WorkerConfig::default(), &saving(), &tx).await;
        assert!(plan.is_none());
        let infos = drain(&mut rx);
        assert_eq!(infos.len(), 1);
        assert!(matches!(infos[0], InfoEvent::WorkerFolderNotSet));
    }

    #[tokio::test]
    async fn missing_script_is_reported() {
        let dir = TempDir::new("prep-noscript");
        let opts = options(Some(dir.path().to_path_buf()));
        let sup = Supervisor::new(opts.start.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(prepare_start(&opts, &sup, &WorkerConfig::default(), &saving(), &tx)
            .await
            .is_none());
        let infos = drain(&mut rx);
        assert!(matches!(infos[0], InfoEvent::ScriptNotFound { .. }));
        assert!(!dir.path().join(config::CONFIG_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn config_is_saved_before_launch() {
        let dir = TempDir::new("prep-save");
        dir.write("horde-bridge.sh", "echo hi\n");
        let opts = options(Some(dir.path().to_path_buf()));
        let sup = Supervisor::new(opts.start.clone());
        let mut cfg = WorkerConfig::default();
        cfg.dreamer_name = "prep-test".into();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let plan = prepare_start(&opts, &sup, &cfg, &saving(), &tx).await.expect("plan");
        assert_eq!(plan.strategy, LaunchStrategy::Shell);

        let saved = config::load(&dir.path().join(config::CONFIG_FILE_NAME)).unwrap();
        assert_eq!(saved.dreamer_name, "prep-test");
        let infos = drain(&mut rx);
        assert!(matches!(infos[0], InfoEvent::ConfigSaved { .. }));
        assert!(matches!(infos.last(), Some(InfoEvent::StartingWith { .. })));
    }

    #[tokio::test]
    async fn unreadable_config_is_not_overwritten() {
        let dir = TempDir::new("prep-nosave");
        dir.write("horde-bridge.sh", "echo hi\n");
        let original = "horde_api_key: SECRETKEY123\nmax_threads: [oops\n";
        let path = dir.write(config::CONFIG_FILE_NAME, original);
        let opts = options(Some(dir.path().to_path_buf()));
        let sup = Supervisor::new(opts.start.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let request = StartRequest::default();
        assert!(prepare_start(&opts, &sup, &WorkerConfig::default(), &request, &tx)
            .await
            .is_some());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
        let infos = drain(&mut rx);
        assert!(matches!(infos[0], InfoEvent::Warning(_)));
        assert!(!infos.iter().any(|i| matches!(i, InfoEvent::ConfigSaved { .. })));
    }

    #[tokio::test]
    async fn missing_runtime_packages_abort_the_start() {
        let dir = TempDir::new("prep-deps");
        dir.write("horde-bridge.sh", "echo hi\n");
        let mut opts = options(Some(dir.path().to_path_buf()));
        opts.check_dependencies = true;
        opts.start.python = PathBuf::from("/definitely/not/a/python");
        let sup = Supervisor::new(opts.start.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        assert!(prepare_start(&opts, &sup, &WorkerConfig::default(), &saving(), &tx)
            .await
            .is_none());
        let infos = drain(&mut rx);
        match &infos[0] {
            InfoEvent::DependenciesMissing { packages } => {
                assert_eq!(packages.len(), bootstrap::RUNTIME_MODULES.len());
                assert!(packages.contains(&"pillow".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!dir.path().join(config::CONFIG_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn failed_confirmed_install_aborts_the_start() {
        let dir = TempDir::new("prep-install");
        dir.write("horde-bridge.sh", "echo hi\n");
        let mut opts = options(Some(dir.path().to_path_buf()));
        opts.start.python = PathBuf::from("/definitely/not/a/python");
        let sup = Supervisor::new(opts.start.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let request = StartRequest {
            save_config: true,
            install: vec!["numpy".into()],
        };

        assert!(prepare_start(&opts, &sup, &WorkerConfig::default(), &request, &tx)
            .await
            .is_none());
        let infos = drain(&mut rx);
        assert!(matches!(infos[0], InfoEvent::InstallingDependency { .. }));
        assert!(matches!(infos[1], InfoEvent::DependencyFailed { .. }));
    }
}
