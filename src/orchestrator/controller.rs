//! Worker lifecycle controller.
//!
//! Owns start/stop/restart orchestration and the in-memory bridge
//! configuration, and emits events for presentation layers.

use super::prepare::{prepare_start, StartRequest};
use super::ControllerOptions;
use crate::classifier;
use crate::config::{self, ConfigError, WorkerConfig};
use crate::model::{now_timestamp, InfoEvent, StatusEvent, WorkerEvent, WorkerState};
use crate::supervisor::{ExitOutcome, OutputLine, Supervisor};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant};

/// Commands emitted by UI layers to control the worker.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Start,
    Stop,
    Restart,
    SetConfig { key: String, value: String },
    SaveConfig,
    ReloadConfig,
    /// Install the listed packages, then start.
    InstallDependencies { packages: Vec<String> },
    Quit,
}

#[derive(Debug, Clone, Copy)]
enum RunControl {
    Stop,
}

/// Internal handle for a supervised run.
struct RunCtx {
    ctrl_tx: UnboundedSender<RunControl>,
    handle: Option<tokio::task::JoinHandle<Option<ExitOutcome>>>,
}

/// Grace between process exit and abandoning pipes a descendant still holds.
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(1);

pub(crate) fn to_status_event(line: OutputLine) -> StatusEvent {
    let c = classifier::classify(&line.text);
    StatusEvent {
        timestamp: now_timestamp(),
        text: line.text,
        category: c.category,
        kudos: c.kudos,
        stream: line.stream,
    }
}

fn send_state(tx: &UnboundedSender<WorkerEvent>, state: WorkerState) {
    let _ = tx.send(WorkerEvent::StateChanged { state });
}

fn send_info(tx: &UnboundedSender<WorkerEvent>, info: InfoEvent) {
    let _ = tx.send(WorkerEvent::Info(info));
}

/// Spawn a new supervised run and return its control handle.
fn start_run(
    opts: Arc<ControllerOptions>,
    config: WorkerConfig,
    request: StartRequest,
    event_tx: UnboundedSender<WorkerEvent>,
) -> RunCtx {
    let (ctrl_tx, ctrl_rx) = tokio::sync::mpsc::unbounded_channel::<RunControl>();
    send_state(&event_tx, WorkerState::Starting);
    let handle = tokio::spawn(async move {
        supervise(&opts, &config, &request, event_tx, ctrl_rx).await
    });
    RunCtx {
        ctrl_tx,
        handle: Some(handle),
    }
}

/// One worker run: prepare, spawn, forward classified output until the
/// merged stream closes, then reap.
async fn supervise(
    opts: &ControllerOptions,
    config: &WorkerConfig,
    request: &StartRequest,
    event_tx: UnboundedSender<WorkerEvent>,
    mut ctrl_rx: UnboundedReceiver<RunControl>,
) -> Option<ExitOutcome> {
    let mut supervisor = Supervisor::new(opts.start.clone());
    let plan = prepare_start(opts, &supervisor, config, request, &event_tx).await?;
    let handle = match supervisor.start_plan(plan) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "worker spawn failed");
            send_info(&event_tx, InfoEvent::Error(format!("Failed to start worker: {e}")));
            return None;
        }
    };
    let _ = event_tx.send(WorkerEvent::Started {
        pid: handle.pid(),
        script: handle.plan().script.clone(),
    });
    send_state(&event_tx, WorkerState::Running);

    let mut stop_sent = false;
    let mut exited_at: Option<Instant> = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            line = handle.next_line() => {
                match line {
                    Some(line) => {
                        let _ = event_tx.send(WorkerEvent::Output(to_status_event(line)));
                    }
                    None => break,
                }
            }
            // A closed control channel means the controller is gone; stop as well.
            _ = ctrl_rx.recv(), if !stop_sent => {
                stop_sent = true;
                if let Err(e) = handle.request_stop(opts.stop_grace).await {
                    send_info(&event_tx, InfoEvent::Error(e.to_string()));
                }
            }
            _ = ticker.tick() => {
                if handle.enforce_grace() {
                    send_info(
                        &event_tx,
                        InfoEvent::Warning("Worker did not exit in time, killing it".into()),
                    );
                }
                let now = Instant::now();
                if handle.try_exit().is_some() {
                    let t0 = *exited_at.get_or_insert(now);
                    if now.duration_since(t0) >= DRAIN_AFTER_EXIT {
                        tracing::debug!("worker exited with pipes still open, detaching");
                        handle.detach_readers();
                    }
                }
            }
        }
    }

    supervisor.reap().await
}

/// `Ok(None)` when no config path is known yet.
fn load_config(
    opts: &ControllerOptions,
    prior: &WorkerConfig,
    event_tx: &UnboundedSender<WorkerEvent>,
) -> Result<Option<WorkerConfig>, ConfigError> {
    let Some(path) = opts.config_path() else {
        return Ok(None);
    };
    match config::load_over(&path, prior) {
        Ok(loaded) => {
            if loaded.from_template {
                send_info(
                    event_tx,
                    InfoEvent::Message(format!("Created {} from template", path.display())),
                );
            }
            let _ = event_tx.send(WorkerEvent::ConfigLoaded {
                path,
                config: Box::new(loaded.config.clone()),
            });
            Ok(Some(loaded.config))
        }
        Err(e) => {
            tracing::error!(error = %e, "configuration load failed");
            send_info(event_tx, InfoEvent::Error(e.to_string()));
            Err(e)
        }
    }
}

fn report_exit(event_tx: &UnboundedSender<WorkerEvent>, outcome: ExitOutcome) {
    let _ = event_tx.send(WorkerEvent::Exited {
        code: outcome.code,
        requested: outcome.requested,
    });
    if outcome.is_failure() {
        let msg = match outcome.code {
            Some(code) => format!("Worker process exited with code {code}"),
            None => "Worker process was terminated by a signal".to_string(),
        };
        send_info(event_tx, InfoEvent::Error(msg));
    } else {
        send_info(event_tx, InfoEvent::Message("Worker process ended".into()));
    }
}

/// Orchestrate worker runs based on UI commands and emit events back to presentation layers.
pub(crate) async fn run_controller(
    opts: ControllerOptions,
    event_tx: UnboundedSender<WorkerEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let opts = Arc::new(opts);
    let mut config = WorkerConfig::default();
    // False while the file exists but could not be read; it must not be
    // replaced by the in-memory defaults.
    let mut config_writable = true;
    match load_config(&opts, &config, &event_tx) {
        Ok(Some(loaded)) => config = loaded,
        Ok(None) => {}
        Err(e) => config_writable = e.is_missing(),
    }

    let launch = |config: &WorkerConfig, config_writable: bool, install: Vec<String>| {
        let request = StartRequest {
            save_config: config_writable,
            install,
        };
        start_run(opts.clone(), config.clone(), request, event_tx.clone())
    };

    let mut run_ctx = if opts.start_on_launch {
        Some(launch(&config, config_writable, Vec::new()))
    } else {
        None
    };
    let mut restart_pending = false;
    let mut quit_pending = false;
    // Stop watchdog: if a stop takes too long, keep the UI informed.
    let mut stop_deadline: Option<Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    let request_stop = |ctx: &RunCtx, deadline: &mut Option<Instant>| {
        let _ = ctx.ctrl_tx.send(RunControl::Stop);
        send_state(&event_tx, WorkerState::Stopping);
        send_info(&event_tx, InfoEvent::Message("Stopping worker…".into()));
        *deadline = Some(Instant::now() + opts.stop_grace + Duration::from_secs(1));
    };

    let res = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Start) => {
                        if run_ctx.is_some() {
                            send_info(&event_tx, InfoEvent::AlreadyRunning);
                        } else {
                            run_ctx = Some(launch(&config, config_writable, Vec::new()));
                        }
                    }
                    Some(UiCommand::InstallDependencies { packages }) => {
                        if run_ctx.is_some() {
                            send_info(&event_tx, InfoEvent::AlreadyRunning);
                        } else {
                            run_ctx = Some(launch(&config, config_writable, packages));
                        }
                    }
                    Some(UiCommand::Stop) => {
                        restart_pending = false;
                        match &run_ctx {
                            Some(ctx) => request_stop(ctx, &mut stop_deadline),
                            None => send_info(&event_tx, InfoEvent::NotRunning),
                        }
                    }
                    Some(UiCommand::Restart) => {
                        // Restart is serialized: stop the active run first, then start a new one
                        // once we observe completion. This avoids overlapping worker processes.
                        if let Some(ctx) = &run_ctx {
                            restart_pending = true;
                            request_stop(ctx, &mut stop_deadline);
                        } else {
                            send_info(&event_tx, InfoEvent::Message("Restarting…".into()));
                            run_ctx = Some(launch(&config, config_writable, Vec::new()));
                        }
                    }
                    Some(UiCommand::SetConfig { key, value }) => {
                        match config.set_field(&key, &value) {
                            Ok(()) => {
                                let _ = event_tx.send(WorkerEvent::ConfigLoaded {
                                    path: opts.config_path().unwrap_or_default(),
                                    config: Box::new(config.clone()),
                                });
                            }
                            Err(e) => send_info(&event_tx, InfoEvent::Error(e.to_string())),
                        }
                    }
                    Some(UiCommand::SaveConfig) => match opts.config_path() {
                        Some(path) if !config_writable => send_info(
                            &event_tx,
                            InfoEvent::Error(format!(
                                "{} could not be read; fix it and reload before saving",
                                path.display()
                            )),
                        ),
                        Some(path) => match config::save(&config, &path) {
                            Ok(()) => send_info(&event_tx, InfoEvent::ConfigSaved { path }),
                            Err(e) => send_info(&event_tx, InfoEvent::Error(e.to_string())),
                        },
                        None => send_info(&event_tx, InfoEvent::WorkerFolderNotSet),
                    },
                    Some(UiCommand::ReloadConfig) => {
                        if opts.config_path().is_none() {
                            send_info(&event_tx, InfoEvent::WorkerFolderNotSet);
                        } else {
                            match load_config(&opts, &config, &event_tx) {
                                Ok(Some(fresh)) => {
                                    config = fresh;
                                    config_writable = true;
                                }
                                Ok(None) => {}
                                Err(e) => config_writable = e.is_missing(),
                            }
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        // Quit waits for the current worker to exit so it is never orphaned.
                        quit_pending = true;
                        restart_pending = false;
                        match &run_ctx {
                            Some(ctx) => request_stop(ctx, &mut stop_deadline),
                            None => break Ok(()),
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(ctx) = &mut run_ctx {
                        ctx.handle.take();
                    }
                    match join_res {
                        Ok(Some(outcome)) => report_exit(&event_tx, outcome),
                        Ok(None) => {}
                        Err(e) => {
                            send_info(&event_tx, InfoEvent::Error(format!("Worker task failed: {e}")));
                        }
                    }
                    send_state(&event_tx, WorkerState::Stopped);
                    run_ctx = None;
                    stop_deadline = None;
                    if quit_pending {
                        break Ok(());
                    }
                    if restart_pending {
                        restart_pending = false;
                        run_ctx = Some(launch(&config, config_writable, Vec::new()));
                    }
                }
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = stop_deadline {
                    if Instant::now() >= deadline && run_ctx.is_some() {
                        send_info(&event_tx, InfoEvent::Message("Still stopping…".into()));
                        stop_deadline = None;
                    }
                }
            }
        }
    };

    res
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::StatusCategory;
    use crate::supervisor::{Platform, StartOptions};
    use crate::test_support::TempDir;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn options(folder: Option<PathBuf>, start_on_launch: bool) -> ControllerOptions {
        ControllerOptions {
            worker_folder: folder,
            config_file: None,
            start: StartOptions {
                platform: Platform::Unix,
                ..Default::default()
            },
            stop_grace: Duration::from_secs(2),
            start_on_launch,
            check_dependencies: false,
        }
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>, mut f: F) -> WorkerEvent
    where
        F: FnMut(&WorkerEvent) -> bool,
    {
        loop {
            let ev = tokio::time::timeout(std::time::Duration::from_secs(15), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if f(&ev) {
                return ev;
            }
        }
    }

    fn worker_dir(label: &str, script: &str) -> TempDir {
        let dir = TempDir::new(label);
        dir.write("bridgeData_template.yaml", "dreamer_name: from-template\nmax_threads: 2\n");
        dir.write("horde-bridge.sh", script);
        dir
    }

    #[tokio::test]
    async fn run_forwards_classified_output_and_exit() {
        let dir = worker_dir(
            "ctl-run",
            "echo 'Starting worker'\necho 'Finished generating image, Kudos earned: 3.2'\nexit 0\n",
        );
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            options(Some(dir.path().to_path_buf()), true),
            event_tx,
            cmd_rx,
        ));

        match next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::ConfigLoaded { .. })).await {
            WorkerEvent::ConfigLoaded { config, .. } => {
                assert_eq!(config.dreamer_name, "from-template");
                assert_eq!(config.max_threads, 2);
            }
            _ => unreachable!(),
        }
        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Started { .. })).await;
        let job = next_matching(&mut event_rx, |e| {
            matches!(e, WorkerEvent::Output(s) if s.category == StatusCategory::JobCompleted)
        })
        .await;
        if let WorkerEvent::Output(s) = job {
            assert_eq!(s.kudos, Some(3.2));
        }
        match next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Exited { .. })).await {
            WorkerEvent::Exited { code, requested } => {
                assert_eq!(code, Some(0));
                assert!(!requested);
            }
            _ => unreachable!(),
        }
        next_matching(&mut event_rx, |e| {
            matches!(e, WorkerEvent::StateChanged { state: WorkerState::Stopped })
        })
        .await;
        assert!(dir.path().join(config::CONFIG_FILE_NAME).exists());
        ctl.abort();
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_error() {
        let dir = worker_dir("ctl-fail", "exit 7\n");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            options(Some(dir.path().to_path_buf()), true),
            event_tx,
            cmd_rx,
        ));
        match next_matching(&mut event_rx, |e| {
            matches!(e, WorkerEvent::Info(i) if i.is_error())
        })
        .await
        {
            WorkerEvent::Info(i) => assert_eq!(i.to_message(), "Error: Worker process exited with code 7"),
            _ => unreachable!(),
        }
        ctl.abort();
    }

    #[tokio::test]
    async fn start_without_folder_never_spawns() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(options(None, false), event_tx, cmd_rx));
        cmd_tx.send(UiCommand::Start).unwrap();
        next_matching(&mut event_rx, |e| {
            matches!(e, WorkerEvent::Info(InfoEvent::WorkerFolderNotSet))
        })
        .await;
        next_matching(&mut event_rx, |e| {
            matches!(e, WorkerEvent::StateChanged { state: WorkerState::Stopped })
        })
        .await;
        cmd_tx.send(UiCommand::Quit).unwrap();
        ctl.await.unwrap().unwrap();
        while let Ok(ev) = event_rx.try_recv() {
            assert!(!matches!(ev, WorkerEvent::Started { .. }));
        }
    }

    #[tokio::test]
    async fn double_start_is_rejected_and_quit_stops_worker() {
        let dir = worker_dir("ctl-twice", "echo 'Waiting for new jobs'\nsleep 30\n");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            options(Some(dir.path().to_path_buf()), false),
            event_tx,
            cmd_rx,
        ));
        cmd_tx.send(UiCommand::Start).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Started { .. })).await;
        cmd_tx.send(UiCommand::Start).unwrap();
        next_matching(&mut event_rx, |e| {
            matches!(e, WorkerEvent::Info(InfoEvent::AlreadyRunning))
        })
        .await;

        cmd_tx.send(UiCommand::Quit).unwrap();
        match next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Exited { .. })).await {
            WorkerEvent::Exited { requested, .. } => assert!(requested),
            _ => unreachable!(),
        }
        tokio::time::timeout(std::time::Duration::from_secs(15), ctl)
            .await
            .expect("controller did not quit")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn restart_runs_a_fresh_process() {
        let dir = worker_dir("ctl-restart", "echo up\nsleep 30\n");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            options(Some(dir.path().to_path_buf()), true),
            event_tx,
            cmd_rx,
        ));
        let first = next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Started { .. })).await;
        cmd_tx.send(UiCommand::Restart).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Exited { .. })).await;
        let second = next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Started { .. })).await;
        match (first, second) {
            (WorkerEvent::Started { pid: a, .. }, WorkerEvent::Started { pid: b, .. }) => {
                assert_ne!(a, b)
            }
            _ => unreachable!(),
        }
        cmd_tx.send(UiCommand::Stop).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Exited { .. })).await;
        cmd_tx.send(UiCommand::Stop).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Info(InfoEvent::NotRunning))).await;
        ctl.abort();
    }

    #[tokio::test]
    async fn set_config_updates_and_save_writes() {
        let dir = worker_dir("ctl-config", "exit 0\n");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            options(Some(dir.path().to_path_buf()), false),
            event_tx,
            cmd_rx,
        ));
        cmd_tx
            .send(UiCommand::SetConfig {
                key: "max_power".into(),
                value: "64".into(),
            })
            .unwrap();
        cmd_tx
            .send(UiCommand::SetConfig {
                key: "max_power".into(),
                value: "999".into(),
            })
            .unwrap();
        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Info(i) if i.is_error())).await;
        cmd_tx.send(UiCommand::SaveConfig).unwrap();
        next_matching(&mut event_rx, |e| {
            matches!(e, WorkerEvent::Info(InfoEvent::ConfigSaved { .. }))
        })
        .await;
        let saved = config::load(&dir.path().join(config::CONFIG_FILE_NAME)).unwrap();
        assert_eq!(saved.max_power, 64);
        assert_eq!(saved.dreamer_name, "from-template");
        cmd_tx.send(UiCommand::Quit).unwrap();
        ctl.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreadable_config_survives_auto_start_and_save() {
        let dir = TempDir::new("ctl-badyaml");
        dir.write("horde-bridge.sh", "exit 0\n");
        let original = "horde_api_key: SECRETKEY123\ndreamer_name: mine\nmax_threads: [oops\n";
        let path = dir.write(config::CONFIG_FILE_NAME, original);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            options(Some(dir.path().to_path_buf()), true),
            event_tx,
            cmd_rx,
        ));

        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Exited { .. })).await;
        assert!(std::fs::read_to_string(&path).unwrap().contains("SECRETKEY123"));

        cmd_tx.send(UiCommand::SaveConfig).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::Info(i) if i.is_error())).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);

        std::fs::write(&path, "horde_api_key: SECRETKEY123\ndreamer_name: fixed\n").unwrap();
        cmd_tx.send(UiCommand::ReloadConfig).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, WorkerEvent::ConfigLoaded { .. })).await;
        cmd_tx.send(UiCommand::SaveConfig).unwrap();
        next_matching(&mut event_rx, |e| {
            matches!(e, WorkerEvent::Info(InfoEvent::ConfigSaved { .. }))
        })
        .await;
        let saved = config::load(&path).unwrap();
        assert_eq!(saved.horde_api_key, "SECRETKEY123");
        assert_eq!(saved.dreamer_name, "fixed");
        cmd_tx.send(UiCommand::Quit).unwrap();
        ctl.await.unwrap().unwrap();
    }
}
