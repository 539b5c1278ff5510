use crate::catalog;
use crate::config;
use crate::discovery;
use crate::logfile;
use crate::model::{InfoEvent, WorkerEvent, WorkerState};
use crate::orchestrator::{self, ControllerOptions, UiCommand};
use crate::settings::{self, AppSettings};
use crate::shell::{self, Link, UpdateOutcome};
use crate::stats::RunStatistics;
use crate::supervisor::{bootstrap, default_python, Platform, StartOptions};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "horde-worker-tui",
    version,
    about = "Launch, monitor and configure an AI Horde reGen worker"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Worker installation folder (remembered between sessions)
    #[arg(long, global = true)]
    pub worker_folder: Option<PathBuf>,

    /// Bridge configuration file (defaults to bridgeData.yaml in the worker folder)
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    /// Stream worker events as JSON lines (no TUI)
    #[arg(long, global = true)]
    pub json: bool,

    /// Stream classified worker output as text (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Python interpreter for run_worker.py launches and dependency checks
    #[arg(long, global = true)]
    pub python: Option<PathBuf>,

    /// Time a stopping worker gets before it is killed
    #[arg(long, default_value = "5s")]
    pub stop_grace: humantime::Duration,

    /// Automatically start the worker when the app launches
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,

    /// Check the worker's Python packages before each start and offer to install missing ones
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub check_deps: bool,

    /// Use --save-settings true or --save-settings false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, global = true)]
    pub save_settings: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Show or edit the bridge configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List the models in the worker's models.json
    Models,
    /// Show the tail of one of the worker's log files
    Logs {
        /// Log file under <worker>/logs
        #[arg(long, default_value = "bridge.log")]
        file: String,
        /// Number of trailing lines to show
        #[arg(long, default_value_t = logfile::TAIL_LINES)]
        lines: usize,
    },
    /// Update the worker with git pull (or point at the release archive)
    UpdateWorker,
    /// Run the worker's update-runtime script
    UpdateRuntime,
    /// Open the worker's logs folder in the file manager
    OpenLogs,
    /// Look for a worker installation in the usual places
    Discover,
    /// Check the Python packages the worker needs
    Deps {
        /// Install the missing packages with pip
        #[arg(long)]
        install: bool,
    },
    /// Open a project link in the browser
    OpenLink {
        #[arg(value_enum)]
        link: Link,
    },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ConfigAction {
    /// Print the recognized settings (API key masked)
    Show,
    /// Set one setting and save the file (list settings take one model per line)
    Set { key: String, value: String },
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    if let Some(command) = args.command.clone() {
        return run_command(&args, command).await;
    }

    let opts = build_options(&args);

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args, opts).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_headless(&args, opts, HeadlessMode::Text).await;
        }
    }

    let mode = if args.silent {
        HeadlessMode::Silent
    } else if args.json {
        HeadlessMode::Json
    } else {
        HeadlessMode::Text
    };
    run_headless(&args, opts, mode).await
}

/// Worker folder from the command line, the settings cache, or a search of
/// the usual install locations, in that order.
fn resolve_worker_folder(args: &Cli, cached: &AppSettings) -> Option<PathBuf> {
    if let Some(folder) = args.worker_folder.clone() {
        return Some(folder);
    }
    if let Some(folder) = cached.worker_folder.clone() {
        return Some(folder);
    }
    discovery::discover_installation()
}

fn load_settings() -> AppSettings {
    match settings::load() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring unreadable settings cache");
            AppSettings::default()
        }
    }
}

/// Build `ControllerOptions` from CLI arguments and the settings cache.
pub(crate) fn build_options(args: &Cli) -> ControllerOptions {
    let cached = load_settings();
    let worker_folder = resolve_worker_folder(args, &cached);
    let config_file = args.config_file.clone().or_else(|| {
        // A cached config file only applies to the cached folder.
        (worker_folder.is_some() && worker_folder == cached.worker_folder)
            .then(|| cached.config_file.clone())
            .flatten()
    });

    if args.save_settings {
        if let Some(folder) = worker_folder.as_deref() {
            let mut next = AppSettings::for_folder(folder);
            if let Some(cfg) = config_file.clone() {
                next.config_file = Some(cfg);
            }
            if next != cached {
                if let Err(e) = settings::save(&next) {
                    tracing::warn!(error = %format!("{e:#}"), "could not save settings cache");
                }
            }
        }
    }

    ControllerOptions {
        worker_folder,
        config_file,
        start: StartOptions {
            python: args.python.clone().unwrap_or_else(default_python),
            platform: Platform::current(),
            extra_env: Vec::new(),
        },
        stop_grace: Duration::from(args.stop_grace),
        start_on_launch: args.start_on_launch,
        check_dependencies: args.check_deps,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadlessMode {
    Text,
    Json,
    Silent,
}

/// Run one worker to completion without the TUI. Ctrl-C stops the worker.
async fn run_headless(args: &Cli, mut opts: ControllerOptions, mode: HeadlessMode) -> Result<()> {
    if !args.start_on_launch {
        tracing::info!("--start-on-launch false has no effect without the TUI");
    }
    opts.start_on_launch = true;

    let (out_tx, out_handle) = if mode == HeadlessMode::Silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let controller = tokio::spawn(orchestrator::run_controller(opts, event_tx, cmd_rx));

    let mut stats = RunStatistics::default();
    let mut exit_code: Option<i32> = None;
    let mut failure: Option<String> = None;
    let mut started = false;
    let mut quit_sent = false;

    loop {
        tokio::select! {
            ev = event_rx.recv() => {
                let Some(ev) = ev else { break };
                match &ev {
                    WorkerEvent::Started { .. } => {
                        started = true;
                        stats.reset(Instant::now());
                    }
                    WorkerEvent::Output(status) => {
                        stats.record_status(status);
                    }
                    WorkerEvent::Exited { code, requested } => {
                        exit_code = *code;
                        if !requested && *code != Some(0) {
                            failure = Some(match code {
                                Some(c) => format!("worker exited with code {c}"),
                                None => "worker was terminated by a signal".to_string(),
                            });
                        }
                    }
                    WorkerEvent::Info(info) if info.is_error() && !started => {
                        failure = Some(info.to_message());
                    }
                    WorkerEvent::StateChanged { state: WorkerState::Stopped } if !quit_sent => {
                        quit_sent = true;
                        let _ = cmd_tx.send(UiCommand::Quit);
                    }
                    _ => {}
                }
                if let Some(tx) = out_tx.as_ref() {
                    print_event(tx, mode, &ev);
                }
            }
            _ = tokio::signal::ctrl_c(), if !quit_sent => {
                quit_sent = true;
                if let Some(tx) = out_tx.as_ref() {
                    let _ = tx.send(OutputLine::Stderr("Stopping worker…".into()));
                }
                let _ = cmd_tx.send(UiCommand::Quit);
            }
        }
    }

    controller.await.context("controller task failed")??;

    if started {
        let summary = stats.summary(Instant::now(), exit_code);
        if let Some(tx) = out_tx.as_ref() {
            match mode {
                HeadlessMode::Json => {
                    let line = serde_json::json!({ "summary": summary });
                    let _ = tx.send(OutputLine::Stdout(line.to_string()));
                }
                _ => {
                    for line in crate::text_summary::build_text_summary(&summary).lines {
                        let _ = tx.send(OutputLine::Stderr(line));
                    }
                }
            }
        }
    }

    if let Some(tx) = out_tx {
        drop(tx);
    }
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    match failure {
        Some(msg) => Err(anyhow!(msg)),
        None => Ok(()),
    }
}

fn print_event(tx: &mpsc::UnboundedSender<OutputLine>, mode: HeadlessMode, ev: &WorkerEvent) {
    match mode {
        HeadlessMode::Silent => {}
        HeadlessMode::Json => match serde_json::to_string(ev) {
            Ok(line) => {
                let _ = tx.send(OutputLine::Stdout(line));
            }
            Err(e) => tracing::warn!(error = %e, "event not representable as JSON"),
        },
        HeadlessMode::Text => {
            let line = match ev {
                WorkerEvent::Output(status) => {
                    let _ = tx.send(OutputLine::Stdout(status.display_line()));
                    return;
                }
                WorkerEvent::Info(info) => info.to_message(),
                WorkerEvent::Started { pid, script } => match pid {
                    Some(pid) => format!("Worker started: {} (pid {pid})", script.display()),
                    None => format!("Worker started: {}", script.display()),
                },
                WorkerEvent::StateChanged { state } => format!("Status: {}", state.label()),
                WorkerEvent::Exited { .. } | WorkerEvent::ConfigLoaded { .. } => return,
            };
            let _ = tx.send(OutputLine::Stderr(format!(
                "[{}] {line}",
                crate::model::now_timestamp()
            )));
        }
    }
}

fn require_folder(args: &Cli) -> Result<PathBuf> {
    let cached = load_settings();
    match resolve_worker_folder(args, &cached) {
        Some(folder) => Ok(folder),
        None => bail!(InfoEvent::WorkerFolderNotSet.to_message()),
    }
}

async fn run_command(args: &Cli, command: Command) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let res = dispatch(args, command, &out_tx).await;
    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn dispatch(
    args: &Cli,
    command: Command,
    out: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let say = |line: String| {
        let _ = out.send(OutputLine::Stdout(line));
    };
    let note = |line: String| {
        let _ = out.send(OutputLine::Stderr(line));
    };

    match command {
        Command::Discover => match discovery::discover_installation() {
            Some(folder) => {
                if args.save_settings {
                    let path = settings::save(&AppSettings::for_folder(&folder))?;
                    note(format!("Saved: {}", path.display()));
                }
                say(folder.display().to_string());
            }
            None => bail!("No worker installation found in the default locations"),
        },
        Command::Config { action } => {
            let folder = require_folder(args)?;
            let path = args
                .config_file
                .clone()
                .unwrap_or_else(|| config::config_path(&folder));
            let mut cfg = config::load(&path)?;
            match action {
                ConfigAction::Show => {
                    if args.json {
                        say(serde_json::to_string_pretty(&cfg.masked())?);
                    } else {
                        note(format!("# {}", path.display()));
                        for (key, value) in cfg.display_fields() {
                            say(format!("{key:<24}{value}"));
                        }
                    }
                }
                ConfigAction::Set { key, value } => {
                    cfg.set_field(&key, &value)?;
                    config::save(&cfg, &path)?;
                    note(InfoEvent::ConfigSaved { path }.to_message());
                }
            }
        }
        Command::Models => {
            let folder = require_folder(args)?;
            let Some(models) = catalog::load(&folder)? else {
                bail!(
                    "Could not find models.json file. It may be generated when you first run the worker."
                );
            };
            let groups = catalog::group_by_type(models);
            if args.json {
                say(serde_json::to_string_pretty(&groups)?);
            } else {
                for group in groups {
                    say(group.kind.clone());
                    for m in &group.models {
                        say(format!("  {:<48} {:>12}", m.name, m.size_label()));
                    }
                }
                note(String::new());
                for line in catalog::CUSTOM_MODELS_HELP {
                    note(line.to_string());
                }
            }
        }
        Command::Logs { file, lines } => {
            let folder = require_folder(args)?;
            let path = logfile::log_path(&folder, &file);
            if !path.exists() {
                bail!(
                    "Log file not found: {}. The log file may not have been created yet.",
                    path.display()
                );
            }
            let tail = logfile::tail(&path, lines)?;
            if tail.truncated() {
                note(format!(
                    "Log file is large. Showing last {} of {} lines.",
                    tail.lines.len(),
                    tail.total
                ));
            }
            for line in tail.lines {
                say(line);
            }
        }
        Command::UpdateWorker => {
            let folder = require_folder(args)?;
            let outcome = tokio::task::spawn_blocking(move || shell::update_worker(&folder))
                .await
                .context("update task failed")??;
            match outcome {
                UpdateOutcome::Pulled(summary) => {
                    say("The worker has been updated successfully using git pull.".into());
                    if !summary.is_empty() {
                        note(summary);
                    }
                }
                UpdateOutcome::Manual { url } => {
                    say("This installation doesn't use git. Please download the latest version from GitHub:".into());
                    say(url.to_string());
                }
            }
        }
        Command::UpdateRuntime => {
            let folder = require_folder(args)?;
            let output = tokio::task::spawn_blocking(move || {
                shell::update_runtime(&folder, Platform::current())
            })
            .await
            .context("update task failed")??;
            for line in output.lines() {
                note(line.to_string());
            }
            say("The runtime has been updated successfully.".into());
        }
        Command::OpenLogs => {
            let folder = require_folder(args)?;
            let dir = shell::open_logs_folder(&folder)?;
            say(format!("Opened logs folder: {}", dir.display()));
        }
        Command::OpenLink { link } => {
            shell::open_url(link.url())?;
            say(format!("Opened {}: {}", link.label(), link.url()));
        }
        Command::Deps { install } => {
            let python = args.python.clone().unwrap_or_else(default_python);
            let missing = bootstrap::missing_modules(&python, bootstrap::RUNTIME_MODULES).await;
            if missing.is_empty() {
                say("All dependencies are installed.".into());
                return Ok(());
            }
            let packages: Vec<String> = missing.iter().map(|(_, p)| p.to_string()).collect();
            say(format!("Missing packages: {}", packages.join(", ")));
            if !install {
                bail!("Missing dependencies. Re-run with --install to install them with pip.");
            }
            let mut failed = Vec::new();
            for package in &packages {
                note(InfoEvent::InstallingDependency { package: package.clone() }.to_message());
                match bootstrap::install_package(&python, package).await {
                    Ok(()) => note(
                        InfoEvent::DependencyInstalled { package: package.clone() }.to_message(),
                    ),
                    Err(detail) => {
                        note(
                            InfoEvent::DependencyFailed {
                                package: package.clone(),
                                detail,
                            }
                            .to_message(),
                        );
                        failed.push(package.clone());
                    }
                }
            }
            if !failed.is_empty() {
                bail!(
                    "Failed to install {}. Please install them manually.",
                    failed.join(", ")
                );
            }
            say("All dependencies have been successfully installed.".into());
        }
    }
    Ok(())
}
