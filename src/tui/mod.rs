mod help;
mod state;

use crate::catalog;
use crate::cli::Cli;
use crate::logfile::{self, LOG_FILES, TAIL_LINES};
use crate::model::{StatusCategory, WorkerEvent, WorkerState};
use crate::orchestrator::{self, ControllerOptions, UiCommand};
use crate::config::LIST_FIELDS;
use crate::shell::{self, Link};
use crate::stats::format_uptime;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::{LogLine, LogSource, UiState, TAB_CONFIG, TAB_HELP, TAB_LOGS, TAB_MODELS, TAB_TITLES};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub(crate) async fn run(args: Cli, opts: ControllerOptions) -> Result<()> {
    // Unbounded channels avoid backpressure between the worker output and the UI.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let worker_folder = opts.worker_folder.clone();
    let ui_handle =
        std::thread::spawn(move || run_threaded(args, worker_folder, event_rx, cmd_tx));

    let res = orchestrator::run_controller(opts, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    _args: Cli,
    worker_folder: Option<std::path::PathBuf>,
    mut event_rx: UnboundedReceiver<WorkerEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState {
        worker_folder,
        ..Default::default()
    };
    if state.worker_folder.is_none() {
        state.push_note(
            "Worker folder not set. Restart with --worker-folder <path>.",
            true,
        );
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            state.apply_event(ev, Instant::now());
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if state.pending_install.is_some() {
                    handle_install_key(&mut state, &cmd_tx, k.code);
                    continue;
                }
                if state.editing.is_some() {
                    handle_edit_key(&mut state, &cmd_tx, k.code);
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('s')) => {
                        let cmd = if state.worker_state == WorkerState::Stopped {
                            UiCommand::Start
                        } else {
                            UiCommand::Stop
                        };
                        let _ = cmd_tx.send(cmd);
                    }
                    (_, KeyCode::Char('r')) => {
                        let _ = cmd_tx.send(UiCommand::Restart);
                    }
                    (_, KeyCode::Char('o')) => open_logs(&mut state),
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % TAB_TITLES.len();
                        on_tab_entered(&mut state);
                    }
                    (_, KeyCode::BackTab) => {
                        state.tab = (state.tab + TAB_TITLES.len() - 1) % TAB_TITLES.len();
                        on_tab_entered(&mut state);
                    }
                    (_, KeyCode::Char(c @ '1'..='5')) => {
                        state.tab = (c as usize) - ('1' as usize);
                        on_tab_entered(&mut state);
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = TAB_HELP;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => match state.tab {
                        TAB_LOGS => state.scroll_up(1),
                        TAB_MODELS => state.models_scroll = state.models_scroll.saturating_sub(1),
                        TAB_CONFIG => {
                            state.config_selected = state.config_selected.saturating_sub(1)
                        }
                        _ => {}
                    },
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => match state.tab {
                        TAB_LOGS => state.scroll_down(1),
                        TAB_MODELS => state.models_scroll += 1,
                        TAB_CONFIG => {
                            let max = state.config_field_count().saturating_sub(1);
                            state.config_selected = (state.config_selected + 1).min(max);
                        }
                        _ => {}
                    },
                    (_, KeyCode::PageUp) if state.tab == TAB_LOGS => state.scroll_up(20),
                    (_, KeyCode::PageDown) if state.tab == TAB_LOGS => state.scroll_down(20),
                    (_, KeyCode::Char('G')) | (_, KeyCode::End) if state.tab == TAB_LOGS => {
                        state.log_scroll = 0;
                    }
                    (_, KeyCode::Char('f')) if state.tab == TAB_LOGS => {
                        state.log_source = state.log_source.next();
                        load_log_source(&mut state);
                    }
                    (_, KeyCode::Char('a')) if state.tab == TAB_LOGS => {
                        state.auto_scroll = !state.auto_scroll;
                        state.info = if state.auto_scroll {
                            "Auto-scroll enabled".into()
                        } else {
                            "Auto-scroll disabled".into()
                        };
                    }
                    (_, KeyCode::Char('c')) if state.tab == TAB_LOGS => {
                        state.log.clear();
                        state.log_scroll = 0;
                    }
                    (_, KeyCode::Char('m')) if state.tab == TAB_MODELS => load_models(&mut state),
                    (_, KeyCode::Enter) if state.tab == TAB_CONFIG => {
                        if let Some(key) = state.selected_config_key() {
                            let current = state
                                .config
                                .as_ref()
                                .map(|c| editable_value(c, key))
                                .unwrap_or_default();
                            state.editing = Some(current);
                        }
                    }
                    (_, KeyCode::Char('w')) if state.tab == TAB_CONFIG => {
                        let _ = cmd_tx.send(UiCommand::SaveConfig);
                    }
                    (_, KeyCode::Char('R')) if state.tab == TAB_CONFIG => {
                        let _ = cmd_tx.send(UiCommand::ReloadConfig);
                    }
                    (_, KeyCode::Char(c)) if state.tab == TAB_HELP => {
                        if let Some(link) = Link::ALL.into_iter().find(|l| l.key() == c) {
                            open_link(&mut state, link);
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

/// Answer to the missing-packages prompt.
fn handle_install_key(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>, code: KeyCode) {
    match code {
        KeyCode::Char('y') | KeyCode::Char('Y') => {
            if let Some(packages) = state.pending_install.take() {
                let _ = cmd_tx.send(UiCommand::InstallDependencies { packages });
            }
        }
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
            state.pending_install = None;
            state.push_note("Worker not started due to missing dependencies.", false);
        }
        _ => {}
    }
}

fn handle_edit_key(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>, code: KeyCode) {
    let list_field = state
        .selected_config_key()
        .is_some_and(|k| LIST_FIELDS.contains(&k));
    let Some(buf) = state.editing.as_mut() else {
        return;
    };
    match code {
        // One model per line; names may contain commas.
        KeyCode::Tab if list_field => buf.push('\n'),
        KeyCode::Esc => state.editing = None,
        KeyCode::Enter => {
            let value = std::mem::take(buf);
            state.editing = None;
            if let Some(key) = state.selected_config_key() {
                let _ = cmd_tx.send(UiCommand::SetConfig {
                    key: key.to_string(),
                    value,
                });
            }
        }
        KeyCode::Backspace => {
            buf.pop();
        }
        KeyCode::Char(c) => buf.push(c),
        _ => {}
    }
}

/// Raw text for editing a field; list fields hold one entry per line and the
/// API key is shown in full.
fn editable_value(cfg: &crate::config::WorkerConfig, key: &str) -> String {
    match key {
        "horde_api_key" => cfg.horde_api_key.clone(),
        "models_to_load" => cfg.models_to_load.join("\n"),
        "models_to_skip" => cfg.models_to_skip.join("\n"),
        _ => cfg
            .display_fields()
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .unwrap_or_default(),
    }
}

fn on_tab_entered(state: &mut UiState) {
    if state.tab == TAB_MODELS && state.models.is_none() {
        load_models(state);
    }
}

fn load_models(state: &mut UiState) {
    let Some(folder) = state.worker_folder.clone() else {
        state.push_note("Please select the worker folder first.", true);
        return;
    };
    match catalog::load(&folder) {
        Ok(Some(models)) => {
            let groups = catalog::group_by_type(models);
            let count: usize = groups.iter().map(|g| g.models.len()).sum();
            state.info = format!("Loaded {count} model(s)");
            state.models = Some(groups);
            state.models_scroll = 0;
        }
        Ok(None) => {
            state.models = Some(Vec::new());
            state.info =
                "Could not find models.json file. It may be generated when you first run the worker."
                    .into();
        }
        Err(e) => state.push_note(format!("Failed to load models: {e:#}"), true),
    }
}

fn load_log_source(state: &mut UiState) {
    let LogSource::File(i) = state.log_source else {
        state.file_tail = None;
        state.info = "Displaying real-time output from the worker process.".into();
        return;
    };
    let Some(folder) = state.worker_folder.clone() else {
        state.file_tail = None;
        state.info = "Worker folder not set. Cannot read log files.".into();
        return;
    };
    let path = logfile::log_path(&folder, LOG_FILES[i]);
    if !path.exists() {
        state.file_tail = None;
        state.info = format!(
            "Log file not found: {}. It may not have been created yet.",
            path.display()
        );
        return;
    }
    match logfile::tail(&path, TAIL_LINES) {
        Ok(t) => {
            state.info = if t.truncated() {
                format!("Showing last {} of {} lines.", t.lines.len(), t.total)
            } else {
                format!("Loaded log file: {}", path.display())
            };
            state.file_tail = Some(t);
        }
        Err(e) => {
            state.file_tail = None;
            state.info = format!("Error reading log file: {e:#}");
        }
    }
}

fn open_link(state: &mut UiState, link: Link) {
    match shell::open_url(link.url()) {
        Ok(()) => state.push_note(format!("Opened {}", link.url()), false),
        Err(e) => state.push_note(format!("Could not open {}: {e:#}", link.url()), true),
    }
}

fn open_logs(state: &mut UiState) {
    let Some(folder) = state.worker_folder.clone() else {
        state.push_note("Please select the worker folder first.", true);
        return;
    };
    match shell::open_logs_folder(&folder) {
        Ok(dir) => state.push_note(format!("Opened logs folder: {}", dir.display()), false),
        Err(e) => state.push_note(format!("Could not open logs folder: {e:#}"), true),
    }
}

fn category_color(category: Option<StatusCategory>, error: bool) -> Color {
    if error {
        return Color::Red;
    }
    match category {
        Some(StatusCategory::Error) => Color::Red,
        Some(StatusCategory::Warning) | Some(StatusCategory::Maintenance) => Color::Yellow,
        Some(StatusCategory::JobCompleted) | Some(StatusCategory::Online) => Color::Green,
        Some(StatusCategory::Kudos) => Color::LightGreen,
        Some(StatusCategory::ModelLoading) | Some(StatusCategory::ModelDownload) => Color::Cyan,
        Some(StatusCategory::Starting) => Color::Blue,
        _ => Color::Reset,
    }
}

fn state_color(state: WorkerState) -> Color {
    match state {
        WorkerState::Running => Color::Green,
        WorkerState::Starting | WorkerState::Stopping => Color::Yellow,
        WorkerState::Stopped => Color::Red,
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(1),
            ]
            .as_ref(),
        )
        .split(area);

    let tabs = Tabs::new(TAB_TITLES.iter().map(|t| Line::from(*t)).collect::<Vec<_>>())
        .select(state.tab)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("horde-worker-tui"),
        )
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        state::TAB_DASHBOARD => draw_dashboard(chunks[1], f, state),
        TAB_LOGS => draw_logs(chunks[1], f, state),
        TAB_MODELS => draw_models(chunks[1], f, state),
        TAB_CONFIG => draw_config(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }

    if let Some(packages) = &state.pending_install {
        let prompt = Paragraph::new(Line::from(vec![
            Span::styled(
                " Missing packages ",
                Style::default().fg(Color::Black).bg(Color::Yellow),
            ),
            Span::raw(format!(" {}. Install them now? (y/n)", packages.join(", "))),
        ]));
        f.render_widget(prompt, chunks[2]);
        return;
    }

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(
            format!(" {} ", state.worker_state.label()),
            Style::default()
                .fg(Color::Black)
                .bg(state_color(state.worker_state)),
        ),
        Span::raw(" "),
        Span::styled(state.info.clone(), Style::default().fg(Color::Gray)),
    ]));
    f.render_widget(footer, chunks[2]);
}

fn kv(label: &str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
        Span::raw(value),
    ])
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(9),
                Constraint::Percentage(40),
                Constraint::Min(0),
            ]
            .as_ref(),
        )
        .split(area);
    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)].as_ref())
        .split(main[0]);

    let now = Instant::now();
    let worker_line = match state.pid {
        Some(pid) => format!("{} (pid {pid})", state.worker_state.label()),
        None => state.worker_state.label().to_string(),
    };
    let mut status_lines = vec![
        Line::from(vec![
            Span::styled("Worker: ", Style::default().fg(Color::Gray)),
            Span::styled(
                worker_line,
                Style::default()
                    .fg(state_color(state.worker_state))
                    .add_modifier(Modifier::BOLD),
            ),
        ]),
        kv("Status", state.status.clone()),
        kv(
            "Folder",
            state
                .worker_folder
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into()),
        ),
        kv(
            "Script",
            state
                .script
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "-".into()),
        ),
    ];
    if let Some(job) = &state.current_job {
        status_lines.push(kv("Current job", job.clone()));
    }
    if let Some(code) = state.last_exit_code {
        status_lines.push(kv("Last exit code", code.to_string()));
    }
    f.render_widget(
        Paragraph::new(status_lines)
            .block(Block::default().borders(Borders::ALL).title("Worker"))
            .wrap(Wrap { trim: true }),
        top[0],
    );

    let rate = state
        .stats
        .kudos_per_hour(now)
        .map(|r| format!("{r:.2} / hour"))
        .unwrap_or_else(|| "-".into());
    let stats_lines = vec![
        Line::from(state.stats.jobs_label()),
        Line::from(state.stats.kudos_label()),
        kv("Uptime", format_uptime(state.stats.uptime(now))),
        kv("Kudos Rate", rate),
    ];
    f.render_widget(
        Paragraph::new(stats_lines).block(Block::default().borders(Borders::ALL).title("Statistics")),
        top[1],
    );

    let jobs: Vec<Line> = if state.recent_jobs.is_empty() {
        vec![Line::styled(
            "No jobs completed yet",
            Style::default().fg(Color::DarkGray),
        )]
    } else {
        state
            .recent_jobs
            .iter()
            .map(|j| Line::styled(j.clone(), Style::default().fg(Color::Green)))
            .collect()
    };
    f.render_widget(
        Paragraph::new(jobs).block(Block::default().borders(Borders::ALL).title("Recent Jobs")),
        main[1],
    );

    draw_log_pane(main[2], f, state, "Recent Output", 0);
}

/// Bottom-anchored window over the direct-output log.
fn draw_log_pane(area: Rect, f: &mut ratatui::Frame, state: &UiState, title: &str, scroll: usize) {
    let height = area.height.saturating_sub(2) as usize;
    let total = state.log.len();
    let end = total.saturating_sub(scroll);
    let start = end.saturating_sub(height);
    let lines: Vec<Line> = state
        .log
        .range(start..end)
        .map(|l: &LogLine| {
            Line::styled(
                l.text.clone(),
                Style::default().fg(category_color(l.category, l.error)),
            )
        })
        .collect();
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title.to_string())),
        area,
    );
}

fn draw_logs(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let title = format!(
        "Log: {}{}",
        state.log_source.label(),
        if state.auto_scroll { "" } else { " (auto-scroll off)" }
    );
    match (state.log_source, state.file_tail.as_ref()) {
        (LogSource::Direct, _) => draw_log_pane(area, f, state, &title, state.log_scroll),
        (LogSource::File(_), Some(tail)) => {
            let height = area.height.saturating_sub(2) as usize;
            let end = tail.lines.len().saturating_sub(state.log_scroll);
            let start = end.saturating_sub(height);
            let lines: Vec<Line> = tail.lines[start..end]
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect();
            f.render_widget(
                Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
                area,
            );
        }
        (LogSource::File(_), None) => {
            f.render_widget(
                Paragraph::new(state.info.clone())
                    .block(Block::default().borders(Borders::ALL).title(title)),
                area,
            );
        }
    }
}

fn draw_models(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let mut lines: Vec<Line> = Vec::new();
    match state.models.as_deref() {
        None => lines.push(Line::from("Press m to load models.json")),
        Some([]) => lines.push(Line::from(
            "No models listed. models.json may be generated when you first run the worker.",
        )),
        Some(groups) => {
            for g in groups {
                lines.push(Line::styled(
                    format!("{} ({})", g.kind, g.models.len()),
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                ));
                for m in &g.models {
                    lines.push(Line::from(vec![
                        Span::raw("  "),
                        Span::raw(format!("{:<48}", m.name)),
                        Span::styled(
                            format!("{:>12}", m.size_label()),
                            Style::default().fg(Color::Gray),
                        ),
                    ]));
                }
            }
        }
    }
    lines.push(Line::from(""));
    for text in catalog::CUSTOM_MODELS_HELP {
        lines.push(Line::styled(*text, Style::default().fg(Color::DarkGray)));
    }
    let scroll = state.models_scroll.min(lines.len().saturating_sub(1)) as u16;
    f.render_widget(
        Paragraph::new(lines)
            .scroll((scroll, 0))
            .block(Block::default().borders(Borders::ALL).title("Models")),
        area,
    );
}

fn draw_config(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let title = match state.config_path.as_ref() {
        Some(p) => format!("Config: {}", p.display()),
        None => "Config".to_string(),
    };
    let Some(cfg) = state.config.as_ref() else {
        f.render_widget(
            Paragraph::new("No configuration loaded. Set the worker folder first.")
                .block(Block::default().borders(Borders::ALL).title(title)),
            area,
        );
        return;
    };

    let lines: Vec<Line> = cfg
        .display_fields()
        .into_iter()
        .enumerate()
        .map(|(i, (key, value))| {
            let selected = i == state.config_selected;
            let value = match (&state.editing, selected) {
                (Some(buf), true) => format!("{}▏", buf.replace('\n', " ⏎ ")),
                _ => value,
            };
            let key_style = if selected {
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::Gray)
            };
            Line::from(vec![
                Span::styled(format!("{key:<24}"), key_style),
                Span::raw(value),
            ])
        })
        .collect();
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
        area,
    );
}
