//! Operating-system integration: opening folders and URLs, and the update
//! actions that shell out to `git` or the worker's runtime updater.

use crate::supervisor::Platform;
use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const REPOSITORY_URL: &str = "https://github.com/Haidra-Org/horde-worker-reGen";
pub const ARCHIVE_URL: &str = "https://github.com/Haidra-Org/horde-worker-reGen/archive/main.zip";
pub const LOGS_DIR_NAME: &str = "logs";
pub const HORDE_URL: &str = "https://aihorde.net/";
pub const DISCORD_URL: &str = "https://discord.gg/3DxrhksKzn";

/// Project links offered on the help page and by `open-link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Link {
    Horde,
    Github,
    Discord,
}

impl Link {
    pub const ALL: [Link; 3] = [Link::Horde, Link::Github, Link::Discord];

    pub fn url(self) -> &'static str {
        match self {
            Link::Horde => HORDE_URL,
            Link::Github => REPOSITORY_URL,
            Link::Discord => DISCORD_URL,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Link::Horde => "AI Horde Website",
            Link::Github => "GitHub Repository",
            Link::Discord => "Discord Community",
        }
    }

    /// Key that opens the link from the help page.
    pub fn key(self) -> char {
        match self {
            Link::Horde => 'h',
            Link::Github => 'g',
            Link::Discord => 'd',
        }
    }
}

/// Program and arguments that hand `target` to the desktop's default handler.
pub fn opener_command(target: &Path) -> (OsString, Vec<OsString>) {
    let target = target.as_os_str().to_os_string();
    if cfg!(windows) {
        // `start` treats the first quoted argument as a window title.
        (
            "cmd".into(),
            vec!["/C".into(), "start".into(), "".into(), target],
        )
    } else if cfg!(target_os = "macos") {
        ("open".into(), vec![target])
    } else {
        ("xdg-open".into(), vec![target])
    }
}

pub fn open_path(target: &Path) -> Result<()> {
    let (program, args) = opener_command(target);
    let status = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("run {}", program.to_string_lossy()))?;
    if !status.success() {
        bail!("{} exited with {status}", program.to_string_lossy());
    }
    tracing::info!(target = %target.display(), "opened with desktop handler");
    Ok(())
}

pub fn open_url(url: &str) -> Result<()> {
    open_path(Path::new(url))
}

pub fn logs_dir(folder: &Path) -> PathBuf {
    folder.join(LOGS_DIR_NAME)
}

/// Create `<worker>/logs` when missing and open it in the file manager.
pub fn open_logs_folder(folder: &Path) -> Result<PathBuf> {
    let dir = logs_dir(folder);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), "created logs directory");
    }
    open_path(&dir)?;
    Ok(dir)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// `git pull` succeeded; carries its last line of output.
    Pulled(String),
    /// Not a git checkout; the archive has to be downloaded by hand.
    Manual { url: &'static str },
}

fn last_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Update the worker checkout with `git pull`, or point at the archive.
pub fn update_worker(folder: &Path) -> Result<UpdateOutcome> {
    if !folder.join(".git").exists() {
        if let Err(e) = open_url(ARCHIVE_URL) {
            tracing::warn!(error = %e, "could not open archive url");
        }
        return Ok(UpdateOutcome::Manual { url: ARCHIVE_URL });
    }
    let output = Command::new("git")
        .arg("pull")
        .current_dir(folder)
        .stdin(Stdio::null())
        .output()
        .context("run git pull")?;
    if !output.status.success() {
        bail!("git pull failed: {}", last_line(&output.stderr));
    }
    let summary = last_line(&output.stdout);
    tracing::info!(folder = %folder.display(), %summary, "worker updated");
    Ok(UpdateOutcome::Pulled(summary))
}

pub fn runtime_script(folder: &Path, platform: Platform) -> PathBuf {
    match platform {
        Platform::Windows => folder.join("update-runtime.cmd"),
        Platform::Unix => folder.join("update-runtime.sh"),
    }
}

/// Run the worker's runtime updater and return its combined output.
pub fn update_runtime(folder: &Path, platform: Platform) -> Result<String> {
    let script = runtime_script(folder, platform);
    if !script.is_file() {
        bail!("Could not find the update script at {}", script.display());
    }
    let mut cmd = match platform {
        Platform::Windows => Command::new(&script),
        Platform::Unix => {
            let mut c = Command::new("bash");
            c.arg(&script);
            c
        }
    };
    tracing::info!(script = %script.display(), "running runtime update");
    let output = cmd
        .current_dir(folder)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("run {}", script.display()))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        bail!(
            "Runtime update failed ({}): {}",
            output.status,
            last_line(text.as_bytes())
        );
    }
    Ok(text)
}
