mod catalog;
mod classifier;
mod cli;
mod config;
mod discovery;
mod logfile;
mod model;
mod orchestrator;
mod settings;
mod shell;
mod stats;
mod supervisor;
#[cfg(test)]
mod test_support;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

const LOG_FILE_NAME: &str = "horde-worker-tui.log";

/// Log to a file: the TUI owns the terminal and headless modes own stdout.
fn init_logging() -> Result<()> {
    let dir = settings::log_dir();
    std::fs::create_dir_all(&dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    let is_non_tui = args.silent || args.json || args.text || args.command.is_some();

    if let Err(e) = init_logging() {
        if !is_silent {
            eprintln!("warning: file logging disabled: {e}");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting");

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for non-TUI modes
            if is_non_tui {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "exiting with error");
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
