//! Lencak: a lightweight process supervisor.
//!
//! Loads workspace files, starts the configured services, serves the control
//! socket and tears every task down on SIGINT/SIGTERM.

mod config;
mod control;
mod error;
mod events;
mod logging;
mod output;
mod process;
mod runner;
mod supervisor;
mod task;
mod vars;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::DEFAULT_WORKSPACE_FILE;
use crate::logging::LogLevel;
use crate::supervisor::Supervisor;
use crate::workspace::Globals;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "lencak",
    version,
    about = "Lightweight process supervisor",
    styles = help_styles()
)]
struct Cli {
    /// Workspace file (YAML or TOML). Repeat to load several; same-name
    /// workspaces are merged in order.
    #[arg(short, long = "workspace", default_value = DEFAULT_WORKSPACE_FILE)]
    workspaces: Vec<PathBuf>,
    /// File with environment and functions shared by every workspace.
    #[arg(long)]
    globals: Option<PathBuf>,
    /// Control socket address.
    #[arg(long, default_value = control::DEFAULT_ADDR)]
    addr: String,
    /// Log level (overrides LENCAK_LOG).
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
    /// How long to wait for killed tasks to exit on shutdown (ms).
    #[arg(long, default_value_t = 5000)]
    shutdown_grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    let configs = config::load_workspaces(&cli.workspaces)?;
    let globals = match &cli.globals {
        Some(path) => Globals::from_config(config::load_globals(path)?),
        None => Globals::default(),
    };

    let supervisor = Arc::new(Supervisor::new(&configs, globals));
    let listener = TcpListener::bind(&cli.addr)
        .await
        .with_context(|| format!("failed to bind control socket on {}", cli.addr))?;

    let result = tokio::select! {
        served = control::serve(listener, Arc::clone(&supervisor)) => served,
        signal = shutdown_signal() => {
            info!(signal, "shutting down");
            Ok(())
        }
    };
    if let Err(err) = &result {
        error!(error = %err, "control socket failed");
    }

    let grace = Duration::from_millis(cli.shutdown_grace_ms);
    if !supervisor.shutdown(grace).await {
        error!("some tasks did not exit before the grace period ended");
    }
    result
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
