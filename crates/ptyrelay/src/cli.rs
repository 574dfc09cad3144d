//! Command-line front end

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ptyrelay_pty::{select_shell, SessionBuilder, TerminationReason};
use std::fs::File;
use std::io;
use std::os::unix::io::AsFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relay stdin/stdout to an interactive shell running in a PTY"
)]
pub struct Args {
    /// Shell to run (defaults to $SHELL, then /bin/bash)
    #[arg(short, long)]
    pub shell: Option<String>,

    /// Initial terminal rows
    #[arg(long, default_value = "30")]
    pub rows: u16,

    /// Initial terminal columns
    #[arg(long, default_value = "80")]
    pub cols: u16,

    /// Working directory for the shell
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Install the tracing subscriber. Stdout carries the relay stream, so logs
/// only ever go to stderr or a file.
pub fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));

    match &args.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }

    Ok(())
}

/// Start the shell, relay until the session ends, then clean up.
///
/// Only a failure to start the shell is an error; every way the relay can
/// end is a normal end of session.
pub fn run(args: Args) -> Result<TerminationReason> {
    let shell = select_shell(args.shell.as_deref());

    let mut builder = SessionBuilder::new()
        .shell(shell.clone())
        .dimensions(args.rows, args.cols);
    if let Some(dir) = &args.cwd {
        builder = builder.cwd(dir);
    }

    // Installed first so a signal during startup still ends in cleanup.
    let interrupt = interrupt_flag()?;

    let mut session = match builder.build() {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, shell = %shell, "failed to start shell");
            return Err(e).with_context(|| format!("Failed to start shell {shell}"));
        }
    };

    let input = stdin_handle().context("Failed to duplicate stdin")?;
    let reason = session.relay(input, io::stdout().lock(), interrupt);
    debug!(?reason, "relay ended");

    let status = session.shutdown();
    info!(?reason, ?status, "session ended");

    Ok(reason)
}

/// Flag raised by SIGINT, SIGTERM or SIGHUP. The handler is process-wide
/// and installed once; every call clears the flag.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    static INTERRUPT: Mutex<Option<Arc<AtomicBool>>> = Mutex::new(None);

    let mut installed = INTERRUPT.lock().unwrap_or_else(PoisonError::into_inner);
    let flag = match installed.clone() {
        Some(flag) => flag,
        None => {
            let flag = Arc::new(AtomicBool::new(false));
            let handler_flag = Arc::clone(&flag);
            ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
                .context("Failed to install interrupt handler")?;
            *installed = Some(Arc::clone(&flag));
            flag
        }
    };

    flag.store(false, Ordering::SeqCst);
    Ok(flag)
}

/// Unbuffered handle on fd 0. Reading through `io::stdin()` would buffer
/// data behind `poll`'s back.
fn stdin_handle() -> io::Result<File> {
    let fd = io::stdin().as_fd().try_clone_to_owned()?;
    Ok(File::from(fd))
}
