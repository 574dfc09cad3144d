//! PTY handling for ptyrelay
//!
//! Spawns an interactive shell behind a pseudo-terminal and relays bytes
//! between the shell and the caller's standard streams.

pub mod pty;
pub mod relay;
pub mod session;

pub use pty::{Pty, PtyProcess, SpawnOptions, WindowSize};
pub use relay::{Relay, RelayStats, TerminationReason};
pub use session::{select_shell, ExitStatus, SessionBuilder, ShellSession, DEFAULT_SHELL};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to allocate PTY: {0}")]
    Allocation(#[source] nix::Error),

    #[error("Failed to fork shell process: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to make PTY master non-blocking: {0}")]
    NonBlocking(#[source] nix::Error),

    #[error("Invalid spawn argument: {0}")]
    InvalidArgument(String),

    #[error("Child setup failed during {stage}: {source}")]
    ChildSetup {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to execute shell {shell}: {source}")]
    Exec {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}
