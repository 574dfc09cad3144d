//! Shell session lifecycle
//!
//! A [`ShellSession`] owns the master descriptor and the child pid handed
//! over by [`Pty::spawn`], and guarantees both are released exactly once.

use crate::{
    pty::{Pty, SpawnOptions, WindowSize},
    relay::{Relay, TerminationReason},
    PtyError,
};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Shell used when neither an override nor `$SHELL` names one
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Environment variable naming the preferred shell
pub const SHELL_ENV: &str = "SHELL";

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);
const REAP_POLL: Duration = Duration::from_millis(10);

/// Pick the shell to run: explicit override, then `$SHELL`, then [`DEFAULT_SHELL`]
pub fn select_shell(override_shell: Option<&str>) -> String {
    if let Some(shell) = override_shell.filter(|s| !s.is_empty()) {
        return shell.to_string();
    }

    match std::env::var(SHELL_ENV) {
        Ok(shell) if !shell.is_empty() => shell,
        _ => DEFAULT_SHELL.to_string(),
    }
}

/// How the shell process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    Unknown,
}

impl ExitStatus {
    /// Shell-style status code (128 + signal for signaled processes)
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + signal,
            ExitStatus::Unknown => -1,
        }
    }
}

/// A running shell and the master end of its terminal
#[derive(Debug)]
pub struct ShellSession {
    pid: Pid,
    master: Option<File>,
    kill_grace: Duration,
    cleaned_up: bool,
}

impl ShellSession {
    /// Allocate a PTY and start the shell described by `options`
    pub fn start(options: &SpawnOptions) -> Result<Self, PtyError> {
        let process = Pty::open()?.spawn(options)?;
        let (master, pid) = process.into_parts();

        info!(
            pid = pid.as_raw(),
            shell = %options.shell,
            rows = options.size.rows,
            cols = options.size.cols,
            "shell session started"
        );

        Ok(Self {
            pid,
            master: Some(master),
            kill_grace: DEFAULT_KILL_GRACE,
            cleaned_up: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The master descriptor, until the session has been shut down
    pub fn master(&self) -> Option<&File> {
        self.master.as_ref()
    }

    /// How long the shell gets to honour SIGTERM before it is killed
    pub fn set_kill_grace(&mut self, grace: Duration) {
        self.kill_grace = grace;
    }

    pub fn is_shut_down(&self) -> bool {
        self.cleaned_up
    }

    /// Relay `input` into the shell and shell output into `output` until
    /// one side closes or `interrupt` is raised
    pub fn relay<W: Write>(
        &self,
        input: File,
        output: W,
        interrupt: Arc<AtomicBool>,
    ) -> TerminationReason {
        match &self.master {
            Some(master) => Relay::new(input, master, output, interrupt).run(),
            None => TerminationReason::MasterClosed,
        }
    }

    /// Resize the shell's terminal
    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        let master = self.master.as_ref().ok_or_else(|| {
            PtyError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session already shut down",
            ))
        })?;
        crate::pty::set_window_size(master.as_raw_fd(), size)?;
        Ok(())
    }

    /// Terminate and reap the shell, then close the master.
    ///
    /// Runs once; later calls return `None`. Never fails: a shell that is
    /// already gone is the normal case after it exits on its own.
    pub fn shutdown(&mut self) -> Option<ExitStatus> {
        if self.cleaned_up {
            return None;
        }
        self.cleaned_up = true;

        match kill(self.pid, Signal::SIGTERM) {
            Ok(()) => {}
            // ESRCH: the shell has exited and been reaped elsewhere.
            Err(errno) => debug!(pid = self.pid.as_raw(), %errno, "SIGTERM not delivered"),
        }

        let status = reap(self.pid, self.kill_grace);
        drop(self.master.take());

        debug!(pid = self.pid.as_raw(), ?status, "shell session cleaned up");
        status
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait for `pid` to exit, escalating to SIGKILL on its process group once
/// `grace` has passed. Interactive shells commonly ignore SIGTERM.
fn reap(pid: Pid, grace: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + grace;

    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => return Some(exit_status(status)),
            Err(Errno::EINTR) => continue,
            // ECHILD: nothing left to reap.
            Err(errno) => {
                debug!(pid = pid.as_raw(), %errno, "nothing to reap");
                return None;
            }
        }

        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(REAP_POLL);
    }

    debug!(pid = pid.as_raw(), "shell ignored SIGTERM, killing");
    // The shell leads its own session, so its pid is also the group id.
    if killpg(pid, Signal::SIGKILL).is_err() {
        let _ = kill(pid, Signal::SIGKILL);
    }

    loop {
        match waitpid(pid, None) {
            Ok(status) => return Some(exit_status(status)),
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                debug!(pid = pid.as_raw(), %errno, "nothing to reap");
                return None;
            }
        }
    }
}

fn exit_status(status: WaitStatus) -> ExitStatus {
    match status {
        WaitStatus::Exited(_, code) => ExitStatus::Exited(code),
        WaitStatus::Signaled(_, signal, _) => ExitStatus::Signaled(signal as i32),
        _ => ExitStatus::Unknown,
    }
}

/// Builder for shell sessions
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    shell: Option<String>,
    args: Vec<String>,
    size: WindowSize,
    env_vars: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    kill_grace: Duration,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            shell: None,
            args: vec!["-i".to_string()],
            size: WindowSize::default(),
            env_vars: Vec::new(),
            cwd: None,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Shell to run instead of the `$SHELL` / default selection
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Replace the shell arguments (default: `-i`)
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn dimensions(mut self, rows: u16, cols: u16) -> Self {
        self.size = WindowSize::new(rows, cols);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Resolve the shell and environment into spawn options
    pub fn spawn_options(&self) -> SpawnOptions {
        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("COLORTERM".to_string(), "truecolor".to_string()),
        ];
        env.extend(self.env_vars.iter().cloned());

        SpawnOptions {
            shell: select_shell(self.shell.as_deref()),
            args: self.args.clone(),
            size: self.size,
            env,
            cwd: self.cwd.clone(),
        }
    }

    /// Start the session
    pub fn build(self) -> Result<ShellSession, PtyError> {
        let mut session = ShellSession::start(&self.spawn_options())?;
        session.set_kill_grace(self.kill_grace);
        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
