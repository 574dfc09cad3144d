//! Low-level PTY allocation and shell spawning
//!
//! Each side of the fork keeps exactly one end of the pair: the child keeps
//! the slave as its controlling terminal, the parent keeps the master.

use crate::PtyError;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
#[cfg(not(target_vendor = "apple"))]
use nix::unistd::pipe2;
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult, Pid};
use std::collections::BTreeMap;
use std::ffi::{CString, OsString};
use std::fs::File;
use std::io::{self, Read};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::ptr;
use tracing::{debug, warn};

/// Exit status of a child whose shell could not be executed
pub const EXEC_FAILURE_STATUS: i32 = 127;

/// Exit status of a child that failed before reaching exec
const SETUP_FAILURE_STATUS: i32 = 1;

const STAGE_SETSID: u8 = 1;
const STAGE_DUP: u8 = 2;
const STAGE_EXEC: u8 = 3;
const REPORT_LEN: usize = 5;

/// Terminal window size applied to the slave before the shell starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(30, 80)
    }
}

impl From<WindowSize> for Winsize {
    fn from(size: WindowSize) -> Self {
        Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.pixel_width,
            ws_ypixel: size.pixel_height,
        }
    }
}

/// Issue a single `TIOCSWINSZ` request on a terminal descriptor
pub fn set_window_size(fd: RawFd, size: WindowSize) -> io::Result<()> {
    let winsize = Winsize::from(size);

    // SAFETY: TIOCSWINSZ only reads the winsize record for the duration of the call
    let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsize as *const Winsize) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// What to run inside the PTY and how
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Path of the shell binary
    pub shell: String,

    /// Arguments after argv[0]
    pub args: Vec<String>,

    /// Initial window size of the slave terminal
    pub size: WindowSize,

    /// Variables added to (or replacing) the inherited environment
    pub env: Vec<(String, String)>,

    /// Working directory for the shell
    pub cwd: Option<PathBuf>,
}

impl SpawnOptions {
    /// Interactive invocation of `shell` with the default window size
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            args: vec!["-i".to_string()],
            size: WindowSize::default(),
            env: Vec::new(),
            cwd: None,
        }
    }
}

/// Exec arguments converted before fork.
///
/// The child of a multi-threaded parent must not allocate, so the pointer
/// arrays handed to `execve` are built here as well.
struct ExecPlan {
    path: CString,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
    cwd: Option<CString>,
}

impl ExecPlan {
    fn prepare(options: &SpawnOptions) -> Result<Self, PtyError> {
        let path = to_cstring(options.shell.as_bytes(), "shell path")?;

        let mut argv = Vec::with_capacity(options.args.len() + 1);
        argv.push(path.clone());
        for arg in &options.args {
            argv.push(to_cstring(arg.as_bytes(), "shell argument")?);
        }

        let mut vars: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
        for (key, value) in &options.env {
            vars.insert(key.into(), value.into());
        }
        let envp = vars
            .iter()
            .map(|(key, value)| {
                let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
                entry.extend_from_slice(key.as_bytes());
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                to_cstring(&entry, "environment variable")
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cwd = options
            .cwd
            .as_ref()
            .map(|dir| to_cstring(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            path,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
            cwd,
        })
    }

    /// Replace the process image. Only returns on failure.
    fn exec(&self) -> nix::Error {
        // SAFETY: every pointer refers to a CString owned by `self`, and both
        // arrays end with a null pointer
        unsafe {
            libc::execve(
                self.path.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
        }
        nix::Error::last()
    }
}

fn to_cstring(bytes: &[u8], what: &str) -> Result<CString, PtyError> {
    CString::new(bytes)
        .map_err(|_| PtyError::InvalidArgument(format!("{what} contains a NUL byte")))
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// A freshly allocated pseudo-terminal pair
pub struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

impl Pty {
    /// Allocate a new PTY pair
    pub fn open() -> Result<Self, PtyError> {
        let OpenptyResult { master, slave } = openpty(None, None).map_err(PtyError::Allocation)?;
        // Neither end may leak into shells spawned later by this process.
        set_cloexec(master.as_raw_fd()).map_err(PtyError::Allocation)?;
        set_cloexec(slave.as_raw_fd()).map_err(PtyError::Allocation)?;
        Ok(Self { master, slave })
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn slave_fd(&self) -> RawFd {
        self.slave.as_raw_fd()
    }

    /// Fork and exec the shell with the slave as its controlling terminal.
    ///
    /// Returns once the child has either replaced its image or reported why
    /// it could not.
    pub fn spawn(self, options: &SpawnOptions) -> Result<PtyProcess, PtyError> {
        let plan = ExecPlan::prepare(options)?;
        let (report_rx, report_tx) = status_pipe()?;
        let Pty { master, slave } = self;

        // SAFETY: the child only runs async-signal-safe calls on memory
        // prepared before the fork, then execs or exits
        match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Child => {
                drop(report_rx);
                child_setup(master, slave, options.size, &plan, report_tx)
            }
            ForkResult::Parent { child } => {
                drop(report_tx);
                parent_setup(master, slave, child, report_rx, &options.shell)
            }
        }
    }
}

/// Pipe the child uses to report a failure before exec. Both ends are
/// close-on-exec, so a successful exec shows up as EOF in the parent.
#[cfg(not(target_vendor = "apple"))]
fn status_pipe() -> Result<(OwnedFd, OwnedFd), PtyError> {
    Ok(pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?)
}

// No pipe2 here: a fork from another thread between the two calls can
// still inherit the ends.
#[cfg(target_vendor = "apple")]
fn status_pipe() -> Result<(OwnedFd, OwnedFd), PtyError> {
    let (rx, tx) = nix::unistd::pipe().map_err(io::Error::from)?;
    for fd in [&rx, &tx] {
        set_cloexec(fd.as_raw_fd()).map_err(io::Error::from)?;
    }
    Ok((rx, tx))
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn child_setup(
    master: OwnedFd,
    slave: OwnedFd,
    size: WindowSize,
    plan: &ExecPlan,
    report: OwnedFd,
) -> ! {
    drop(master);

    if let Err(errno) = setsid() {
        child_fail(&report, STAGE_SETSID, errno, SETUP_FAILURE_STATUS);
    }

    let slave_raw = slave.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if let Err(errno) = dup2(slave_raw, target) {
            child_fail(&report, STAGE_DUP, errno, SETUP_FAILURE_STATUS);
        }
        // dup2 onto itself keeps the slave's close-on-exec flag.
        if let Err(errno) = fcntl(target, FcntlArg::F_SETFD(FdFlag::empty())) {
            child_fail(&report, STAGE_DUP, errno, SETUP_FAILURE_STATUS);
        }
    }
    if slave_raw > libc::STDERR_FILENO {
        drop(slave);
    } else {
        // Now owned by the standard stream it landed on.
        let _ = slave.into_raw_fd();
    }

    // SAFETY: plain ioctl/signal calls on the child's own descriptors
    unsafe {
        // The slave was opened before setsid, so it has to be claimed explicitly.
        // BSDs already attached it; a failure there leaves the shell without job control only.
        libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0);
        // Rust ignores SIGPIPE and that disposition would survive exec.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    // Size is cosmetic: on failure the kernel default stays in place.
    let _ = set_window_size(libc::STDIN_FILENO, size);

    if let Some(dir) = &plan.cwd {
        // An unusable directory leaves the shell in the inherited one.
        let _ = chdir(dir.as_c_str());
    }

    let errno = plan.exec();
    child_fail(&report, STAGE_EXEC, errno, EXEC_FAILURE_STATUS)
}

/// Report `errno` to the parent and terminate without running any parent code
fn child_fail(report: &OwnedFd, stage: u8, errno: nix::Error, status: i32) -> ! {
    let code = (errno as i32).to_be_bytes();
    let message = [stage, code[0], code[1], code[2], code[3]];

    // SAFETY: write and _exit are async-signal-safe
    unsafe {
        libc::write(
            report.as_raw_fd(),
            message.as_ptr().cast(),
            message.len(),
        );
        libc::_exit(status)
    }
}

fn parent_setup(
    master: OwnedFd,
    slave: OwnedFd,
    child: Pid,
    report: OwnedFd,
    shell: &str,
) -> Result<PtyProcess, PtyError> {
    drop(slave);

    match read_child_report(report) {
        Ok(None) => {}
        Ok(Some((stage, errno))) => {
            // The child has already called _exit; collect it before reporting.
            let _ = waitpid(child, None);
            let source = io::Error::from_raw_os_error(errno);
            return Err(match stage {
                STAGE_EXEC => PtyError::Exec {
                    shell: shell.to_string(),
                    source,
                },
                STAGE_SETSID => PtyError::ChildSetup {
                    stage: "setsid",
                    source,
                },
                _ => PtyError::ChildSetup {
                    stage: "dup2",
                    source,
                },
            });
        }
        Err(e) => {
            abandon_child(child);
            return Err(PtyError::Io(e));
        }
    }

    if let Err(errno) = set_nonblocking(master.as_raw_fd()) {
        abandon_child(child);
        return Err(PtyError::NonBlocking(errno));
    }

    debug!(pid = child.as_raw(), shell, "shell spawned");

    Ok(PtyProcess {
        master: File::from(master),
        pid: child,
    })
}

fn read_child_report(report: OwnedFd) -> io::Result<Option<(u8, i32)>> {
    let mut file = File::from(report);
    let mut buf = [0u8; REPORT_LEN];
    let mut filled = 0;

    while filled < REPORT_LEN {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    match filled {
        0 => Ok(None),
        REPORT_LEN => {
            let [stage, a, b, c, d] = buf;
            Ok(Some((stage, i32::from_be_bytes([a, b, c, d]))))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated child status report",
        )),
    }
}

/// Kill and reap a child that will never be handed to the caller
fn abandon_child(child: Pid) {
    if let Err(errno) = kill(child, Signal::SIGKILL) {
        warn!(pid = child.as_raw(), %errno, "failed to kill abandoned child");
    }
    let _ = waitpid(child, None);
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Parent-side handle of a shell running in a PTY
#[derive(Debug)]
pub struct PtyProcess {
    master: File,
    pid: Pid,
}

impl PtyProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The non-blocking master end
    pub fn master(&self) -> &File {
        &self.master
    }

    /// Apply a new window size through the master
    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        set_window_size(self.master.as_raw_fd(), size)?;
        Ok(())
    }

    /// Hand over the master descriptor and child pid
    pub fn into_parts(self) -> (File, Pid) {
        (self.master, self.pid)
    }
}
