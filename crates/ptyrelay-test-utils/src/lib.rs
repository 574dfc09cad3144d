pub mod fixtures;
pub mod terminal;

pub use fixtures::TestFixtures;
pub use terminal::{read_until, TerminalCapture};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("ptyrelay=debug,ptyrelay_pty=debug")),
            )
            .with_test_writer()
            .init();
    });
}

/// Whether `pid` still has a process-table entry (zombies included)
pub fn process_exists(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Poll `process_exists` until the process is gone or `timeout` passes
pub fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_exists(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    !process_exists(pid)
}

/// Descriptors held by `pid` and what they point at, from `/proc/<pid>/fd`
#[cfg(target_os = "linux")]
pub fn open_descriptors(pid: i32) -> std::io::Result<Vec<(i32, PathBuf)>> {
    let mut fds = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{pid}/fd"))? {
        let entry = entry?;
        let Some(fd) = entry.file_name().to_str().and_then(|n| n.parse().ok()) else {
            continue;
        };
        // The descriptor may close between listing and reading the link.
        if let Ok(target) = std::fs::read_link(entry.path()) {
            fds.push((fd, target));
        }
    }
    fds.sort();
    Ok(fds)
}

/// Pull the pid out of a `PID:<n>` line printed by a fixture shell
pub fn parse_pid(output: &str) -> Option<i32> {
    let start = output.find("PID:")? + 4;
    let digits: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
