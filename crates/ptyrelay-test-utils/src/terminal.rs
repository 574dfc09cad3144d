use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::AsFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Output sink that can be inspected while a relay is still writing to it
#[derive(Debug, Clone, Default)]
pub struct TerminalCapture {
    raw_output: Arc<Mutex<Vec<u8>>>,
}

impl TerminalCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.raw_output.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text().contains(needle)
    }

    /// Wait until `needle` shows up; false on timeout
    pub fn wait_for(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.contains(needle) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.contains(needle)
    }
}

impl Write for TerminalCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.raw_output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read a non-blocking descriptor until `needle` appears, it hangs up, or
/// `timeout` passes. Returns everything read.
pub fn read_until(mut source: &File, needle: &str, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];

    while Instant::now() < deadline {
        if String::from_utf8_lossy(&collected).contains(needle) {
            break;
        }

        let mut fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(50u16)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(_) => break,
        }

        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }

    collected
}
