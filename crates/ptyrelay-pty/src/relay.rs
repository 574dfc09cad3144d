//! Bidirectional byte relay between an input stream, the PTY master and an
//! output stream.
//!
//! Single-threaded: a bounded `poll` over the input and the master keeps the
//! loop responsive to the interrupt flag without spinning.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Bytes moved per read in either direction
pub const CHUNK_SIZE: usize = 1024;

/// Upper bound on a single readiness wait
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why the relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The input stream reached EOF or failed
    StdinClosed,
    /// The shell side hung up
    MasterClosed,
    /// The output stream stopped accepting data
    OutputClosed,
    /// The interrupt flag was raised
    InterruptRequested,
}

/// Byte counters for one relay run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes written into the master
    pub bytes_in: u64,
    /// Bytes written to the output stream
    pub bytes_out: u64,
}

pub struct Relay<'a, W: Write> {
    input: File,
    master: &'a File,
    output: W,
    interrupt: Arc<AtomicBool>,
    chunk_size: usize,
    poll_interval: Duration,
    stats: RelayStats,
}

impl<'a, W: Write> Relay<'a, W> {
    /// `master` is expected to be non-blocking; `input` is only read after
    /// `poll` reports it ready, so it may be blocking.
    pub fn new(input: File, master: &'a File, output: W, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            input,
            master,
            output,
            interrupt,
            chunk_size: CHUNK_SIZE,
            poll_interval: POLL_INTERVAL,
            stats: RelayStats::default(),
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Relay until one side closes or the interrupt flag is raised
    pub fn run(&mut self) -> TerminationReason {
        let reason = self.run_loop();
        debug!(
            ?reason,
            bytes_in = self.stats.bytes_in,
            bytes_out = self.stats.bytes_out,
            "relay finished"
        );
        reason
    }

    fn run_loop(&mut self) -> TerminationReason {
        let mut inbound = vec![0u8; self.chunk_size];
        let mut outbound = vec![0u8; self.chunk_size];
        let timeout = poll_timeout(self.poll_interval);

        loop {
            if self.interrupted() {
                return TerminationReason::InterruptRequested;
            }

            let (input_ready, master_ready) = match self.wait_readable(timeout) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    debug!(%errno, "poll failed");
                    return TerminationReason::MasterClosed;
                }
            };

            if input_ready {
                if let Some(reason) = self.pump_input(&mut inbound, &mut outbound) {
                    return reason;
                }
            }
            if master_ready {
                if let Some(reason) = self.pump_output(&mut outbound) {
                    return reason;
                }
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn wait_readable(&self, timeout: PollTimeout) -> nix::Result<(bool, bool)> {
        let mut fds = [
            PollFd::new(self.input.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.master.as_fd(), PollFlags::POLLIN),
        ];
        if poll(&mut fds, timeout)? == 0 {
            return Ok((false, false));
        }
        Ok((is_readable(&fds[0]), is_readable(&fds[1])))
    }

    /// Input -> master
    fn pump_input(&mut self, buf: &mut [u8], scratch: &mut [u8]) -> Option<TerminationReason> {
        match self.input.read(buf) {
            Ok(0) => {
                debug!("input reached EOF");
                Some(TerminationReason::StdinClosed)
            }
            Ok(n) => self.feed_master(&buf[..n], scratch),
            Err(e) if is_transient(&e) => None,
            Err(e) => {
                debug!(error = %e, "input read failed");
                Some(TerminationReason::StdinClosed)
            }
        }
    }

    /// Write all of `data` into the non-blocking master. While the master is
    /// full, shell output keeps draining so the shell is never stuck writing.
    fn feed_master(&mut self, mut data: &[u8], scratch: &mut [u8]) -> Option<TerminationReason> {
        let mut master = self.master;

        while !data.is_empty() {
            match master.write(data) {
                Ok(0) => {
                    debug!("master accepted no bytes");
                    return Some(TerminationReason::MasterClosed);
                }
                Ok(n) => {
                    self.stats.bytes_in += n as u64;
                    data = &data[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.interrupted() {
                        return Some(TerminationReason::InterruptRequested);
                    }
                    match self.wait_writable() {
                        Ok(true) => {
                            if let Some(reason) = self.pump_output(scratch) {
                                return Some(reason);
                            }
                        }
                        Ok(false) | Err(Errno::EINTR) => {}
                        Err(errno) => {
                            debug!(%errno, "poll on master failed");
                            return Some(TerminationReason::MasterClosed);
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "master write failed");
                    return Some(TerminationReason::MasterClosed);
                }
            }
        }
        None
    }

    /// Wait for room in the master; `Ok(true)` means shell output is pending
    fn wait_writable(&self) -> nix::Result<bool> {
        let mut fds = [PollFd::new(
            self.master.as_fd(),
            PollFlags::POLLOUT | PollFlags::POLLIN,
        )];
        poll(&mut fds, poll_timeout(self.poll_interval))?;
        Ok(is_readable(&fds[0]))
    }

    /// Master -> output
    fn pump_output(&mut self, buf: &mut [u8]) -> Option<TerminationReason> {
        let mut master = self.master;

        match master.read(buf) {
            Ok(0) => {
                debug!("master reached EOF");
                Some(TerminationReason::MasterClosed)
            }
            Ok(n) => {
                if let Err(e) = self
                    .output
                    .write_all(&buf[..n])
                    .and_then(|()| self.output.flush())
                {
                    debug!(error = %e, "output write failed");
                    return Some(TerminationReason::OutputClosed);
                }
                self.stats.bytes_out += n as u64;
                None
            }
            // Non-blocking master with nothing buffered this time round.
            Err(e) if is_transient(&e) => None,
            // Linux reports EIO once every slave descriptor is closed.
            Err(e) => {
                debug!(error = %e, "master read failed");
                Some(TerminationReason::MasterClosed)
            }
        }
    }
}

fn is_readable(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|events| {
        events.intersects(
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
        )
    })
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    let millis = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(millis)
}
