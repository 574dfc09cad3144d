//! Relay loop against real shells

use ptyrelay_pty::{SessionBuilder, TerminationReason};
use ptyrelay_test_utils::{init_test_logging, process_exists, TerminalCapture, TestFixtures};
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
mod unix_tests {
    use super::*;

    fn input_pipe() -> (File, File) {
        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        (File::from(rx), File::from(tx))
    }

    #[test]
    fn test_echo_hi_round_trip() {
        init_test_logging();
        let mut session = SessionBuilder::new()
            .shell("/bin/sh")
            .env("PS1", "$ ")
            .env("ENV", "")
            .build()
            .expect("Should start /bin/sh");

        let (input, mut input_tx) = input_pipe();
        input_tx.write_all(b"echo hi\nexit\n").unwrap();

        let capture = TerminalCapture::new();
        let reason = session.relay(input, capture.clone(), Arc::default());
        drop(input_tx);

        assert_eq!(reason, TerminationReason::MasterClosed);
        // Once in the terminal echo of the command, once as its output.
        let output = capture.text();
        assert!(output.matches("hi").count() >= 2, "got {output:?}");
        assert!(session.shutdown().is_some());
    }

    #[test]
    fn test_input_eof_ends_session() {
        let fixtures = TestFixtures::new().unwrap();
        let mut session = SessionBuilder::new()
            .shell(fixtures.ready_shell().unwrap().to_string_lossy())
            .build()
            .expect("Should start session");
        let pid = session.pid().as_raw();

        let (input, input_tx) = input_pipe();
        drop(input_tx);

        let reason = session.relay(input, std::io::sink(), Arc::default());
        assert_eq!(reason, TerminationReason::StdinClosed);

        assert!(session.shutdown().is_some());
        assert!(!process_exists(pid));
    }

    #[test]
    fn test_interrupt_during_session() {
        let fixtures = TestFixtures::new().unwrap();
        let mut session = SessionBuilder::new()
            .shell(fixtures.ready_shell().unwrap().to_string_lossy())
            .build()
            .expect("Should start session");
        let pid = session.pid().as_raw();

        let (input, _input_tx) = input_pipe();
        let capture = TerminalCapture::new();
        let interrupt = Arc::new(AtomicBool::new(false));

        let reason = std::thread::scope(|scope| {
            let relay = scope.spawn(|| session.relay(input, capture.clone(), Arc::clone(&interrupt)));
            assert!(capture.wait_for("READY", Duration::from_secs(5)));
            interrupt.store(true, Ordering::SeqCst);
            relay.join().unwrap()
        });

        assert_eq!(reason, TerminationReason::InterruptRequested);
        assert!(session.shutdown().is_some());
        assert!(!process_exists(pid));
    }

    #[test]
    fn test_many_chunks_arrive_intact() {
        let fixtures = TestFixtures::new().unwrap();
        let mut session = SessionBuilder::new()
            .shell(fixtures.ready_shell().unwrap().to_string_lossy())
            .build()
            .expect("Should start session");

        let (input, mut input_tx) = input_pipe();
        let capture = TerminalCapture::new();
        let interrupt = Arc::new(AtomicBool::new(false));

        let lines: Vec<String> = (0..300).map(|i| format!("line-{i:04}")).collect();
        let payload = lines.join("\n") + "\n";
        assert!(payload.len() > 3 * 1024);

        let reason = std::thread::scope(|scope| {
            let relay = scope.spawn(|| session.relay(input, capture.clone(), Arc::clone(&interrupt)));
            assert!(capture.wait_for("READY", Duration::from_secs(5)));

            input_tx.write_all(payload.as_bytes()).unwrap();

            // Terminal echo plus cat's copy.
            let deadline = std::time::Instant::now() + Duration::from_secs(10);
            while capture.text().matches("line-0299").count() < 2
                && std::time::Instant::now() < deadline
            {
                std::thread::sleep(Duration::from_millis(20));
            }

            interrupt.store(true, Ordering::SeqCst);
            relay.join().unwrap()
        });
        assert_eq!(reason, TerminationReason::InterruptRequested);

        let output = capture.text();
        for line in &lines {
            assert!(
                output.matches(line.as_str()).count() >= 2,
                "{line} missing or truncated"
            );
        }
        session.shutdown();
    }
}
