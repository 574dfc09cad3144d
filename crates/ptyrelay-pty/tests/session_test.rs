//! Tests for shell session management and cleanup

use ptyrelay_pty::{ExitStatus, PtyError, SessionBuilder};
use ptyrelay_test_utils::{init_test_logging, process_exists, read_until, TestFixtures};
use std::time::Duration;

#[cfg(unix)]
mod unix_tests {
    use super::*;
    use serial_test::serial;

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn test_fixture_shell_announces_itself() {
        init_test_logging();
        let fixtures = TestFixtures::new().unwrap();
        let shell = fixtures.ready_shell().unwrap();

        let mut session = SessionBuilder::new()
            .shell(shell.to_string_lossy())
            .build()
            .expect("Should start session");

        let output = read_until(session.master().unwrap(), "READY", Duration::from_secs(5));
        assert!(text(&output).contains("READY"), "got {:?}", text(&output));

        assert!(session.shutdown().is_some());
    }

    #[test]
    fn test_child_sees_terminal_setup() {
        let fixtures = TestFixtures::new().unwrap();
        let shell = fixtures.probe_shell().unwrap();

        let session = SessionBuilder::new()
            .shell(shell.to_string_lossy())
            .cwd(fixtures.path())
            .build()
            .expect("Should start session");

        let output = text(&read_until(
            session.master().unwrap(),
            "CWD:",
            Duration::from_secs(5),
        ));
        let output = output + &text(&read_until(
            session.master().unwrap(),
            "\n",
            Duration::from_secs(1),
        ));

        assert!(output.contains("STDIN_IS_TTY"), "got {output:?}");
        assert!(output.contains("SIZE:30 80"), "got {output:?}");
        assert!(output.contains("TERM:xterm-256color"), "got {output:?}");
        assert!(output.contains("ARGS:-i"), "got {output:?}");

        let dir_name = fixtures.path().file_name().unwrap().to_string_lossy();
        assert!(output.contains(dir_name.as_ref()), "got {output:?}");
    }

    #[test]
    fn test_custom_dimensions_reach_the_shell() {
        let fixtures = TestFixtures::new().unwrap();
        let shell = fixtures.probe_shell().unwrap();

        let session = SessionBuilder::new()
            .shell(shell.to_string_lossy())
            .dimensions(24, 100)
            .build()
            .expect("Should start session");

        let output = text(&read_until(
            session.master().unwrap(),
            "SIZE:24 100",
            Duration::from_secs(5),
        ));
        assert!(output.contains("SIZE:24 100"), "got {output:?}");
    }

    #[test]
    fn test_shell_exit_is_reaped_with_status() {
        let fixtures = TestFixtures::new().unwrap();
        let shell = fixtures.probe_shell().unwrap();

        let mut session = SessionBuilder::new()
            .shell(shell.to_string_lossy())
            .build()
            .expect("Should start session");

        // Reads until the master hangs up.
        read_until(
            session.master().unwrap(),
            "never printed",
            Duration::from_secs(5),
        );

        assert_eq!(session.shutdown(), Some(ExitStatus::Exited(0)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let fixtures = TestFixtures::new().unwrap();
        let shell = fixtures.ready_shell().unwrap();

        let mut session = SessionBuilder::new()
            .shell(shell.to_string_lossy())
            .build()
            .expect("Should start session");
        let pid = session.pid().as_raw();

        read_until(session.master().unwrap(), "READY", Duration::from_secs(5));

        let first = session.shutdown();
        assert!(matches!(first, Some(ExitStatus::Signaled(15))), "got {first:?}");
        assert!(session.is_shut_down());
        assert!(session.master().is_none());
        assert!(!process_exists(pid));

        assert_eq!(session.shutdown(), None);
        assert!(session.resize(ptyrelay_pty::WindowSize::new(10, 10)).is_err());
    }

    #[test]
    fn test_drop_reaps_shell() {
        let fixtures = TestFixtures::new().unwrap();
        let shell = fixtures.ready_shell().unwrap();

        let session = SessionBuilder::new()
            .shell(shell.to_string_lossy())
            .build()
            .expect("Should start session");
        let pid = session.pid().as_raw();
        assert!(process_exists(pid));

        drop(session);
        assert!(!process_exists(pid));
    }

    #[test]
    fn test_shell_ignoring_sigterm_is_killed() {
        let fixtures = TestFixtures::new().unwrap();
        let shell = fixtures.stubborn_shell().unwrap();

        let mut session = SessionBuilder::new()
            .shell(shell.to_string_lossy())
            .kill_grace(Duration::from_millis(200))
            .build()
            .expect("Should start session");
        let pid = session.pid().as_raw();

        read_until(session.master().unwrap(), "READY", Duration::from_secs(5));

        assert_eq!(session.shutdown(), Some(ExitStatus::Signaled(9)));
        assert!(!process_exists(pid));
    }

    #[test]
    fn test_missing_shell_fails_to_start() {
        let result = SessionBuilder::new()
            .shell("/nonexistent/ptyrelay/shell")
            .build();

        match result {
            Err(PtyError::Exec { shell, .. }) => assert_eq!(shell, "/nonexistent/ptyrelay/shell"),
            other => panic!("expected exec failure, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_shell_taken_from_environment() {
        let fixtures = TestFixtures::new().unwrap();
        let shell = fixtures.ready_shell().unwrap();

        let original = std::env::var("SHELL").ok();
        std::env::set_var("SHELL", &shell);
        let result = SessionBuilder::new().build();
        match original {
            Some(value) => std::env::set_var("SHELL", value),
            None => std::env::remove_var("SHELL"),
        }

        let session = result.expect("Should start session from $SHELL");
        let output = read_until(session.master().unwrap(), "READY", Duration::from_secs(5));
        assert!(text(&output).contains("READY"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_later_shell_holds_only_its_own_terminal() {
        use ptyrelay_test_utils::open_descriptors;

        let sleeper = || {
            SessionBuilder::new()
                .shell("/bin/sleep")
                .args(["5"])
                .kill_grace(Duration::from_millis(200))
                .build()
                .expect("Should start session")
        };

        let mut first = sleeper();
        let mut second = sleeper();

        let first_tty = open_descriptors(first.pid().as_raw())
            .unwrap()
            .into_iter()
            .find(|(fd, _)| *fd == 0)
            .map(|(_, target)| target)
            .expect("first shell has stdin");
        let second_fds = open_descriptors(second.pid().as_raw()).unwrap();

        let std_streams: Vec<i32> = second_fds
            .iter()
            .map(|(fd, _)| *fd)
            .filter(|fd| *fd <= 2)
            .collect();
        assert_eq!(std_streams, vec![0, 1, 2]);

        let leaked: Vec<_> = second_fds
            .iter()
            .filter(|(fd, target)| {
                *fd > 2
                    && (target == &first_tty
                        || target.starts_with("/dev/pts")
                        || target.as_os_str() == "/dev/ptmx")
            })
            .collect();
        assert!(leaked.is_empty(), "second shell inherited {leaked:?}");

        assert!(second.shutdown().is_some());
        assert!(first.shutdown().is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_concurrent_spawns_do_not_share_terminals() {
        use ptyrelay_test_utils::open_descriptors;

        let leaked: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut extra = 0;
                        for _ in 0..5 {
                            let mut session = SessionBuilder::new()
                                .shell("/bin/sleep")
                                .args(["5"])
                                .kill_grace(Duration::from_millis(200))
                                .build()
                                .expect("Should start session");
                            extra += open_descriptors(session.pid().as_raw())
                                .unwrap()
                                .iter()
                                .filter(|(fd, target)| {
                                    *fd > 2
                                        && (target.starts_with("/dev/pts")
                                            || target.as_os_str() == "/dev/ptmx")
                                })
                                .count();
                            session.shutdown();
                        }
                        extra
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(leaked, 0);
    }
}
