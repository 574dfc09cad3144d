#[cfg(unix)]
#[test]
fn allocate_and_resize_pty() {
    use ptyrelay_pty::pty::{set_window_size, Pty, WindowSize};
    let pty = Pty::open().expect("allocate pty");
    // Basic resize should succeed on the master
    set_window_size(pty.master_fd(), WindowSize::new(30, 100)).expect("resize");
    assert!(pty.master_fd() >= 0);
}

#[cfg(unix)]
#[test]
fn spawned_process_can_be_resized() {
    use ptyrelay_pty::{Pty, SpawnOptions, WindowSize};
    let mut options = SpawnOptions::new("/bin/sh");
    options.args = vec!["-c".to_string(), "sleep 1".to_string()];

    let process = Pty::open().unwrap().spawn(&options).expect("spawn");
    process.resize(WindowSize::new(50, 132)).expect("resize");

    let pid = process.pid();
    drop(process);
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
    let _ = nix::sys::wait::waitpid(pid, None);
}
