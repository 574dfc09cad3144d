use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch directory holding stand-in shells for a test
pub struct TestFixtures {
    temp_dir: TempDir,
}

impl TestFixtures {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new()?,
        })
    }

    pub fn create_test_script(&self, name: &str, content: &str) -> Result<PathBuf> {
        let script_path = self.temp_dir.path().join(name);
        std::fs::write(&script_path, content)?;

        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms)?;

        Ok(script_path)
    }

    /// A shell that announces itself with `READY`, prints its pid, then
    /// echoes its terminal input back until it is terminated
    pub fn ready_shell(&self) -> Result<PathBuf> {
        self.create_test_script(
            "ready-shell",
            "#!/bin/sh\necho \"PID:$$\"\necho READY\nexec cat\n",
        )
    }

    /// A shell that ignores SIGTERM
    pub fn stubborn_shell(&self) -> Result<PathBuf> {
        self.create_test_script(
            "stubborn-shell",
            "#!/bin/sh\ntrap '' TERM\necho READY\nwhile :; do sleep 1; done\n",
        )
    }

    /// A shell that reports on its terminal and exits on its own
    pub fn probe_shell(&self) -> Result<PathBuf> {
        self.create_test_script(
            "probe-shell",
            "#!/bin/sh\n\
             [ -t 0 ] && echo STDIN_IS_TTY\n\
             echo \"SIZE:$(stty size)\"\n\
             echo \"TERM:$TERM\"\n\
             echo \"ARGS:$*\"\n\
             echo \"CWD:$(pwd)\"\n\
             exit 0\n",
        )
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}
