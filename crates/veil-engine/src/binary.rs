//! One-shot engine invocations (`version`, `api statsquery`)

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Location of the engine executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBinary {
    pub executable: PathBuf,
    pub working_dir: Option<PathBuf>,
}

impl EngineBinary {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn path(&self) -> &Path {
        &self.executable
    }

    /// Run the engine with `args` and collect its output
    ///
    /// The child is killed if it outlives `timeout`; that case is reported
    /// as [`io::ErrorKind::TimedOut`].
    pub(crate) async fn output(&self, args: &[&str], timeout: Duration) -> io::Result<Output> {
        let mut command = Command::new(&self.executable);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        match tokio::time::timeout(timeout, command.output()).await {
            Ok(output) => output,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} {} timed out", self.executable.display(), args.join(" ")),
            )),
        }
    }
}
