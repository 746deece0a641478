//! Subprocess invocation with captured output and a wall-clock bound.
//!
//! Exit status is the only success signal; stdout and stderr are kept for
//! diagnostics.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use tracing::debug;

use crate::error::ProcessError;

/// Captured result of a successful command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Builder for one external tool invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_owned());
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    /// Kill the process if it is still running after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn run(self) -> Result<CmdOutput, ProcessError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        debug!(program = %self.program, args = ?self.args, "spawning");
        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Dropping the pending future drops the child, which kills it.
        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| ProcessError::Timeout {
                    program: self.program.clone(),
                    timeout,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| ProcessError::Wait {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(CmdOutput { stdout, stderr })
        } else {
            Err(ProcessError::Status {
                program: self.program,
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            })
        }
    }

    /// [`Self::run`] from synchronous code.
    ///
    /// Inside a runtime this must be called from a blocking thread such as
    /// `spawn_blocking`; outside one a current-thread runtime is built.
    pub fn run_blocking(self) -> Result<CmdOutput, ProcessError> {
        if let Ok(handle) = Handle::try_current() {
            return handle.block_on(self.run());
        }
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| ProcessError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        runtime.block_on(self.run())
    }
}
