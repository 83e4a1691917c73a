use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use crate::error::{Result, SessionError};

/// Wrapper around the engine subprocess.
///
/// The engine talks to the session over the socket; its stdout and stderr
/// only carry diagnostics and are handed to the monitors.
pub struct EngineProcess {
    child: Child,
    pub stdout: Option<BufReader<ChildStdout>>,
    pub stderr: Option<BufReader<ChildStderr>>,
}

impl EngineProcess {
    /// Spawn the engine with the given arguments and extra environment
    pub fn spawn(path: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(path);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(SessionError::Spawn)?;
        debug!(path, pid = ?child.id(), "engine process spawned");

        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);

        Ok(Self {
            child,
            stdout,
            stderr,
        })
    }

    /// Wait for the process to exit and return the exit status
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(SessionError::Io)
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.map_err(SessionError::Io)
    }

    /// Check if the process has exited
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().map_err(SessionError::Io)
    }

    /// Get the process ID; `None` once the process has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
