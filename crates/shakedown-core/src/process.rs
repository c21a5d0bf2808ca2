//! Peer process primitives.
//!
//! Spawning with a constructed environment and piped stdio, executable
//! validation ahead of any spawn attempt, stderr forwarding into the host
//! log, and TERM-then-KILL termination. The session state machine owns the
//! policy; this module owns the mechanics.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;
use tracing::debug;

/// Process-level errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable path is missing, not a file, or not executable.
    ///
    /// Raised before any spawn attempt, so no process exists when this is
    /// returned.
    #[error("peer binary not found or not executable: {path}")]
    BinaryNotFound {
        /// The rejected path.
        path: PathBuf,
    },

    /// The OS refused the spawn after the path validated.
    #[error("failed to spawn peer: {source}")]
    Spawn {
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A stdio pipe was not available on the spawned child.
    #[error("failed to capture peer {stream}")]
    MissingStream {
        /// Which pipe was absent.
        stream: &'static str,
    },
}

/// What to run and with which environment.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Path to the executable.
    pub command: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Entries applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Creates a spec with no arguments or environment entries.
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// Checks that a path exists, is a regular file, and is executable.
///
/// # Errors
///
/// Returns [`ProcessError::BinaryNotFound`]; never touches the process
/// table.
pub fn validate_executable(path: &Path) -> Result<(), ProcessError> {
    use std::os::unix::fs::PermissionsExt;

    let not_found = || ProcessError::BinaryNotFound {
        path: path.to_path_buf(),
    };

    let metadata = std::fs::metadata(path).map_err(|_| not_found())?;
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(not_found());
    }
    Ok(())
}

/// A spawned peer process with its stdio pipes.
///
/// The child is killed on drop as a backstop; orderly paths go through
/// [`PluginProcess::terminate`].
pub struct PluginProcess {
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
    command: String,
}

/// Spawns a peer according to its spec.
///
/// stdin is closed, stdout is piped (it carries the handshake line), and
/// stderr is forwarded line-by-line into the host log under the
/// `shakedown::peer` target.
///
/// # Errors
///
/// [`ProcessError::BinaryNotFound`] before any spawn attempt,
/// [`ProcessError::Spawn`] if the OS rejects it.
pub fn spawn(spec: &ProcessSpec) -> Result<PluginProcess, ProcessError> {
    validate_executable(&spec.command)?;

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn { source })?;

    let command = spec.command.display().to_string();
    let stdout = child
        .stdout
        .take()
        .map(BufReader::new)
        .ok_or(ProcessError::MissingStream { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(ProcessError::MissingStream { stream: "stderr" })?;
    forward_stderr(stderr, command.clone());

    debug!(peer = %command, pid = ?child.id(), "spawned peer process");

    Ok(PluginProcess {
        child,
        stdout: Some(stdout),
        command,
    })
}

/// Forwards peer stderr lines into the host's structured log.
fn forward_stderr(stderr: ChildStderr, peer: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "shakedown::peer", peer = %peer, "{line}");
        }
    });
}

impl PluginProcess {
    /// Takes the buffered stdout reader; available exactly once.
    #[must_use]
    pub fn take_stdout(&mut self) -> Option<BufReader<ChildStdout>> {
        self.stdout.take()
    }

    /// OS process id, `None` once the child has been reaped.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the child has already exited.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Begins killing the child without waiting.
    pub fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Terminates the child: SIGTERM, bounded grace wait, then SIGKILL.
    ///
    /// Always reaps the child and never errors; safe to call on a child
    /// that already exited.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        if let Some(pid) = self.child.id().and_then(|p| i32::try_from(p).ok()) {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
        }

        if !grace.is_zero() {
            if let Ok(waited) = timeout(grace, self.child.wait()).await {
                let status = waited.ok();
                debug!(peer = %self.command, ?status, "peer exited within grace period");
                return status;
            }
            debug!(peer = %self.command, grace_ms = grace.as_millis() as u64, "grace period elapsed, killing peer");
        }

        let _ = self.child.start_kill();
        self.child.wait().await.ok()
    }
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("command", &self.command)
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn validate_rejects_missing_path() {
        let result = validate_executable(Path::new("/no/such/binary"));
        assert!(matches!(result, Err(ProcessError::BinaryNotFound { .. })));
    }

    #[test]
    fn validate_rejects_non_executable_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain-file");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(matches!(
            validate_executable(&path),
            Err(ProcessError::BinaryNotFound { .. })
        ));
    }

    #[test]
    fn validate_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            validate_executable(dir.path()),
            Err(ProcessError::BinaryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn spawn_captures_stdout() {
        let mut spec = ProcessSpec::new("/bin/echo");
        spec.args = vec!["hello".to_string()];

        let mut process = spawn(&spec).unwrap();
        let mut stdout = process.take_stdout().unwrap();
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "hello");

        let status = process.terminate(Duration::from_millis(500)).await;
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn spawn_applies_environment_overlay() {
        let mut spec = ProcessSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), "printf %s \"$SHAKEDOWN_TEST_VAR\"".to_string()];
        spec.env = vec![("SHAKEDOWN_TEST_VAR".to_string(), "overlay".to_string())];

        let mut process = spawn(&spec).unwrap();
        let mut stdout = process.take_stdout().unwrap();
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        assert_eq!(line, "overlay");

        process.terminate(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn terminate_kills_a_sleeping_child_promptly() {
        let mut spec = ProcessSpec::new("/bin/sleep");
        spec.args = vec!["30".to_string()];

        let mut process = spawn(&spec).unwrap();
        let started = Instant::now();
        let status = process.terminate(Duration::from_millis(200)).await;

        assert!(status.is_some());
        assert!(!status.unwrap().success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(process.id().is_none());
    }

    #[tokio::test]
    async fn terminate_twice_is_harmless() {
        let mut spec = ProcessSpec::new("/bin/echo");
        spec.args = vec!["done".to_string()];

        let mut process = spawn(&spec).unwrap();
        let first = process.terminate(Duration::from_millis(500)).await;
        let second = process.terminate(Duration::from_millis(500)).await;

        assert!(first.is_some());
        // The child is already reaped; a second terminate stays quiet.
        assert!(second.is_none() || second == first);
    }
}
