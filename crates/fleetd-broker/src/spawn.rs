//! Worker process spawning with impersonation.
//!
//! The broker runs with elevated privileges; every worker child it forks
//! drops to the target tenant's uid/gid before exec and starts in that
//! tenant's home directory with `HOME` overridden. The child's stdio is
//! fully piped: stdin carries framed payloads from the main process,
//! stdout carries framed payloads back, stderr is folded into the log
//! relay line by line.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

/// Program the broker runs as a worker child, with its fixed arguments.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Worker executable.
    pub command: PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<String>,
}

/// A forked worker child with its handle and PID.
pub struct SpawnedWorker {
    /// The child process handle.
    pub child: Child,
    /// The OS process ID.
    pub pid: u32,
}

/// Spawning errors.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The process could not be forked or its PID obtained.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(String),
}

/// Fork a worker child impersonating `uid`/`gid` with `home_dir` as both
/// working directory and `HOME`.
///
/// # Errors
///
/// Returns `SpawnError::SpawnFailed` if the process cannot be spawned,
/// or if the PID cannot be obtained.
pub fn spawn_worker(
    spec: &WorkerSpec,
    uid: u32,
    gid: u32,
    home_dir: &Path,
) -> Result<SpawnedWorker, SpawnError> {
    let mut cmd = Command::new(&spec.command);

    cmd.args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("HOME", home_dir)
        .current_dir(home_dir)
        .kill_on_drop(false);

    cmd.uid(uid).gid(gid);

    let child = cmd
        .spawn()
        .map_err(|e| SpawnError::SpawnFailed(e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| SpawnError::SpawnFailed("failed to get process ID".to_string()))?;

    Ok(SpawnedWorker { child, pid })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_identity() -> (u32, u32) {
        (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    #[tokio::test]
    async fn spawns_under_the_requested_home_directory() {
        let home = tempfile::tempdir().unwrap();
        let (uid, gid) = current_identity();
        let spec = WorkerSpec {
            command: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "test \"$HOME\" = \"$PWD\"".to_string()],
        };

        let mut spawned = spawn_worker(&spec, uid, gid, home.path()).unwrap();
        assert!(spawned.pid > 0);

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn missing_worker_binary_is_a_spawn_error() {
        let home = tempfile::tempdir().unwrap();
        let (uid, gid) = current_identity();
        let spec = WorkerSpec {
            command: PathBuf::from("nonexistent_worker_binary_12345"),
            args: Vec::new(),
        };

        let result = spawn_worker(&spec, uid, gid, home.path());
        assert!(matches!(result, Err(SpawnError::SpawnFailed(_))));
    }
}
