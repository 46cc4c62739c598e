//! Broker socket setup and the control-connection dispatch loop.
//!
//! The broker serves the main process over a Unix socket. Socket
//! permissions are set after binding; the parent directory is forced to
//! mode 0700 and stale socket files are removed before binding, so a
//! crashed previous broker never blocks a restart.
//!
//! One control connection is served at a time: the main process starts
//! the broker exactly once and connects exactly once. If the connection
//! drops, remaining children are killed (a worker process without its
//! control plane is an orphan) and the broker waits for a reconnect.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fleetd_core::broker::protocol::{BrokerEvent, BrokerRequest, read_frame, write_frame};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::exec;
use crate::relay::ChildTable;
use crate::spawn::WorkerSpec;

/// Socket permissions: owner read/write only.
const SOCKET_MODE: u32 = 0o600;

/// Parent directory permissions: owner only.
const DIRECTORY_MODE: u32 = 0o700;

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Socket setup or transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a control connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    /// The main process asked the broker to exit.
    Shutdown,
    /// The connection dropped without a shutdown request.
    Disconnected,
}

/// The privileged broker server.
pub struct BrokerServer {
    listener: UnixListener,
    path: PathBuf,
}

impl BrokerServer {
    /// Prepare the socket and bind.
    ///
    /// Creates the parent directory with mode 0700, removes a stale
    /// socket file if present, binds, then restricts the socket to mode
    /// 0600.
    ///
    /// # Errors
    ///
    /// Returns any filesystem or bind error.
    pub fn bind(path: &Path) -> Result<Self, ServerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(DIRECTORY_MODE))?;
        }
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))?;
        info!(path = %path.display(), "broker socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// The bound socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and serve control connections until a shutdown request.
    ///
    /// # Errors
    ///
    /// Returns any accept or transport error.
    pub async fn run(&self, runner: &WorkerSpec) -> Result<(), ServerError> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            info!("main process connected");
            match self.serve(stream, runner).await {
                Served::Shutdown => {
                    info!("shutdown requested, broker exiting");
                    return Ok(());
                }
                Served::Disconnected => {
                    warn!("main process disconnected, awaiting reconnect");
                }
            }
        }
    }

    async fn serve(&self, stream: UnixStream, runner: &WorkerSpec) -> Served {
        let (mut read_half, mut write_half) = stream.into_split();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<BrokerEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let payload = match serde_json::to_vec(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to encode broker event");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut write_half, &payload).await {
                    debug!(error = %e, "control connection lost while writing");
                    break;
                }
            }
        });

        let mut children = ChildTable::new(events_tx.clone(), runner.clone());
        let served = loop {
            match read_frame(&mut read_half).await {
                Ok(None) => break Served::Disconnected,
                Err(e) => {
                    warn!(error = %e, "control connection lost while reading");
                    break Served::Disconnected;
                }
                Ok(Some(bytes)) => match serde_json::from_slice::<BrokerRequest>(&bytes) {
                    Err(e) => warn!(error = %e, "discarding unparseable control frame"),
                    Ok(BrokerRequest::Shutdown) => break Served::Shutdown,
                    Ok(request) => dispatch(request, &mut children, &events_tx),
                },
            }
        };

        children.kill_all();
        writer.abort();
        served
    }
}

fn dispatch(
    request: BrokerRequest,
    children: &mut ChildTable,
    events: &mpsc::UnboundedSender<BrokerEvent>,
) {
    match request {
        BrokerRequest::SpawnChild {
            id,
            uid,
            gid,
            home_dir,
        } => children.spawn(id, uid, gid, home_dir),
        BrokerRequest::Relay { id, content } => children.forward(&id, content),
        BrokerRequest::KillChild { id } => children.kill(&id),
        BrokerRequest::Forget { id } => children.forget(&id),
        BrokerRequest::ExecCmd { cmdid, cmd, params } => {
            // Executed off the dispatch loop so slow commands do not
            // stall relaying; responses therefore may arrive out of
            // request order, and correlation is by cmdid alone.
            let events = events.clone();
            tokio::spawn(async move {
                let outcome = exec::run(&cmd, &params).await;
                let _ = events.send(BrokerEvent::ExecCmdResponse {
                    cmdid,
                    err: outcome.err,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                });
            });
        }
        BrokerRequest::Shutdown => unreachable!("handled by the serve loop"),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;
    use std::time::Duration;

    use fleetd_core::broker::BrokerClient;
    use fleetd_core::config::OsIdentity;
    use fleetd_core::worker::WorkerId;

    use super::*;

    fn identity(home: &Path) -> OsIdentity {
        OsIdentity {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            home_dir: home.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn bind_restricts_socket_and_directory_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("broker.sock");

        let server = BrokerServer::bind(&path).unwrap();
        assert_eq!(server.path(), path);

        let socket_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(socket_mode, SOCKET_MODE);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, DIRECTORY_MODE);
    }

    #[tokio::test]
    async fn stale_socket_files_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        fs::write(&path, b"stale").unwrap();

        BrokerServer::bind(&path).unwrap();
        assert!(fs::metadata(&path).unwrap().file_type().is_socket());
    }

    #[tokio::test]
    async fn exec_round_trips_through_a_real_broker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let server = BrokerServer::bind(&path).unwrap();
        let runner = WorkerSpec {
            command: "cat".into(),
            args: Vec::new(),
        };
        let server_task = tokio::spawn(async move { server.run(&runner).await });

        let client = BrokerClient::connect(&path, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let output = client.exec("echo", &["hi".to_string()]).await.unwrap();
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(client.pending_count(), 0);

        client.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn spawned_child_relays_payloads_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let home = tempfile::tempdir().unwrap();
        let server = BrokerServer::bind(&path).unwrap();
        let runner = WorkerSpec {
            command: "cat".into(),
            args: Vec::new(),
        };
        let server_task = tokio::spawn(async move { server.run(&runner).await });

        let client = BrokerClient::connect(&path, None).await.unwrap();
        let id = WorkerId::new("w-live");
        let mut handle = client.spawn_child(&id, &identity(home.path())).unwrap();

        client
            .send_to_child(&id, serde_json::json!({"ping": "pong"}))
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(5), handle.recv())
            .await
            .expect("no payload relayed")
            .unwrap();
        assert_eq!(payload["ping"], "pong");

        // Force-kill and wait for the synthesized completion to flip the
        // handle to disconnected.
        client.kill_child(&id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.disconnected())
            .await
            .expect("no completion signal");
        assert!(!handle.is_connected());

        client.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }
}
