//! Unprivileged client side of the broker protocol.
//!
//! The client owns the main-process halves of the broker state: the
//! pending-response map for privileged commands (one entry per in-flight
//! `cmdid`, removed exactly once when the matching response arrives) and
//! the per-child relay subscriptions. Both maps are mutated only from this
//! process; the broker's child map is mutated only by the broker.
//!
//! There is no timeout on privileged round trips unless one is configured:
//! a hung broker leaves the caller pending, which preserves callers that
//! rely on unbounded waits for long-running privileged operations. With
//! `exec_timeout` set, an overdue request fails with
//! [`BrokerError::Unresponsive`] and its pending entry is dropped so a
//! late response is discarded rather than delivered twice.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{BrokerEvent, BrokerRequest, read_frame, write_frame};
use crate::config::OsIdentity;
use crate::worker::WorkerId;

/// Errors surfaced by the broker client.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Connecting to the broker socket failed.
    #[error("failed to connect to broker: {0}")]
    ConnectionFailed(String),

    /// The broker connection is gone; the request was not delivered or
    /// its reply can no longer arrive.
    #[error("broker channel closed")]
    ChannelClosed,

    /// A child is already registered under this worker id.
    #[error("a child is already registered for worker {0}")]
    DuplicateChild(String),

    /// The privileged command ran and reported a failure.
    #[error("privileged command failed: {message}")]
    CommandFailed {
        /// First error reported by the command or sequence.
        message: String,
        /// Captured standard output up to the failure.
        stdout: String,
        /// Captured standard error up to the failure.
        stderr: String,
    },

    /// No reply arrived within the configured `exec_timeout`.
    #[error("broker unresponsive: no reply within {0:?}")]
    Unresponsive(Duration),

    /// Transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Captured output of a successful privileged command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

struct ExecReply {
    err: Option<String>,
    stdout: String,
    stderr: String,
}

struct RelayEntry {
    payloads: mpsc::UnboundedSender<serde_json::Value>,
    connected: watch::Sender<bool>,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ExecReply>>>>;
type RelayMap = Arc<Mutex<HashMap<WorkerId, RelayEntry>>>;

/// Handle to one broker child, owned by exactly one worker.
///
/// `connected` starts `true` at spawn time and flips to `false` once the
/// broker reports completion for this id, whether the child disconnected
/// gracefully or died and had the signal synthesized.
#[derive(Debug)]
pub struct ChildHandle {
    id: WorkerId,
    payloads: mpsc::UnboundedReceiver<serde_json::Value>,
    connected: watch::Receiver<bool>,
}

impl ChildHandle {
    /// The child's worker id.
    #[must_use]
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Whether the child currently reports connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// A watch on the connected flag, for deferred checks.
    #[must_use]
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Receive the next child-originated payload. Returns `None` once the
    /// relay subscription is gone.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.payloads.recv().await
    }

    /// Wait until the child no longer reports connected.
    pub async fn disconnected(&mut self) {
        while *self.connected.borrow() {
            if self.connected.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Client end of the broker connection.
///
/// Cheap to clone; all clones share the same connection, pending map, and
/// relay subscriptions.
#[derive(Clone)]
pub struct BrokerClient {
    tx: mpsc::UnboundedSender<BrokerRequest>,
    pending: PendingMap,
    relays: RelayMap,
    exec_timeout: Option<Duration>,
}

impl BrokerClient {
    /// Connect to the broker's Unix socket.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the socket cannot be
    /// reached.
    pub async fn connect(
        path: &Path,
        exec_timeout: Option<Duration>,
    ) -> Result<Self, BrokerError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_stream(stream, exec_timeout))
    }

    /// Build a client over an already-connected stream.
    #[must_use]
    pub fn from_stream(stream: UnixStream, exec_timeout: Option<Duration>) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let relays: RelayMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_loop(write_half, rx));
        tokio::spawn(read_loop(read_half, Arc::clone(&pending), Arc::clone(&relays)));

        Self {
            tx,
            pending,
            relays,
            exec_timeout,
        }
    }

    /// Ask the broker to fork a worker child impersonating `identity`.
    ///
    /// The relay subscription is registered before the spawn directive is
    /// sent, so messages addressed to the child queue against it; no
    /// explicit ack is waited for.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DuplicateChild`] if a child is already
    /// registered for `id`, or [`BrokerError::ChannelClosed`] if the
    /// connection is gone.
    pub fn spawn_child(
        &self,
        id: &WorkerId,
        identity: &OsIdentity,
    ) -> Result<ChildHandle, BrokerError> {
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(true);

        {
            let mut relays = self.relays.lock().expect("relay map poisoned");
            if relays.contains_key(id) {
                return Err(BrokerError::DuplicateChild(id.to_string()));
            }
            relays.insert(
                id.clone(),
                RelayEntry {
                    payloads: payload_tx,
                    connected: connected_tx,
                },
            );
        }

        let directive = BrokerRequest::SpawnChild {
            id: id.to_string(),
            uid: identity.uid,
            gid: identity.gid,
            home_dir: identity.home_dir.clone(),
        };
        if let Err(e) = self.send(directive) {
            self.relays.lock().expect("relay map poisoned").remove(id);
            return Err(e);
        }

        Ok(ChildHandle {
            id: id.clone(),
            payloads: payload_rx,
            connected: connected_rx,
        })
    }

    /// Forward an opaque payload to the child identified by `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] if the connection is gone.
    pub fn send_to_child(
        &self,
        id: &WorkerId,
        content: serde_json::Value,
    ) -> Result<(), BrokerError> {
        self.send(BrokerRequest::Relay {
            id: id.to_string(),
            content,
        })
    }

    /// Force-kill the child identified by `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] if the connection is gone.
    pub fn kill_child(&self, id: &WorkerId) -> Result<(), BrokerError> {
        self.send(BrokerRequest::KillChild { id: id.to_string() })
    }

    /// Tell the broker to forget `id` and drop the local relay
    /// subscription for it, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] if the connection is gone.
    pub fn forget(&self, id: &str) -> Result<(), BrokerError> {
        self.relays
            .lock()
            .expect("relay map poisoned")
            .remove(&WorkerId::new(id));
        self.send(BrokerRequest::Forget { id: id.to_string() })
    }

    /// Ask the broker to terminate remaining children and exit.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] if the connection is gone.
    pub fn shutdown(&self) -> Result<(), BrokerError> {
        self.send(BrokerRequest::Shutdown)
    }

    /// Execute a privileged command under the broker's elevated identity
    /// and wait for the correlated response.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::CommandFailed`] when the command ran and reported
    ///   an error
    /// - [`BrokerError::Unresponsive`] when `exec_timeout` is configured
    ///   and elapsed
    /// - [`BrokerError::ChannelClosed`] when the connection died before a
    ///   reply arrived
    pub async fn exec(&self, cmd: &str, params: &[String]) -> Result<ExecOutput, BrokerError> {
        let cmdid = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(cmdid.clone(), reply_tx);

        let request = BrokerRequest::ExecCmd {
            cmdid: cmdid.clone(),
            cmd: cmd.to_string(),
            params: params.to_vec(),
        };
        if let Err(e) = self.send(request) {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&cmdid);
            return Err(e);
        }

        let reply = match self.exec_timeout {
            None => reply_rx.await.map_err(|_| BrokerError::ChannelClosed)?,
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => return Err(BrokerError::ChannelClosed),
                Err(_) => {
                    self.pending
                        .lock()
                        .expect("pending map poisoned")
                        .remove(&cmdid);
                    return Err(BrokerError::Unresponsive(limit));
                }
            },
        };

        match reply.err {
            Some(message) => Err(BrokerError::CommandFailed {
                message,
                stdout: reply.stdout,
                stderr: reply.stderr,
            }),
            None => Ok(ExecOutput {
                stdout: reply.stdout,
                stderr: reply.stderr,
            }),
        }
    }

    /// Number of privileged commands still awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }

    /// Number of live relay subscriptions.
    #[must_use]
    pub fn relay_count(&self) -> usize {
        self.relays.lock().expect("relay map poisoned").len()
    }

    fn send(&self, request: BrokerRequest) -> Result<(), BrokerError> {
        self.tx.send(request).map_err(|_| BrokerError::ChannelClosed)
    }
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<BrokerRequest>,
) {
    while let Some(request) = rx.recv().await {
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode broker request");
                continue;
            }
        };
        if let Err(e) = write_frame(&mut half, &payload).await {
            error!(error = %e, "broker connection lost while writing");
            break;
        }
    }
}

async fn read_loop(mut half: OwnedReadHalf, pending: PendingMap, relays: RelayMap) {
    loop {
        match read_frame(&mut half).await {
            Ok(None) => {
                info!("broker closed the control connection");
                break;
            }
            Err(e) => {
                error!(error = %e, "broker connection lost while reading");
                break;
            }
            Ok(Some(bytes)) => match serde_json::from_slice::<BrokerEvent>(&bytes) {
                Ok(event) => dispatch_event(event, &pending, &relays),
                Err(e) => warn!(error = %e, "discarding unparseable broker frame"),
            },
        }
    }

    // Unblock everything still waiting on this connection: pending execs
    // observe a dropped sender, workers observe a disconnect.
    pending.lock().expect("pending map poisoned").clear();
    for entry in relays.lock().expect("relay map poisoned").values() {
        let _ = entry.connected.send(false);
    }
}

fn dispatch_event(event: BrokerEvent, pending: &PendingMap, relays: &RelayMap) {
    match event {
        BrokerEvent::ExecCmdResponse {
            cmdid,
            err,
            stdout,
            stderr,
        } => {
            let reply_tx = pending
                .lock()
                .expect("pending map poisoned")
                .remove(&cmdid);
            match reply_tx {
                Some(tx) => {
                    let _ = tx.send(ExecReply {
                        err,
                        stdout,
                        stderr,
                    });
                }
                None => warn!(%cmdid, "response for unknown or expired correlation id"),
            }
        }
        BrokerEvent::Relay { id, content } => {
            let relays = relays.lock().expect("relay map poisoned");
            match relays.get(&WorkerId::new(&id)) {
                Some(entry) => {
                    let _ = entry.payloads.send(content);
                }
                None => warn!(%id, "relayed payload for unknown child id"),
            }
        }
        BrokerEvent::SessionCompleted { id } => {
            let relays = relays.lock().expect("relay map poisoned");
            match relays.get(&WorkerId::new(&id)) {
                Some(entry) => {
                    debug!(%id, "child reported completed");
                    let _ = entry.connected.send(false);
                }
                None => debug!(%id, "completion signal for unknown child id"),
            }
        }
        BrokerEvent::Log { level, message } => match level.as_str() {
            "error" => error!(target: "fleetd::broker", "{message}"),
            "warn" => warn!(target: "fleetd::broker", "{message}"),
            "debug" => debug!(target: "fleetd::broker", "{message}"),
            _ => info!(target: "fleetd::broker", "{message}"),
        },
    }
}
