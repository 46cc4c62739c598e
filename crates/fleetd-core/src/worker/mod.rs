//! Worker handles and process lifecycle.
//!
//! A worker is a bounded pool of sessions that share exactly one backing
//! OS process, created lazily through the broker. Termination is a
//! two-phase contract: a graceful disconnect is relayed to the child, and
//! a single deferred escalation check force-kills it if it still reports
//! connected once the grace window has elapsed. The escalation is one
//! armed/fired timer per worker, not a retry loop; if the child
//! disconnects before the window elapses the timer cancels.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerError, ChildHandle};
use crate::config::OsIdentity;
use crate::quota::ResolvedQuota;
use crate::session::{Session, SessionId, SessionOptions};

/// Unique worker identifier; also keys the broker's child map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a worker id from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random worker id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observable state of an escalation timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    /// Grace window running; the forced kill may still fire.
    Armed,
    /// The grace window elapsed with the child still connected and the
    /// forced kill was issued.
    Fired,
    /// The child disconnected in time, or the timer was cancelled.
    Cancelled,
}

const STATE_ARMED: u8 = 0;
const STATE_FIRED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// One-shot graceful-to-forced escalation timer.
///
/// Arms a deferred check: after `grace`, if the watched flag still reads
/// `true`, runs the escalation action exactly once and moves to `Fired`;
/// otherwise moves to `Cancelled`.
#[derive(Debug)]
pub struct EscalationTimer {
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl EscalationTimer {
    /// Arm the timer.
    pub fn arm<F>(grace: Duration, still_connected: watch::Receiver<bool>, escalate: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(STATE_ARMED));
        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if *still_connected.borrow() {
                if task_state
                    .compare_exchange(
                        STATE_ARMED,
                        STATE_FIRED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    escalate();
                }
            } else {
                let _ = task_state.compare_exchange(
                    STATE_ARMED,
                    STATE_CANCELLED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        });
        Self { state, task }
    }

    /// Cancel the timer if it has not fired yet.
    pub fn cancel(&self) {
        if self
            .state
            .compare_exchange(
                STATE_ARMED,
                STATE_CANCELLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.task.abort();
        }
    }

    /// Current timer state.
    #[must_use]
    pub fn state(&self) -> EscalationState {
        match self.state.load(Ordering::SeqCst) {
            STATE_FIRED => EscalationState::Fired,
            STATE_CANCELLED => EscalationState::Cancelled,
            _ => EscalationState::Armed,
        }
    }
}

/// Default grace window between the graceful disconnect and the forced
/// kill.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(3000);

fn disconnect_payload() -> serde_json::Value {
    serde_json::json!({ "type": "disconnect" })
}

/// A bounded pool of sessions sharing one backing OS process.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    class: ResolvedQuota,
    sessions: Vec<Arc<Session>>,
    child: Option<ChildHandle>,
    escalation: Option<EscalationTimer>,
}

impl Worker {
    /// Create a worker of the given class with no sessions and no backing
    /// process.
    #[must_use]
    pub fn new(class: ResolvedQuota) -> Self {
        Self {
            id: WorkerId::generate(),
            class,
            sessions: Vec::new(),
            child: None,
            escalation: None,
        }
    }

    /// The worker id.
    #[must_use]
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// The worker's class key. Immutable after creation.
    #[must_use]
    pub fn class(&self) -> &ResolvedQuota {
        &self.class
    }

    /// Current load: the number of hosted sessions.
    #[must_use]
    pub fn load(&self) -> usize {
        self.sessions.len()
    }

    /// The hosted sessions.
    #[must_use]
    pub fn sessions(&self) -> &[Arc<Session>] {
        &self.sessions
    }

    /// Materialize a new session on this worker.
    pub fn open_session(&mut self, options: SessionOptions) -> Arc<Session> {
        let session = Arc::new(Session::bind(self.id.clone(), options));
        self.sessions.push(Arc::clone(&session));
        session
    }

    /// Remove a hosted session, returning it if present.
    pub fn close_session(&mut self, id: &SessionId) -> Option<Arc<Session>> {
        let index = self.sessions.iter().position(|s| s.id() == id)?;
        Some(self.sessions.remove(index))
    }

    /// Whether a backing process has been created.
    #[must_use]
    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// Whether the backing process currently reports connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.child.as_ref().is_some_and(ChildHandle::is_connected)
    }

    /// The escalation timer state, if termination has been requested.
    #[must_use]
    pub fn escalation_state(&self) -> Option<EscalationState> {
        self.escalation.as_ref().map(EscalationTimer::state)
    }

    /// Mutable access to the backing child handle, for draining relayed
    /// payloads.
    pub fn child_mut(&mut self) -> Option<&mut ChildHandle> {
        self.child.as_mut()
    }

    /// Create the backing process if it does not exist yet. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the spawn directive cannot be sent.
    pub fn ensure_child_process(
        &mut self,
        broker: &BrokerClient,
        identity: &OsIdentity,
    ) -> Result<(), BrokerError> {
        if self.child.is_some() {
            return Ok(());
        }
        let handle = broker.spawn_child(&self.id, identity)?;
        debug!(worker = %self.id, uid = identity.uid, "backing process requested");
        self.child = Some(handle);
        Ok(())
    }

    /// Begin two-phase termination: relay a graceful disconnect, then
    /// force-kill after `grace` if the child still reports connected.
    ///
    /// Calling again while an escalation is armed is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the disconnect cannot be relayed.
    pub fn terminate(&mut self, broker: &BrokerClient, grace: Duration) -> Result<(), BrokerError> {
        let Some(child) = &self.child else {
            return Ok(());
        };
        if self
            .escalation
            .as_ref()
            .is_some_and(|t| t.state() == EscalationState::Armed)
        {
            return Ok(());
        }

        broker.send_to_child(&self.id, disconnect_payload())?;

        let escalate_broker = broker.clone();
        let escalate_id = self.id.clone();
        self.escalation = Some(EscalationTimer::arm(
            grace,
            child.connected_watch(),
            move || {
                debug!(worker = %escalate_id, "grace window elapsed, force-killing child");
                let _ = escalate_broker.kill_child(&escalate_id);
            },
        ));
        Ok(())
    }

    /// Force-remove the backing process without waiting: cancel any armed
    /// escalation, kill outright, and tell the broker to forget the id.
    pub fn abandon(&mut self, broker: &BrokerClient) {
        if let Some(timer) = &self.escalation {
            timer.cancel();
        }
        if self.child.take().is_some() {
            let _ = broker.kill_child(&self.id);
            let _ = broker.forget(self.id.as_str());
        }
    }
}
