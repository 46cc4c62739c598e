//! Child table and message relaying.
//!
//! One entry per forked worker child, keyed by the id the main process
//! assigned. Each child gets a single inbox queue, so messages addressed
//! to one id reach it in send order; there is no ordering guarantee
//! across ids.
//!
//! Child stdout frames are classified: log-typed records are forwarded
//! untagged into the main process's logging stream, completion records
//! mark the child completed and forward as a tagged completion signal,
//! everything else forwards as a tagged relay payload. When a child
//! exits without having reported completion, the completion signal is
//! synthesized so its owner can unwind instead of hanging.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fleetd_core::broker::protocol::{BrokerEvent, read_frame, write_frame};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::spawn::{self, WorkerSpec};

/// How one child stdout frame should be handled.
#[derive(Debug, PartialEq)]
enum ChildMessage {
    /// Fold into the main process's logging stream, untagged.
    Log { level: String, message: String },
    /// The child announced completion.
    Completed,
    /// Opaque payload, forward tagged.
    Payload(serde_json::Value),
}

fn classify(bytes: &[u8]) -> ChildMessage {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return ChildMessage::Log {
            level: "warn".to_string(),
            message: String::from_utf8_lossy(bytes).into_owned(),
        };
    };
    match value.get("type").and_then(serde_json::Value::as_str) {
        Some("log") => ChildMessage::Log {
            level: value
                .get("level")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("info")
                .to_string(),
            message: value
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        Some("session_completed") => ChildMessage::Completed,
        _ => ChildMessage::Payload(value),
    }
}

struct ChildEntry {
    inbox: mpsc::UnboundedSender<serde_json::Value>,
    pid: u32,
    completed: Arc<AtomicBool>,
}

/// Map from child id to running worker child, mutated only by the broker
/// process.
pub struct ChildTable {
    events: mpsc::UnboundedSender<BrokerEvent>,
    runner: WorkerSpec,
    children: HashMap<String, ChildEntry>,
}

impl ChildTable {
    /// Create an empty table emitting events to `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<BrokerEvent>, runner: WorkerSpec) -> Self {
        Self {
            events,
            runner,
            children: HashMap::new(),
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when no child is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Fork a worker child for `id` and begin relaying.
    ///
    /// Failures do not tear anything down: they are logged, forwarded to
    /// the main process's logging stream, and followed by a completion
    /// signal so the owner does not wait on a child that never existed.
    pub fn spawn(&mut self, id: String, uid: u32, gid: u32, home_dir: PathBuf) {
        if self.children.contains_key(&id) {
            warn!(%id, "ignoring spawn for already-tracked child");
            return;
        }

        let spawned = match spawn::spawn_worker(&self.runner, uid, gid, &home_dir) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(%id, error = %e, "failed to fork worker child");
                self.emit(BrokerEvent::Log {
                    level: "error".to_string(),
                    message: format!("failed to fork worker child {id}: {e}"),
                });
                self.emit(BrokerEvent::SessionCompleted { id });
                return;
            }
        };

        info!(%id, pid = spawned.pid, uid, gid, "forked worker child");
        let mut child = spawned.child;
        let completed = Arc::new(AtomicBool::new(false));
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<serde_json::Value>();

        // Inbox: single queue per id, delivered in send order.
        if let Some(mut stdin) = child.stdin.take() {
            let inbox_id = id.clone();
            tokio::spawn(async move {
                while let Some(payload) = inbox_rx.recv().await {
                    let Ok(bytes) = serde_json::to_vec(&payload) else {
                        continue;
                    };
                    if let Err(e) = write_frame(&mut stdin, &bytes).await {
                        debug!(id = %inbox_id, error = %e, "child stdin closed");
                        break;
                    }
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            let stdout_id = id.clone();
            let stdout_completed = Arc::clone(&completed);
            tokio::spawn(async move {
                let mut stdout = stdout;
                while let Ok(Some(bytes)) = read_frame(&mut stdout).await {
                    let event = match classify(&bytes) {
                        ChildMessage::Log { level, message } => {
                            BrokerEvent::Log { level, message }
                        }
                        ChildMessage::Completed => {
                            stdout_completed.store(true, Ordering::SeqCst);
                            BrokerEvent::SessionCompleted {
                                id: stdout_id.clone(),
                            }
                        }
                        ChildMessage::Payload(content) => BrokerEvent::Relay {
                            id: stdout_id.clone(),
                            content,
                        },
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if events
                        .send(BrokerEvent::Log {
                            level: "warn".to_string(),
                            message: line,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        // Reaper: synthesize the completion signal on unexpected death.
        let events = self.events.clone();
        let reaper_id = id.clone();
        let reaper_completed = Arc::clone(&completed);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(id = %reaper_id, %status, "worker child exited"),
                Err(e) => warn!(id = %reaper_id, error = %e, "failed to reap worker child"),
            }
            if !reaper_completed.swap(true, Ordering::SeqCst) {
                debug!(id = %reaper_id, "synthesizing completion for dead child");
                let _ = events.send(BrokerEvent::SessionCompleted { id: reaper_id });
            }
        });

        self.children.insert(
            id,
            ChildEntry {
                inbox: inbox_tx,
                pid: spawned.pid,
                completed,
            },
        );
    }

    /// Queue a payload for the child identified by `id`.
    pub fn forward(&self, id: &str, content: serde_json::Value) {
        match self.children.get(id) {
            Some(entry) => {
                if entry.inbox.send(content).is_err() {
                    debug!(%id, "dropping payload for exited child");
                }
            }
            None => warn!(%id, "dropping payload for unknown child id"),
        }
    }

    /// Force-kill the child identified by `id`.
    pub fn kill(&self, id: &str) {
        match self.children.get(id) {
            Some(entry) => {
                #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
                match kill(Pid::from_raw(entry.pid as i32), Signal::SIGKILL) {
                    Ok(()) => info!(%id, pid = entry.pid, "force-killed worker child"),
                    // Already gone; the reaper will have synthesized
                    // completion.
                    Err(e) => debug!(%id, pid = entry.pid, error = %e, "kill failed"),
                }
            }
            None => warn!(%id, "kill requested for unknown child id"),
        }
    }

    /// Drop the entry for `id`, if any. Closing the inbox ends the stdin
    /// task, which closes the child's stdin.
    pub fn forget(&mut self, id: &str) {
        if self.children.remove(id).is_some() {
            debug!(%id, "forgot child");
        }
    }

    /// Force-kill every remaining child and clear the table.
    pub fn kill_all(&mut self) {
        for id in self.children.keys().cloned().collect::<Vec<_>>() {
            if !self.children[&id].completed.load(Ordering::SeqCst) {
                self.kill(&id);
            }
        }
        self.children.clear();
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(command: &str) -> WorkerSpec {
        WorkerSpec {
            command: command.into(),
            args: Vec::new(),
        }
    }

    fn identity() -> (u32, u32) {
        (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> BrokerEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for broker event")
            .expect("event channel closed")
    }

    #[test]
    fn classification_covers_log_completion_and_payload() {
        let log = classify(br#"{"type":"log","level":"debug","message":"ready"}"#);
        assert_eq!(
            log,
            ChildMessage::Log {
                level: "debug".to_string(),
                message: "ready".to_string(),
            }
        );

        let completed = classify(br#"{"type":"session_completed"}"#);
        assert_eq!(completed, ChildMessage::Completed);

        let payload = classify(br#"{"rows": 3}"#);
        assert!(matches!(payload, ChildMessage::Payload(_)));

        // Unparseable frames fold into the log stream instead of being
        // dropped silently.
        let garbage = classify(b"not json");
        assert!(matches!(garbage, ChildMessage::Log { .. }));
    }

    #[tokio::test]
    async fn payloads_round_trip_through_a_cat_child() {
        let home = tempfile::tempdir().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut table = ChildTable::new(events_tx, runner("cat"));
        let (uid, gid) = identity();

        table.spawn("w-echo".to_string(), uid, gid, home.path().to_path_buf());
        assert_eq!(table.len(), 1);

        // cat copies the framed payload from stdin to stdout verbatim,
        // so it comes back as a tagged relay event.
        table.forward("w-echo", serde_json::json!({"ping": 1}));
        match next_event(&mut events_rx).await {
            BrokerEvent::Relay { id, content } => {
                assert_eq!(id, "w-echo");
                assert_eq!(content["ping"], 1);
            }
            other => panic!("expected relay, got {other:?}"),
        }

        // Dropping the entry closes stdin; cat exits without having
        // reported completion, so the signal is synthesized.
        table.forget("w-echo");
        match next_event(&mut events_rx).await {
            BrokerEvent::SessionCompleted { id } => assert_eq!(id, "w-echo"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dead_child_gets_a_synthesized_completion() {
        let home = tempfile::tempdir().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut table = ChildTable::new(events_tx, runner("true"));
        let (uid, gid) = identity();

        table.spawn("w-dead".to_string(), uid, gid, home.path().to_path_buf());

        match next_event(&mut events_rx).await {
            BrokerEvent::SessionCompleted { id } => assert_eq!(id, "w-dead"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_spawn_reports_and_completes() {
        let home = tempfile::tempdir().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut table = ChildTable::new(events_tx, runner("nonexistent_worker_binary_12345"));
        let (uid, gid) = identity();

        table.spawn("w-bad".to_string(), uid, gid, home.path().to_path_buf());
        assert!(table.is_empty());

        match next_event(&mut events_rx).await {
            BrokerEvent::Log { level, message } => {
                assert_eq!(level, "error");
                assert!(message.contains("w-bad"));
            }
            other => panic!("expected log, got {other:?}"),
        }
        match next_event(&mut events_rx).await {
            BrokerEvent::SessionCompleted { id } => assert_eq!(id, "w-bad"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stderr_lines_fold_into_the_log_relay() {
        let home = tempfile::tempdir().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let spec = WorkerSpec {
            command: "sh".into(),
            args: vec!["-c".to_string(), "echo oops >&2".to_string()],
        };
        let mut table = ChildTable::new(events_tx, spec);
        let (uid, gid) = identity();

        table.spawn("w-noisy".to_string(), uid, gid, home.path().to_path_buf());

        let mut saw_log = false;
        for _ in 0..2 {
            match next_event(&mut events_rx).await {
                BrokerEvent::Log { message, .. } => {
                    assert_eq!(message, "oops");
                    saw_log = true;
                }
                BrokerEvent::SessionCompleted { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_log);
    }

    #[tokio::test]
    async fn kill_terminates_a_lingering_child() {
        let home = tempfile::tempdir().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let spec = WorkerSpec {
            command: "sleep".into(),
            args: vec!["600".to_string()],
        };
        let mut table = ChildTable::new(events_tx, spec);
        let (uid, gid) = identity();

        table.spawn("w-linger".to_string(), uid, gid, home.path().to_path_buf());
        table.kill("w-linger");

        match next_event(&mut events_rx).await {
            BrokerEvent::SessionCompleted { id } => assert_eq!(id, "w-linger"),
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
