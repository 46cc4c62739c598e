//! Per-tenant session scheduling and admission control.
//!
//! Each tenant owns an ordered list of workers partitioned into disjoint
//! classes by resolved quota. Assignment is a synchronous scan that runs
//! to completion; nothing awaits while the worker list is being read or
//! mutated, so no lock is needed around it beyond the owning handle.
//!
//! Assignment algorithm, per request:
//!
//! 1. Resolve the quota in effect (first matching override, wildcard
//!    fallback).
//! 2. Scan the workers of that class, tracking the least-loaded candidate
//!    (first found wins on equal load) and the summed class load.
//! 3. Admission control: reject once the summed load has reached
//!    `max_users`. This is backpressure, not an error.
//! 4. Spread policy: discard the candidate when its load has reached
//!    `min_users_per_worker` while the class is still under `max_workers`,
//!    forcing a fresh worker.
//! 5. Create a worker if no usable candidate remains; append it to the
//!    tenant's list.
//! 6. Let the chosen worker materialize the session.
//!
//! Consequences that are relied upon: `min_users_per_worker == 0` forces
//! every request onto a fresh worker until `max_workers` is reached, and
//! once the class is at `max_workers` all further admitted sessions pack
//! into the least-loaded worker regardless of the spread threshold.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::config::{OsIdentity, TenantConfig};
use crate::quota::{self, QuotaDefaults, QuotaOverride};
use crate::session::{Session, SessionId, SessionOptions};
use crate::worker::Worker;

/// Timing knobs for tenant teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownConfig {
    /// Grace window between graceful disconnect and forced kill, per
    /// worker.
    pub grace: Duration,
    /// Interval between drain checks.
    pub drain_poll: Duration,
    /// Hard cap on the drain wait; stragglers are force-removed after it.
    pub drain_timeout: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace: crate::worker::DEFAULT_GRACE,
            drain_poll: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// A hosted application owning a quota policy and a pool of workers.
#[derive(Debug)]
pub struct Tenant {
    name: String,
    defaults: QuotaDefaults,
    overrides: Vec<QuotaOverride>,
    identity: OsIdentity,
    workers: Vec<Worker>,
}

impl Tenant {
    /// Create a tenant with no workers.
    pub fn new(
        name: impl Into<String>,
        defaults: QuotaDefaults,
        overrides: Vec<QuotaOverride>,
        identity: OsIdentity,
    ) -> Self {
        Self {
            name: name.into(),
            defaults,
            overrides,
            identity,
            workers: Vec::new(),
        }
    }

    /// Build a tenant from its configuration entry.
    #[must_use]
    pub fn from_config(config: &TenantConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.quota(),
            config.overrides.clone(),
            config.identity(),
        )
    }

    /// The tenant name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The OS identity worker children are spawned under.
    #[must_use]
    pub fn identity(&self) -> &OsIdentity {
        &self.identity
    }

    /// The tenant's workers, in creation order.
    #[must_use]
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Mutable access to a worker by id.
    pub fn worker_mut(&mut self, id: &crate::worker::WorkerId) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.id() == id)
    }

    /// Assign a new session, creating a worker if the quota calls for
    /// one.
    ///
    /// Returns `None` when the class has exhausted its capacity. This is
    /// a backpressure signal the caller must surface distinctly from
    /// failures.
    pub fn assign(&mut self, options: SessionOptions) -> Option<Arc<Session>> {
        let resolved = quota::resolve(&self.defaults, &self.overrides, &options);

        let mut candidate: Option<(usize, usize)> = None; // (index, load)
        let mut total_load = 0;
        let mut class_size = 0;
        for (index, worker) in self.workers.iter().enumerate() {
            if worker.class() != &resolved {
                continue;
            }
            class_size += 1;
            let load = worker.load();
            total_load += load;
            if candidate.is_none_or(|(_, best)| load < best) {
                candidate = Some((index, load));
            }
        }

        if total_load >= resolved.max_users {
            info!(
                tenant = %self.name,
                class = %resolved.match_type,
                total_load,
                max_users = resolved.max_users,
                "capacity exhausted, rejecting session"
            );
            return None;
        }

        if let Some((_, load)) = candidate {
            if load >= resolved.min_users_per_worker && class_size < resolved.max_workers {
                candidate = None;
            }
        }

        let index = match candidate {
            Some((index, _)) => index,
            None => {
                self.workers.push(Worker::new(resolved));
                self.workers.len() - 1
            }
        };
        Some(self.workers[index].open_session(options))
    }

    /// Close a session by id, wherever it is hosted.
    pub fn close_session(&mut self, id: &SessionId) -> Option<Arc<Session>> {
        self.workers.iter_mut().find_map(|w| w.close_session(id))
    }

    /// Summed load across all workers.
    #[must_use]
    pub fn total_load(&self) -> usize {
        self.workers.iter().map(Worker::load).sum()
    }

    /// Tear down every worker: graceful disconnects with escalation, a
    /// bounded drain wait, then forced removal of stragglers.
    ///
    /// Completes within `drain_timeout` plus one poll interval even when
    /// no worker ever acknowledges the disconnect.
    pub async fn terminate_all(&mut self, broker: &BrokerClient, config: &TeardownConfig) {
        for worker in &mut self.workers {
            if let Err(e) = worker.terminate(broker, config.grace) {
                warn!(tenant = %self.name, worker = %worker.id(), error = %e,
                    "failed to request graceful disconnect");
            }
        }

        let deadline = Instant::now() + config.drain_timeout;
        loop {
            self.workers.retain(Worker::is_connected);
            if self.workers.is_empty() {
                info!(tenant = %self.name, "all workers drained");
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(config.drain_poll).await;
        }

        // Drain window exhausted: force-remove whatever is left rather
        // than blocking shutdown indefinitely.
        warn!(
            tenant = %self.name,
            stragglers = self.workers.len(),
            "drain timeout exceeded, force-removing remaining workers"
        );
        for worker in &mut self.workers {
            warn!(tenant = %self.name, worker = %worker.id(), load = worker.load(),
                "force-removing worker");
            worker.abandon(broker);
        }
        self.workers.clear();
    }

    /// A serializable point-in-time view for status output.
    #[must_use]
    pub fn snapshot(&self) -> TenantSnapshot {
        TenantSnapshot {
            name: self.name.clone(),
            total_load: self.total_load(),
            workers: self
                .workers
                .iter()
                .map(|w| WorkerSnapshot {
                    id: w.id().to_string(),
                    class: w.class().match_type.clone(),
                    load: w.load(),
                    has_child: w.has_child(),
                    connected: w.is_connected(),
                })
                .collect(),
        }
    }
}

/// Point-in-time view of a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSnapshot {
    /// Tenant name.
    pub name: String,
    /// Summed load across all workers.
    pub total_load: usize,
    /// Worker views, in creation order.
    pub workers: Vec<WorkerSnapshot>,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Worker id.
    pub id: String,
    /// Class match type.
    pub class: String,
    /// Session count.
    pub load: usize,
    /// Whether a backing process exists.
    pub has_child: bool,
    /// Whether the backing process reports connected.
    pub connected: bool,
}
