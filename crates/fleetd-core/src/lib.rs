//! fleetd-core - Application Hosting Control Plane Core
//!
//! This library implements the in-process half of the fleetd control plane:
//! the session scheduler, the worker-pool lifecycle manager, the session
//! registry, and the client side of the privileged process broker protocol.
//!
//! A hosted application ("tenant") receives client sessions that are bound
//! to a bounded pool of backing worker processes. The unprivileged main
//! process never forks or signals those processes itself: it asks a
//! privileged sibling process (the broker, see the `fleetd-broker` crate)
//! to do so over a framed message channel.
//!
//! # Modules
//!
//! - [`broker`]: wire protocol, message framing, and the unprivileged
//!   broker client with correlated privileged command execution
//! - [`config`]: fleet configuration (tenant quotas, broker settings)
//! - [`quota`]: quota override resolution and worker class keys
//! - [`registry`]: process-wide session registry with network-origin
//!   affinity matching
//! - [`scheduler`]: per-tenant admission control and worker assignment
//! - [`session`]: session model and snapshots
//! - [`worker`]: worker handles, lazy child creation, and escalating
//!   termination
//!
//! # Concurrency
//!
//! Scheduler scans and registry lookups are synchronous and run to
//! completion; there are no await points inside them. Everything that
//! waits on the broker or a child process (spawn, privileged exec,
//! disconnect confirmation) suspends on a channel instead of blocking.

pub mod broker;
pub mod config;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod worker;

pub use broker::{BrokerClient, BrokerError, ChildHandle, ExecOutput};
pub use config::{ConfigError, FleetConfig, OsIdentity};
pub use quota::{QuotaDefaults, QuotaOverride, ResolvedQuota};
pub use registry::{SessionFilter, SessionRegistry};
pub use scheduler::{TeardownConfig, Tenant};
pub use session::{Session, SessionId, SessionKind, SessionOptions, SessionScope};
pub use worker::{Worker, WorkerId};
