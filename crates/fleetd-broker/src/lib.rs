//! fleetd-broker - Privileged Process Broker Library
//!
//! The broker is the privileged sibling of the unprivileged main process.
//! It is started exactly once, before the main process drops its own
//! privileges, and from then on is the only process with the rights to:
//!
//! - fork worker child processes impersonating a target OS user/group
//!   with a home-directory override
//! - relay opaque messages between the main process and each child,
//!   in order per child id
//! - execute privileged commands (including multi-step composite
//!   sequences) and answer with correlated responses
//! - synthesize a completion signal when a child dies without a prior
//!   graceful disconnect
//!
//! All coordination with the main process is by message passing over a
//! Unix socket carrying length-prefixed JSON frames; the wire protocol
//! lives in `fleetd_core::broker::protocol`.
//!
//! # Modules
//!
//! - [`server`]: socket setup and the per-connection dispatch loop
//! - [`relay`]: the child table and per-child forwarding tasks
//! - [`spawn`]: fork/impersonate of worker processes
//! - [`exec`]: privileged command execution and composite sequences

pub mod exec;
pub mod relay;
pub mod server;
pub mod spawn;

pub use server::BrokerServer;
pub use spawn::WorkerSpec;
