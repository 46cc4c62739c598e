//! Session model.
//!
//! A session is one client's bound unit of work. It belongs to exactly one
//! worker for its entire lifetime and is destroyed explicitly by its owner
//! or by worker/tenant teardown.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::WorkerId;

/// Unique session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session id from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random session id.
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

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declared session type.
///
/// The declared type participates in quota override matching: an override
/// rule applies only to requests of its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Interactive browser session.
    Web,
    /// Stateless REST request session.
    Rest,
    /// Long-lived server-to-server session.
    ServerSession,
    /// Data synchronization session.
    Sync,
    /// Test-harness session.
    Test,
}

impl SessionKind {
    /// Stable string form, as used in quota override rules.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Rest => "rest",
            Self::ServerSession => "server_session",
            Self::Sync => "sync",
            Self::Test => "test",
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = UnknownSessionKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Self::Web),
            "rest" => Ok(Self::Rest),
            "server_session" => Ok(Self::ServerSession),
            "sync" => Ok(Self::Sync),
            "test" => Ok(Self::Test),
            other => Err(UnknownSessionKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown session kind string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown session kind: {0}")]
pub struct UnknownSessionKind(pub String);

/// Which registry map a session lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    /// Editor-style session; at most one live editing session per project
    /// is enforced upstream via affinity lookup.
    Editor,
    /// Application session.
    Application,
}

/// Options a session is created with.
///
/// These are the resolved per-request options; affinity filters match
/// against them (see [`crate::registry::SessionFilter`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Declared session type.
    pub kind: SessionKind,
    /// Registry scope.
    pub scope: SessionScope,
    /// Raw request query string, used for quota override substring
    /// matching.
    pub query: Option<String>,
    /// Whether the session is read-only.
    pub read_only: bool,
    /// Owning project.
    pub project: String,
    /// Owning user name.
    pub user: String,
    /// Network origin of the master connection, if known.
    pub master_ip: Option<IpAddr>,
}

impl SessionOptions {
    /// Options for a session of the given kind; remaining fields take
    /// their defaults.
    pub fn new(kind: SessionKind, project: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            kind,
            project: project.into(),
            user: user.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            kind: SessionKind::Web,
            scope: SessionScope::Application,
            query: None,
            read_only: false,
            project: String::new(),
            user: String::new(),
            master_ip: None,
        }
    }
}

/// One client's bound unit of work, owned by exactly one worker.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    worker: WorkerId,
    options: SessionOptions,
    opened_at: DateTime<Utc>,
}

impl Session {
    /// Create a session bound to `worker`. Called by the worker on
    /// assignment; not constructed directly by callers.
    pub(crate) fn bind(worker: WorkerId, options: SessionOptions) -> Self {
        Self {
            id: SessionId::generate(),
            worker,
            options,
            opened_at: Utc::now(),
        }
    }

    /// The session id.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The owning worker id.
    #[must_use]
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// The resolved options the session was created with.
    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Owning project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.options.project
    }

    /// Owning user name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.options.user
    }

    /// Recorded master-connection IP, if any.
    #[must_use]
    pub fn master_ip(&self) -> Option<IpAddr> {
        self.options.master_ip
    }

    /// A serializable point-in-time snapshot for status/administration.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            worker: self.worker.clone(),
            kind: self.options.kind,
            scope: self.options.scope,
            project: self.options.project.clone(),
            user: self.options.user.clone(),
            read_only: self.options.read_only,
            master_ip: self.options.master_ip,
            opened_at: self.opened_at,
        }
    }
}

/// Point-in-time view of a session, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: SessionId,
    /// Owning worker id.
    pub worker: WorkerId,
    /// Declared type.
    pub kind: SessionKind,
    /// Registry scope.
    pub scope: SessionScope,
    /// Owning project.
    pub project: String,
    /// Owning user.
    pub user: String,
    /// Read-only flag.
    pub read_only: bool,
    /// Master connection origin.
    pub master_ip: Option<IpAddr>,
    /// Creation time.
    pub opened_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            SessionKind::Web,
            SessionKind::Rest,
            SessionKind::ServerSession,
            SessionKind::Sync,
            SessionKind::Test,
        ] {
            let parsed: SessionKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }

        assert!("editor".parse::<SessionKind>().is_err());
    }

    #[test]
    fn bound_session_records_owner_and_options() {
        let worker = WorkerId::generate();
        let options = SessionOptions::new(SessionKind::Rest, "demo", "alice");
        let session = Session::bind(worker.clone(), options);

        assert_eq!(session.worker(), &worker);
        assert_eq!(session.project(), "demo");
        assert_eq!(session.user(), "alice");
        assert!(!session.options().read_only);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.id, *session.id());
        assert_eq!(snapshot.kind, SessionKind::Rest);
    }
}
