//! Process-wide session registry and affinity matching.
//!
//! The registry keeps two id-keyed maps (editor-style sessions and
//! application sessions) plus the registration order, and answers
//! affinity lookups with a linear scan. Registry sizes are bounded by
//! concurrently active users, so correctness is preferred over indexing:
//! no caching, no incremental index.
//!
//! The registry is constructed by the embedding process and threaded
//! through handles; it is not ambient module state. All mutation happens
//! on the owning thread; lookups run to completion without interleaving.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::broker::BrokerClient;
use crate::session::{Session, SessionId, SessionKind, SessionScope, SessionSnapshot};

/// Normalize a network origin for comparison: IPv4-mapped IPv6 forms
/// collapse to plain IPv4, and every loopback variant collapses to
/// `127.0.0.1`.
#[must_use]
pub fn canonical_origin(ip: IpAddr) -> IpAddr {
    let ip = ip.to_canonical();
    if ip.is_loopback() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        ip
    }
}

/// Affinity filter for [`SessionRegistry::find_open_session`].
///
/// Every set predicate must hold for a session to match. The `request`
/// predicate is special: it compares network origins after
/// canonicalization, and on mismatch still succeeds if the request origin
/// equals the origin of any currently connected companion device of the
/// session's owning user.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Required declared type.
    pub kind: Option<SessionKind>,
    /// Required read-only flag value.
    pub read_only: Option<bool>,
    /// Required owning user.
    pub user: Option<String>,
    /// Request network origin to compare against the session's recorded
    /// master-connection origin.
    pub request: Option<IpAddr>,
}

/// Process-wide maps from session identifier to session.
pub struct SessionRegistry {
    editor: HashMap<SessionId, Arc<Session>>,
    application: HashMap<SessionId, Arc<Session>>,
    /// Registration order across both maps; scans follow it so "first
    /// open session" is deterministic.
    order: Vec<SessionId>,
    /// Origins of currently connected companion devices, per user.
    companions: HashMap<String, Vec<IpAddr>>,
    broker: BrokerClient,
}

impl SessionRegistry {
    /// Create an empty registry that notifies `broker` on unregister.
    #[must_use]
    pub fn new(broker: BrokerClient) -> Self {
        Self {
            editor: HashMap::new(),
            application: HashMap::new(),
            order: Vec::new(),
            companions: HashMap::new(),
            broker,
        }
    }

    /// Add a session to the map its scope selects.
    pub fn register(&mut self, session: Arc<Session>) {
        let id = session.id().clone();
        debug!(session = %id, scope = ?session.options().scope, "registering session");
        let map = match session.options().scope {
            SessionScope::Editor => &mut self.editor,
            SessionScope::Application => &mut self.application,
        };
        if map.insert(id.clone(), session).is_none() {
            self.order.push(id);
        }
    }

    /// Remove a session and tell the broker to forget its id.
    pub fn unregister(&mut self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self
            .editor
            .remove(id)
            .or_else(|| self.application.remove(id))?;
        self.order.retain(|known| known != id);
        if let Err(e) = self.broker.forget(id.as_str()) {
            warn!(session = %id, error = %e, "failed to notify broker of closed session");
        }
        Some(removed)
    }

    /// Number of registered sessions across both maps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.editor.len() + self.application.len()
    }

    /// True when no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a connected companion device origin for `user`.
    pub fn register_companion(&mut self, user: impl Into<String>, origin: IpAddr) {
        self.companions.entry(user.into()).or_default().push(origin);
    }

    /// Drop a companion device origin for `user`.
    pub fn unregister_companion(&mut self, user: &str, origin: IpAddr) {
        if let Some(origins) = self.companions.get_mut(user) {
            if let Some(index) = origins.iter().position(|known| *known == origin) {
                origins.remove(index);
            }
            if origins.is_empty() {
                self.companions.remove(user);
            }
        }
    }

    /// Find the first open session for `project` that satisfies `filter`.
    ///
    /// With no filter, the first registered session belonging to the
    /// project is returned; this is what enforces "at most one live
    /// editing session per project" upstream.
    #[must_use]
    pub fn find_open_session(
        &self,
        project: &str,
        filter: Option<&SessionFilter>,
    ) -> Option<Arc<Session>> {
        self.order
            .iter()
            .filter_map(|id| self.editor.get(id).or_else(|| self.application.get(id)))
            .find(|session| {
                session.project() == project
                    && filter.is_none_or(|f| self.matches(session, f))
            })
            .cloned()
    }

    /// Snapshots of every session owned by `user`.
    #[must_use]
    pub fn list_by_user(&self, user: &str) -> Vec<SessionSnapshot> {
        self.scan()
            .filter(|session| session.user() == user)
            .map(|session| session.snapshot())
            .collect()
    }

    /// Snapshots of every registered session.
    #[must_use]
    pub fn list_all(&self) -> Vec<SessionSnapshot> {
        self.scan().map(|session| session.snapshot()).collect()
    }

    fn scan(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.order
            .iter()
            .filter_map(|id| self.editor.get(id).or_else(|| self.application.get(id)))
    }

    fn matches(&self, session: &Session, filter: &SessionFilter) -> bool {
        if filter
            .kind
            .is_some_and(|kind| session.options().kind != kind)
        {
            return false;
        }
        if filter
            .read_only
            .is_some_and(|read_only| session.options().read_only != read_only)
        {
            return false;
        }
        if filter
            .user
            .as_deref()
            .is_some_and(|user| session.user() != user)
        {
            return false;
        }
        if let Some(request) = filter.request {
            if !self.origin_matches(session, request) {
                return false;
            }
        }
        true
    }

    /// Network-origin affinity: the request origin must equal the
    /// session's recorded master-connection origin, or the origin of any
    /// currently connected companion device of the session's owner.
    fn origin_matches(&self, session: &Session, request: IpAddr) -> bool {
        let request = canonical_origin(request);
        if session
            .master_ip()
            .is_some_and(|master| canonical_origin(master) == request)
        {
            return true;
        }
        self.companions
            .get(session.user())
            .is_some_and(|origins| {
                origins
                    .iter()
                    .any(|origin| canonical_origin(*origin) == request)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::BrokerRequest;
    use crate::broker::testing;
    use crate::quota::ResolvedQuota;
    use crate::session::SessionOptions;
    use crate::worker::Worker;

    fn class() -> ResolvedQuota {
        ResolvedQuota {
            match_type: "*".to_string(),
            match_query: None,
            max_users: 10,
            min_users_per_worker: 3,
            max_workers: 2,
        }
    }

    fn open(worker: &mut Worker, options: SessionOptions) -> Arc<Session> {
        worker.open_session(options)
    }

    fn editor_options(project: &str, user: &str, master_ip: Option<IpAddr>) -> SessionOptions {
        SessionOptions {
            scope: SessionScope::Editor,
            master_ip,
            ..SessionOptions::new(SessionKind::Web, project, user)
        }
    }

    #[test]
    fn canonical_origin_folds_mapped_and_loopback_forms() {
        let plain: IpAddr = "192.0.2.7".parse().unwrap();
        let mapped: IpAddr = "::ffff:192.0.2.7".parse().unwrap();
        assert_eq!(canonical_origin(mapped), canonical_origin(plain));

        let v6_loopback: IpAddr = "::1".parse().unwrap();
        let v4_loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let odd_loopback: IpAddr = "127.0.0.2".parse().unwrap();
        assert_eq!(canonical_origin(v6_loopback), canonical_origin(v4_loopback));
        assert_eq!(canonical_origin(odd_loopback), canonical_origin(v4_loopback));

        let distinct: IpAddr = "198.51.100.1".parse().unwrap();
        assert_ne!(canonical_origin(plain), canonical_origin(distinct));
    }

    #[tokio::test]
    async fn first_registered_project_session_wins_without_a_filter() {
        let (client, _broker) = testing::pair(None);
        let mut registry = SessionRegistry::new(client);
        let mut worker = Worker::new(class());

        let first = open(&mut worker, editor_options("demo", "alice", None));
        let second = open(&mut worker, editor_options("demo", "bob", None));
        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));

        let found = registry.find_open_session("demo", None).unwrap();
        assert_eq!(found.id(), first.id());
        assert!(registry.find_open_session("other", None).is_none());
    }

    #[tokio::test]
    async fn affinity_lookup_is_idempotent_until_the_session_closes() {
        let (client, _broker) = testing::pair(None);
        let mut registry = SessionRegistry::new(client);
        let mut worker = Worker::new(class());

        let origin: IpAddr = "192.0.2.7".parse().unwrap();
        let session = open(&mut worker, editor_options("demo", "alice", Some(origin)));
        registry.register(Arc::clone(&session));

        let filter = SessionFilter {
            request: Some("::ffff:192.0.2.7".parse().unwrap()),
            ..SessionFilter::default()
        };
        let a = registry.find_open_session("demo", Some(&filter)).unwrap();
        let b = registry.find_open_session("demo", Some(&filter)).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id(), session.id());

        registry.unregister(session.id()).unwrap();
        assert!(registry.find_open_session("demo", Some(&filter)).is_none());
    }

    #[tokio::test]
    async fn mismatched_origin_falls_back_to_companion_devices() {
        let (client, _broker) = testing::pair(None);
        let mut registry = SessionRegistry::new(client);
        let mut worker = Worker::new(class());

        let master: IpAddr = "192.0.2.7".parse().unwrap();
        let session = open(&mut worker, editor_options("demo", "alice", Some(master)));
        registry.register(Arc::clone(&session));

        let tablet: IpAddr = "203.0.113.9".parse().unwrap();
        let filter = SessionFilter {
            request: Some(tablet),
            ..SessionFilter::default()
        };
        assert!(registry.find_open_session("demo", Some(&filter)).is_none());

        // A connected companion device of the owning user satisfies the
        // origin predicate.
        registry.register_companion("alice", tablet);
        assert!(registry.find_open_session("demo", Some(&filter)).is_some());

        // A companion of a different user does not.
        registry.unregister_companion("alice", tablet);
        registry.register_companion("bob", tablet);
        assert!(registry.find_open_session("demo", Some(&filter)).is_none());
    }

    #[tokio::test]
    async fn every_filter_predicate_must_hold() {
        let (client, _broker) = testing::pair(None);
        let mut registry = SessionRegistry::new(client);
        let mut worker = Worker::new(class());

        let session = open(
            &mut worker,
            SessionOptions {
                read_only: true,
                ..editor_options("demo", "alice", Some("192.0.2.7".parse().unwrap()))
            },
        );
        registry.register(Arc::clone(&session));

        let matching = SessionFilter {
            kind: Some(SessionKind::Web),
            read_only: Some(true),
            user: Some("alice".to_string()),
            request: Some("192.0.2.7".parse().unwrap()),
        };
        assert!(registry.find_open_session("demo", Some(&matching)).is_some());

        let wrong_kind = SessionFilter {
            kind: Some(SessionKind::Rest),
            ..matching.clone()
        };
        assert!(registry.find_open_session("demo", Some(&wrong_kind)).is_none());

        let wrong_user = SessionFilter {
            user: Some("bob".to_string()),
            ..matching
        };
        assert!(registry.find_open_session("demo", Some(&wrong_user)).is_none());
    }

    #[tokio::test]
    async fn unregister_notifies_the_broker_to_forget_the_id() {
        let (client, broker) = testing::pair(None);
        let mut registry = SessionRegistry::new(client);
        let mut worker = Worker::new(class());

        let session = open(&mut worker, editor_options("demo", "alice", None));
        let id = session.id().clone();
        registry.register(session);
        registry.unregister(&id).unwrap();
        assert!(registry.is_empty());

        broker
            .wait_for(|requests| {
                requests
                    .iter()
                    .any(|r| matches!(r, BrokerRequest::Forget { id: forgotten }
                        if forgotten == id.as_str()))
                    .then_some(())
            })
            .await;
    }

    #[tokio::test]
    async fn listings_scan_both_maps() {
        let (client, _broker) = testing::pair(None);
        let mut registry = SessionRegistry::new(client);
        let mut worker = Worker::new(class());

        registry.register(open(&mut worker, editor_options("p1", "alice", None)));
        registry.register(open(
            &mut worker,
            SessionOptions::new(SessionKind::Rest, "p2", "alice"),
        ));
        registry.register(open(
            &mut worker,
            SessionOptions::new(SessionKind::Rest, "p3", "bob"),
        ));

        assert_eq!(registry.list_all().len(), 3);
        let alice = registry.list_by_user("alice");
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|s| s.user == "alice"));
        assert!(registry.list_by_user("eve").is_empty());
    }
}
