//! Quota resolution and worker class keys.
//!
//! Every new-session request resolves a [`ResolvedQuota`]: the limits in
//! effect for that request. The resolved quota doubles as the **class key**
//! that partitions a tenant's workers into disjoint pools; two workers
//! share a pool exactly when their resolved quotas compare equal by value.
//!
//! Resolution scans the tenant's override rules in declaration order and
//! takes the first whose `match_type` equals the request's declared type
//! and whose optional query substring (if present) is contained in the
//! request query string. If no rule matches, a wildcard class built from
//! the tenant defaults applies. Optional override fields fall back to the
//! tenant defaults per field.
//!
//! Quotas are resolved independently per request; a later change to the
//! defaults or the rule list never re-buckets existing workers.

use serde::{Deserialize, Serialize};

use crate::session::SessionOptions;

/// Class name used when no override rule matches.
pub const WILDCARD_CLASS: &str = "*";

/// Tenant-level default limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDefaults {
    /// Maximum summed load across one worker class.
    pub max_users: usize,
    /// Per-worker load at which the scheduler prefers spinning up a new
    /// worker over packing the least-loaded one.
    pub min_users_per_worker: usize,
    /// Maximum worker count per class.
    pub max_workers: usize,
}

/// One quota override rule.
///
/// Rules are kept in declaration order; the first matching rule wins.
/// Fields left unset fall back to the tenant defaults at resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaOverride {
    /// Declared session type this rule applies to.
    pub match_type: String,
    /// Optional substring the request query must contain.
    #[serde(default)]
    pub match_query: Option<String>,
    /// Override for [`QuotaDefaults::max_users`].
    #[serde(default)]
    pub max_users: Option<usize>,
    /// Override for [`QuotaDefaults::min_users_per_worker`].
    #[serde(default)]
    pub min_users_per_worker: Option<usize>,
    /// Override for [`QuotaDefaults::max_workers`].
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl QuotaOverride {
    fn matches(&self, request: &SessionOptions) -> bool {
        if self.match_type != request.kind.as_str() {
            return false;
        }
        match (&self.match_query, &request.query) {
            (None, _) => true,
            (Some(needle), Some(query)) => query.contains(needle.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// The quota in effect for one request.
///
/// Doubles as the worker class key: compared by structural equality, so a
/// worker created under one resolved quota never mixes with workers of a
/// differently-resolved one, even for the same match type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuota {
    /// Matched rule's declared type, or [`WILDCARD_CLASS`].
    pub match_type: String,
    /// Matched rule's query substring, if it had one.
    pub match_query: Option<String>,
    /// Effective maximum summed load for the class.
    pub max_users: usize,
    /// Effective spread threshold.
    pub min_users_per_worker: usize,
    /// Effective worker cap for the class.
    pub max_workers: usize,
}

impl ResolvedQuota {
    /// True if this is the wildcard fallback class.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.match_type == WILDCARD_CLASS
    }
}

/// Resolve the quota in effect for `request`.
#[must_use]
pub fn resolve(
    defaults: &QuotaDefaults,
    overrides: &[QuotaOverride],
    request: &SessionOptions,
) -> ResolvedQuota {
    for rule in overrides {
        if rule.matches(request) {
            return ResolvedQuota {
                match_type: rule.match_type.clone(),
                match_query: rule.match_query.clone(),
                max_users: rule.max_users.unwrap_or(defaults.max_users),
                min_users_per_worker: rule
                    .min_users_per_worker
                    .unwrap_or(defaults.min_users_per_worker),
                max_workers: rule.max_workers.unwrap_or(defaults.max_workers),
            };
        }
    }

    ResolvedQuota {
        match_type: WILDCARD_CLASS.to_string(),
        match_query: None,
        max_users: defaults.max_users,
        min_users_per_worker: defaults.min_users_per_worker,
        max_workers: defaults.max_workers,
    }
}
