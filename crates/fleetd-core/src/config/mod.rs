//! Fleet configuration parsing and validation.
//!
//! Parses the `fleet.toml` configuration file defining tenants (quota
//! defaults, override rules, spawn identity) and broker settings. CLI
//! arguments override file values in the binaries.
//!
//! Validation is fail-closed: an override rule naming an unknown session
//! type is a configuration error, not a silently dead rule.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::quota::{QuotaDefaults, QuotaOverride, WILDCARD_CLASS};
use crate::scheduler::TeardownConfig;
use crate::session::SessionKind;

/// Default subdirectory under the runtime directory.
const DEFAULT_SUBDIR: &str = "fleetd";

/// Default broker socket filename.
const DEFAULT_SOCKET_NAME: &str = "broker.sock";

/// Get the default broker socket path based on environment.
///
/// Priority:
/// 1. `XDG_RUNTIME_DIR/fleetd/broker.sock` if `XDG_RUNTIME_DIR` is set
/// 2. `/tmp/fleetd/broker.sock` as fallback
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| {
            PathBuf::from("/tmp")
                .join(DEFAULT_SUBDIR)
                .join(DEFAULT_SOCKET_NAME)
        },
        |runtime_dir| {
            PathBuf::from(runtime_dir)
                .join(DEFAULT_SUBDIR)
                .join(DEFAULT_SOCKET_NAME)
        },
    )
}

/// Top-level fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    /// Broker settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Worker lifecycle timing.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Tenant definitions.
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl FleetConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for tenant in &self.tenants {
            if tenant.name.is_empty() {
                return Err(ConfigError::Validation(
                    "tenant name must not be empty".to_string(),
                ));
            }
            if !names.insert(tenant.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate tenant name: {}",
                    tenant.name
                )));
            }
            if tenant.max_workers == 0 {
                return Err(ConfigError::Validation(format!(
                    "tenant {}: max_workers must be at least 1",
                    tenant.name
                )));
            }
            for rule in &tenant.overrides {
                if rule.match_type == WILDCARD_CLASS {
                    return Err(ConfigError::Validation(format!(
                        "tenant {}: '{WILDCARD_CLASS}' is the implicit fallback class \
                         and cannot be declared as an override",
                        tenant.name
                    )));
                }
                if rule.match_type.parse::<SessionKind>().is_err() {
                    return Err(ConfigError::Validation(format!(
                        "tenant {}: override names unknown session type '{}'",
                        tenant.name, rule.match_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Find a tenant configuration by name.
    #[must_use]
    pub fn tenant(&self, name: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.name == name)
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker Unix socket path.
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,

    /// Program the broker runs as a worker child process.
    #[serde(default = "default_worker_command")]
    pub worker_command: PathBuf,

    /// Arguments passed to the worker program.
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Optional bound on privileged command round trips. Absent means
    /// unbounded, which preserves long-running privileged operations at
    /// the cost of hanging forever on a dead broker.
    #[serde(default, with = "humantime_serde::option")]
    pub exec_timeout: Option<Duration>,
}

fn default_worker_command() -> PathBuf {
    PathBuf::from("fleet-worker")
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket: default_socket_path(),
            worker_command: default_worker_command(),
            worker_args: Vec::new(),
            exec_timeout: None,
        }
    }
}

/// Worker lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Grace window between graceful disconnect and forced kill.
    #[serde(default = "default_grace")]
    #[serde(with = "humantime_serde")]
    pub grace: Duration,

    /// Interval between teardown drain checks.
    #[serde(default = "default_drain_poll")]
    #[serde(with = "humantime_serde")]
    pub drain_poll: Duration,

    /// Hard cap on the teardown drain wait.
    #[serde(default = "default_drain_timeout")]
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

const fn default_grace() -> Duration {
    crate::worker::DEFAULT_GRACE
}

const fn default_drain_poll() -> Duration {
    Duration::from_millis(500)
}

const fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace: default_grace(),
            drain_poll: default_drain_poll(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl LifecycleConfig {
    /// The teardown knobs this configuration resolves to.
    #[must_use]
    pub const fn teardown(&self) -> TeardownConfig {
        TeardownConfig {
            grace: self.grace,
            drain_poll: self.drain_poll,
            drain_timeout: self.drain_timeout,
        }
    }
}

/// OS identity a tenant's worker children are spawned under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsIdentity {
    /// Target OS user id.
    pub uid: u32,
    /// Target OS group id.
    pub gid: u32,
    /// Home-directory/working-directory override.
    pub home_dir: PathBuf,
}

/// One tenant definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Tenant name; must be unique.
    pub name: String,

    /// Default maximum summed load per worker class.
    #[serde(default = "default_max_users")]
    pub max_users: usize,

    /// Default per-worker load before the scheduler spreads to a fresh
    /// worker.
    #[serde(default = "default_min_users_per_worker")]
    pub min_users_per_worker: usize,

    /// Default worker cap per class.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Quota override rules, first match wins.
    #[serde(default)]
    pub overrides: Vec<QuotaOverride>,

    /// OS user id worker children run as.
    pub uid: u32,

    /// OS group id worker children run as.
    pub gid: u32,

    /// Home directory override for worker children.
    pub home_dir: PathBuf,
}

const fn default_max_users() -> usize {
    100
}

const fn default_min_users_per_worker() -> usize {
    10
}

const fn default_max_workers() -> usize {
    4
}

impl TenantConfig {
    /// The tenant's quota defaults.
    #[must_use]
    pub const fn quota(&self) -> QuotaDefaults {
        QuotaDefaults {
            max_users: self.max_users,
            min_users_per_worker: self.min_users_per_worker,
            max_workers: self.max_workers,
        }
    }

    /// The OS identity worker children are spawned under.
    #[must_use]
    pub fn identity(&self) -> OsIdentity {
        OsIdentity {
            uid: self.uid,
            gid: self.gid,
            home_dir: self.home_dir.clone(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Cross-field validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
