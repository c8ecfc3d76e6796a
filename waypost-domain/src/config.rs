//! Coordinator settings.
//!
//! Loaded from a JSON file; every field has a default, so `{}` is a valid
//! configuration that serves one default instance of each non-agent type on
//! [`DEFAULT_DOMAIN_SERVER_PORT`].
//!
//! ```json
//! {
//!   "port": 40102,
//!   "assignments": {
//!     "agent": [{ "pool": "numerics", "payload": "http://scripts/solver.js", "count": 2 }],
//!     "audio-mixer": [{ "pool": "", "count": 1 }]
//!   },
//!   "disabled_types": ["metavoxel-server"],
//!   "allowed_users": ["alice"],
//!   "public_keys_dir": "/etc/waypost/keys"
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waypost_core::AssignmentType;

/// Exit code asking the supervisor to fix the configuration and restart.
pub const RESTART_EXIT_CODE: i32 = 234;

/// Default UDP port of the coordinator.
pub const DEFAULT_DOMAIN_SERVER_PORT: u16 = 40102;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Settings file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Settings file is not valid JSON for [`DomainServerConfig`].
    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),

    /// A configured TLS file does not exist.
    #[error("TLS file {0} does not exist")]
    MissingTlsFile(PathBuf),

    /// An allow-list is configured without a key directory.
    #[error("allowed_users requires public_keys_dir")]
    MissingPublicKeysDir,

    /// `all` used as a configured assignment type.
    #[error("`all` is not a concrete assignment type")]
    WildcardAssignment,
}

/// One configured group of assignments of a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Pool label, empty for the default pool.
    pub pool: String,
    /// Opaque payload handed to the worker.
    pub payload: String,
    /// Number of instances.
    pub count: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            pool: String::new(),
            payload: String::new(),
            count: 1,
        }
    }
}

/// TLS material for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain.
    pub cert_path: PathBuf,
    /// Private key.
    pub key_path: PathBuf,
}

/// Timer periods, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Silence after which a node is evicted.
    pub node_silence_threshold_ms: u64,
    /// Silent-node sweep period.
    pub silent_node_sweep_ms: u64,
    /// STUN refresh period.
    pub stun_refresh_ms: u64,
    /// ICE heartbeat period.
    pub ice_heartbeat_ms: u64,
    /// ICE ping sweep period.
    pub ice_ping_ms: u64,
    /// Static assignment re-issue period.
    pub assignment_retry_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            node_silence_threshold_ms: 5_000,
            silent_node_sweep_ms: 1_000,
            stun_refresh_ms: 10_000,
            ice_heartbeat_ms: 2_000,
            ice_ping_ms: 250,
            assignment_retry_ms: 5_000,
        }
    }
}

impl TimingConfig {
    /// Node silence threshold.
    pub fn node_silence_threshold(&self) -> Duration {
        Duration::from_millis(self.node_silence_threshold_ms)
    }

    /// Silent-node sweep period.
    pub fn silent_node_sweep(&self) -> Duration {
        Duration::from_millis(self.silent_node_sweep_ms.max(1))
    }

    /// STUN refresh period.
    pub fn stun_refresh(&self) -> Duration {
        Duration::from_millis(self.stun_refresh_ms.max(1))
    }

    /// ICE heartbeat period.
    pub fn ice_heartbeat(&self) -> Duration {
        Duration::from_millis(self.ice_heartbeat_ms.max(1))
    }

    /// ICE ping period.
    pub fn ice_ping(&self) -> Duration {
        Duration::from_millis(self.ice_ping_ms.max(1))
    }

    /// Static assignment re-issue period.
    pub fn assignment_retry(&self) -> Duration {
        Duration::from_millis(self.assignment_retry_ms.max(1))
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainServerConfig {
    /// UDP port to listen on.
    pub port: u16,
    /// Explicitly configured assignments per type.
    pub assignments: BTreeMap<AssignmentType, Vec<AssignmentConfig>>,
    /// Types that get no instances at all.
    pub disabled_types: Vec<AssignmentType>,
    /// Users allowed to connect from outside the local network. Empty means
    /// everyone.
    pub allowed_users: Vec<String>,
    /// Directory of `<username>.pem` public keys.
    pub public_keys_dir: Option<PathBuf>,
    /// Directory of persisted agent scripts, named by assignment UUID.
    pub scripts_dir: Option<PathBuf>,
    /// ICE server `host:port`.
    pub ice_server: Option<String>,
    /// STUN server `host:port`.
    pub stun_server: Option<String>,
    /// TLS material; both files must exist when set.
    pub tls: Option<TlsConfig>,
    /// Timer periods.
    pub timing: TimingConfig,
}

impl Default for DomainServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DOMAIN_SERVER_PORT,
            assignments: BTreeMap::new(),
            disabled_types: Vec::new(),
            allowed_users: Vec::new(),
            public_keys_dir: None,
            scripts_dir: None,
            ice_server: None,
            stun_server: None,
            tls: None,
            timing: TimingConfig::default(),
        }
    }
}

impl DomainServerConfig {
    /// Read and validate a settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings for fatal inconsistencies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(tls) = &self.tls {
            for path in [&tls.cert_path, &tls.key_path] {
                if !path.is_file() {
                    return Err(ConfigError::MissingTlsFile(path.clone()));
                }
            }
        }
        if !self.allowed_users.is_empty() && self.public_keys_dir.is_none() {
            return Err(ConfigError::MissingPublicKeysDir);
        }
        if self.assignments.contains_key(&AssignmentType::AllTypes) {
            return Err(ConfigError::WildcardAssignment);
        }
        Ok(())
    }
}
