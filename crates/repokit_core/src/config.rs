//! Engine configuration.
//!
//! # Invariants
//! - Every field has a default, so partial JSON documents are accepted.

use crate::lock::LockTimeout;
use crate::projection::LoadPolicy;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Tunables passed to `EntityStore` at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Blocking policy for lock acquisition.
    pub lock_timeout: LockTimeout,
    /// How projections load related entities.
    pub load_policy: LoadPolicy,
}

#[derive(Debug)]
pub struct ConfigError(serde_json::Error);

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid engine config: {}", self.0)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.0)
    }
}

impl EngineConfig {
    /// Parses a JSON document such as
    /// `{"lock_timeout": {"after_millis": 500}, "load_policy": "deferred_fetch_by_id"}`.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError)
    }

    pub fn with_lock_timeout(mut self, timeout: LockTimeout) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_load_policy(mut self, policy: LoadPolicy) -> Self {
        self.load_policy = policy;
        self
    }
}
