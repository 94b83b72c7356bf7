//! Versioned policy snapshots behind an atomically swapped pointer.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::rules::{Policy, PolicyError};

/// An immutable, validated policy together with its version.
#[derive(Debug)]
pub struct PolicySnapshot {
    pub version: u64,
    pub policy: Policy,
    pub activated_at: DateTime<Utc>,
}

/// Holds the active policy snapshot.
///
/// Readers take a lock-free reference to the current snapshot and keep using
/// it for the rest of their request, so a concurrent swap is never observed
/// half-applied. Invalid policies are refused and the previous snapshot keeps
/// serving.
pub struct PolicyStore {
    current: ArcSwap<PolicySnapshot>,
}

impl PolicyStore {
    /// Create a store serving `policy` as version 1.
    pub fn new(policy: Policy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(PolicySnapshot {
                version: 1,
                policy,
                activated_at: Utc::now(),
            }),
        })
    }

    /// Create a store with an empty policy, which admits everything.
    pub fn empty() -> Self {
        Self {
            current: ArcSwap::from_pointee(PolicySnapshot {
                version: 0,
                policy: Policy::default(),
                activated_at: Utc::now(),
            }),
        }
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Validate and activate a new policy, returning its version.
    pub fn update(&self, policy: Policy) -> Result<u64, PolicyError> {
        if let Err(e) = policy.validate() {
            warn!(
                error = %e,
                active_version = self.version(),
                "Refusing invalid policy, keeping the active snapshot"
            );
            return Err(e);
        }

        let previous = self.current.rcu(|current| PolicySnapshot {
            version: current.version + 1,
            policy: policy.clone(),
            activated_at: Utc::now(),
        });
        let version = previous.version + 1;

        info!(
            version = version,
            routes = policy.routes.len(),
            "Activated rate limit policy"
        );
        Ok(version)
    }

    /// Load a policy file and activate it.
    pub fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> crate::error::Result<u64> {
        let policy = match Policy::from_file(path) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(error = %e, "Failed to load policy file, keeping the active snapshot");
                return Err(e);
            }
        };
        Ok(self.update(policy)?)
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::empty()
    }
}
