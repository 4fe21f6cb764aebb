//! Egress lifecycle events with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

use crate::ContainerId;

/// Events emitted while provisioning and tearing down container networking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EgressEvent {
    /// Dedicated network created (or found)
    NetworkReady {
        /// Container ID
        id: ContainerId,
        /// Network name
        network: String,
        /// Whether inter-container communication is disabled
        isolated: bool,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Inter-container isolation unavailable, fell back to a plain bridge
    IsolationDegraded {
        /// Container ID
        id: ContainerId,
        /// Why the strict attempt failed
        reason: String,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A previous sidecar was removed before starting a new one
    SidecarReplaced {
        /// Container ID
        id: ContainerId,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Sidecar reported its address
    SidecarStarted {
        /// Container ID
        id: ContainerId,
        /// Sidecar address
        address: IpAddr,
        /// Number of DNS rules applied
        rules: usize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Sidecar never became ready
    SidecarTimedOut {
        /// Container ID
        id: ContainerId,
        /// Polls performed
        attempts: u32,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Custom rule persisted
    RuleAdded {
        /// Container ID
        id: ContainerId,
        /// Rule as listed (`ALLOW_DOMAIN foo.com`)
        rule: String,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Sidecar, network and rule store removed
    NetworkingRemoved {
        /// Container ID
        id: ContainerId,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },
}

impl EgressEvent {
    /// Get the container ID from any event
    #[must_use]
    pub const fn container_id(&self) -> &ContainerId {
        match self {
            Self::NetworkReady { id, .. }
            | Self::IsolationDegraded { id, .. }
            | Self::SidecarReplaced { id, .. }
            | Self::SidecarStarted { id, .. }
            | Self::SidecarTimedOut { id, .. }
            | Self::RuleAdded { id, .. }
            | Self::NetworkingRemoved { id, .. } => id,
        }
    }

    /// Get the timestamp from any event
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::NetworkReady { timestamp, .. }
            | Self::IsolationDegraded { timestamp, .. }
            | Self::SidecarReplaced { timestamp, .. }
            | Self::SidecarStarted { timestamp, .. }
            | Self::SidecarTimedOut { timestamp, .. }
            | Self::RuleAdded { timestamp, .. }
            | Self::NetworkingRemoved { timestamp, .. } => *timestamp,
        }
    }

    /// Events an operator should see even at the default log level
    #[must_use]
    pub const fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::IsolationDegraded { .. } | Self::SidecarTimedOut { .. }
        )
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        match self {
            Self::NetworkReady {
                id,
                network,
                isolated,
                ..
            } => {
                tracing::info!(
                    container_id = %id,
                    network = %network,
                    isolated,
                    event = "network_ready",
                    "Network ready"
                );
            }
            Self::IsolationDegraded { id, reason, .. } => {
                tracing::warn!(
                    container_id = %id,
                    reason = %reason,
                    event = "isolation_degraded",
                    "Inter-container isolation unavailable, using plain bridge network"
                );
            }
            Self::SidecarReplaced { id, .. } => {
                tracing::debug!(
                    container_id = %id,
                    event = "sidecar_replaced",
                    "Removed previous DNS sidecar"
                );
            }
            Self::SidecarStarted {
                id, address, rules, ..
            } => {
                tracing::info!(
                    container_id = %id,
                    address = %address,
                    rules,
                    event = "sidecar_started",
                    "DNS sidecar ready"
                );
            }
            Self::SidecarTimedOut { id, attempts, .. } => {
                tracing::error!(
                    container_id = %id,
                    attempts,
                    event = "sidecar_timed_out",
                    "DNS sidecar did not become ready"
                );
            }
            Self::RuleAdded { id, rule, .. } => {
                tracing::info!(
                    container_id = %id,
                    rule = %rule,
                    event = "rule_added",
                    "Custom rule added"
                );
            }
            Self::NetworkingRemoved { id, .. } => {
                tracing::info!(
                    container_id = %id,
                    event = "networking_removed",
                    "Container networking removed"
                );
            }
        }
    }
}

impl fmt::Display for EgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkReady {
                id,
                network,
                isolated,
                ..
            } => {
                let mode = if *isolated { "isolated" } else { "shared" };
                write!(f, "Container {id} network {network} ready ({mode})")
            }
            Self::IsolationDegraded { id, reason, .. } => {
                write!(f, "Container {id} isolation degraded: {reason}")
            }
            Self::SidecarReplaced { id, .. } => write!(f, "Container {id} sidecar replaced"),
            Self::SidecarStarted { id, address, .. } => {
                write!(f, "Container {id} sidecar listening on {address}")
            }
            Self::SidecarTimedOut { id, attempts, .. } => {
                write!(f, "Container {id} sidecar not ready after {attempts} attempts")
            }
            Self::RuleAdded { id, rule, .. } => write!(f, "Container {id} rule added: {rule}"),
            Self::NetworkingRemoved { id, .. } => {
                write!(f, "Container {id} networking removed")
            }
        }
    }
}

// Custom SystemTime serialization
mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(since_epoch.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}
