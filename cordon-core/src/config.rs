//! Engine configuration

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ContainerId, Error, Result};

/// Default image for the DNS sidecar
pub const DEFAULT_SIDECAR_IMAGE: &str = "docker.io/4km3/dnsmasq:latest";

/// How the sidecar answers a blocked name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockResponse {
    /// Answer NXDOMAIN
    #[default]
    NxDomain,
    /// Answer with the unspecified address (`0.0.0.0` / `::`)
    NullRoute,
}

impl std::str::FromStr for BlockResponse {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nxdomain" => Ok(Self::NxDomain),
            "null-route" => Ok(Self::NullRoute),
            other => Err(Error::InvalidConfig {
                message: format!("Unknown block response '{other}' (expected nxdomain or null-route)"),
            }),
        }
    }
}

/// Configuration shared by every engine component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root for rule stores and sidecar snapshots
    pub state_dir: PathBuf,

    /// Container runtime binary (`docker` or `podman`)
    pub runtime: String,

    /// Image used for the DNS sidecar
    pub sidecar_image: String,

    /// Resolvers the sidecar forwards allowed queries to
    pub upstream_resolvers: Vec<IpAddr>,

    /// How many times to poll for the sidecar's address
    pub readiness_attempts: u32,

    /// Delay between readiness polls
    #[serde(with = "duration_serde")]
    pub readiness_interval: Duration,

    /// Pool per-container networks are carved from
    pub subnet_pool: IpNet,

    /// Prefix length of each per-container network
    pub subnet_prefix: u8,

    /// Answer for blocked names
    pub block_response: BlockResponse,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            runtime: "docker".to_string(),
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            upstream_resolvers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ],
            readiness_attempts: 30,
            readiness_interval: Duration::from_secs(1),
            subnet_pool: IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(10, 213, 0, 0), 16)),
            subnet_prefix: 24,
            block_response: BlockResponse::NxDomain,
        }
    }
}

impl EngineConfig {
    /// Create a configuration rooted at `state_dir` with defaults elsewhere
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// `$XDG_STATE_HOME/cordon`, falling back to `~/.local/state/cordon`
    #[must_use]
    pub fn default_state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cordon")
    }

    /// Set the runtime binary
    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Set the sidecar image
    #[must_use]
    pub fn with_sidecar_image(mut self, image: impl Into<String>) -> Self {
        self.sidecar_image = image.into();
        self
    }

    /// Set the upstream resolvers
    #[must_use]
    pub fn with_upstream_resolvers(mut self, resolvers: Vec<IpAddr>) -> Self {
        self.upstream_resolvers = resolvers;
        self
    }

    /// Set readiness polling bounds
    #[must_use]
    pub fn with_readiness(mut self, attempts: u32, interval: Duration) -> Self {
        self.readiness_attempts = attempts;
        self.readiness_interval = interval;
        self
    }

    /// Set the subnet pool and per-container prefix length
    #[must_use]
    pub fn with_subnet_pool(mut self, pool: IpNet, prefix: u8) -> Self {
        self.subnet_pool = pool;
        self.subnet_prefix = prefix;
        self
    }

    /// Set the blocked-name answer
    #[must_use]
    pub fn with_block_response(mut self, response: BlockResponse) -> Self {
        self.block_response = response;
        self
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// Returns error describing the first inconsistent setting
    pub fn validate(&self) -> Result<()> {
        if self.runtime.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "runtime binary cannot be empty".to_string(),
            });
        }
        if self.upstream_resolvers.is_empty() {
            return Err(Error::InvalidConfig {
                message: "at least one upstream resolver is required".to_string(),
            });
        }
        if self.readiness_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "readiness attempts must be at least 1".to_string(),
            });
        }
        if self.subnet_prefix < self.subnet_pool.prefix_len()
            || self.subnet_prefix > self.subnet_pool.max_prefix_len() - 2
        {
            return Err(Error::InvalidConfig {
                message: format!(
                    "subnet prefix /{} does not fit pool {}",
                    self.subnet_prefix, self.subnet_pool
                ),
            });
        }
        Ok(())
    }

    /// Directory holding per-container rule stores
    #[must_use]
    pub fn rules_dir(&self) -> PathBuf {
        self.state_dir.join("rules")
    }

    /// Directory holding the applied configuration of one container's sidecar
    #[must_use]
    pub fn sidecar_dir(&self, id: &ContainerId) -> PathBuf {
        self.state_dir.join("sidecars").join(id.as_str())
    }

    /// State directory
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
