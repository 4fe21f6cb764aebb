//! Error types for cordon

use thiserror::Error;

/// Cordon error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// A custom rule value failed validation
    #[error("Invalid {kind} rule '{value}': {message}")]
    InvalidRule {
        /// Rule kind (e.g. `allow-domain`)
        kind: String,
        /// Offending value
        value: String,
        /// Why it was rejected
        message: String,
    },

    /// Unknown egress profile name
    #[error("Unknown egress profile '{name}' (valid profiles: {valid})")]
    ProfileNotFound {
        /// Requested profile
        name: String,
        /// Comma-separated list of valid profiles
        valid: String,
    },

    /// Profile document could not be parsed
    #[error("Profile '{profile}' line {line}: {message}")]
    ProfileParse {
        /// Profile being parsed
        profile: String,
        /// 1-indexed line number
        line: usize,
        /// Parse error
        message: String,
    },

    /// Network creation failed even without inter-container isolation
    #[error("Failed to create network {network}: {message}")]
    NetworkCreate {
        /// Network name
        network: String,
        /// Error message
        message: String,
    },

    /// Sidecar never reported an address
    #[error("DNS sidecar for {container} did not report an address after {attempts} attempts")]
    SidecarStartTimeout {
        /// Container the sidecar belongs to
        container: String,
        /// Number of polls performed
        attempts: u32,
    },

    /// Sidecar came up on a different address than requested
    #[error("DNS sidecar for {container} bound {actual}, expected {requested}")]
    SidecarAddressMismatch {
        /// Container the sidecar belongs to
        container: String,
        /// Requested static address
        requested: std::net::IpAddr,
        /// Address actually observed
        actual: std::net::IpAddr,
    },

    /// A resource with a reserved name exists but does not belong to the container
    #[error("'{name}' exists but is not the DNS sidecar of {container}; rename or remove it")]
    NameConflict {
        /// Name of the existing resource
        name: String,
        /// Container the name is reserved for
        container: String,
    },

    /// Container runtime command failed
    #[error("`{command}` failed: {stderr}")]
    Runtime {
        /// Command line that failed
        command: String,
        /// Captured stderr
        stderr: String,
    },

    /// Container runtime binary could not be executed
    #[error("Container runtime `{binary}` is not available: {source}")]
    RuntimeUnavailable {
        /// Binary name or path
        binary: String,
        /// Spawn error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether a runtime failure means the targeted resource does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Runtime { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                stderr.contains("no such") || stderr.contains("not found")
            }
            _ => false,
        }
    }

    /// Whether a runtime failure was caused by an overlapping or taken address range
    #[must_use]
    pub fn is_address_conflict(&self) -> bool {
        match self {
            Self::Runtime { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                stderr.contains("overlap")
                    || stderr.contains("already used")
                    || stderr.contains("already in use")
            }
            _ => false,
        }
    }
}

/// Result type alias for cordon operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(stderr: &str) -> Error {
        Error::Runtime {
            command: "docker network rm demo-net".to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_not_found_classification() {
        assert!(runtime("Error: No such network: demo-net").is_not_found());
        assert!(runtime("network demo-net not found").is_not_found());
        assert!(!runtime("permission denied").is_not_found());
        assert!(
            !Error::InvalidConfig {
                message: "not found".to_string()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_address_conflict_classification() {
        assert!(runtime("Pool overlaps with other one on this address space").is_address_conflict());
        assert!(runtime("subnet 10.213.4.0/24 is already used on the host").is_address_conflict());
        assert!(!runtime("invalid option").is_address_conflict());
    }

    #[test]
    fn test_profile_not_found_lists_valid_profiles() {
        let err = Error::ProfileNotFound {
            name: "bogus".to_string(),
            valid: "permissive, standard, strict, airgapped".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("bogus"));
        assert!(message.contains("airgapped"));
    }
}
