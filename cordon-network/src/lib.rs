//! Per-container egress enforcement
//!
//! Provisions an isolated network per container, runs a DNS filtering
//! sidecar on it and tears both down again.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cleanup;
pub mod dns;
pub mod provisioner;
pub mod sidecar;

pub use cleanup::{CleanupCoordinator, CleanupReport};
pub use dns::{DnsAction, DnsRule, DnsRuleSet, Resolution, filter_blocked, is_blocked_log_line};
pub use provisioner::{
    Isolation, MAX_SUBNET_ATTEMPTS, NetworkProvisioner, ProvisionedNetwork, SubnetPlan,
};
pub use sidecar::{AppliedRules, SidecarManager, is_sidecar_of, remove_sidecar};
