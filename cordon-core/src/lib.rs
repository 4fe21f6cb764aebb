//! Cordon Core - Foundation types, events, and configuration
//!
//! This crate provides the core abstractions shared by the cordon egress engine.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod rules;
pub mod types;

pub use config::{BlockResponse, EngineConfig};
pub use error::{Error, Result};
pub use events::EgressEvent;
pub use rules::{CustomRule, DomainPattern, RuleKind, domain_matches, parse_cidr, parse_port};
pub use types::{
    ContainerId, LABEL_CONTAINER, LABEL_EGRESS, LABEL_MANAGED, LABEL_ROLE, NetworkId,
};
