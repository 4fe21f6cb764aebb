//! Egress policy: built-in profiles, per-container custom rules and the
//! merge of the two into an effective policy.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod merge;
pub mod profile;
pub mod store;

pub use merge::{EffectivePolicy, merge};
pub use profile::{DEFAULT_PROFILE, DefaultAction, EgressProfile, NetworkMode, builtin_names, load};
pub use store::{CustomRuleSet, FileRuleStore, RuleRepository};
