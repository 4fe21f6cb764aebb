//! Container runtime abstraction with pluggable backends
//!
//! The egress engine never talks to a container runtime directly; it goes
//! through [`ContainerRuntime`], implemented by [`CliRuntime`] for the
//! `docker`/`podman` command line and by [`MockRuntime`] for tests.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod docker;
pub mod mock;
pub mod runtime;

pub use docker::CliRuntime;
pub use mock::MockRuntime;
pub use runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, Mount, NetworkInfo,
    NetworkSpec, label_matches,
};
