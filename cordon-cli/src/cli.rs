//! CLI argument definitions

use clap::{Args, Parser, Subcommand};
use cordon_core::BlockResponse;
use cordon_policy::DEFAULT_PROFILE;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cordon")]
#[command(about = "Development containers with controlled network egress", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Container runtime binary (docker or podman)
    #[arg(long, global = true, env = "CORDON_RUNTIME", default_value = "docker")]
    pub runtime: String,

    /// Directory for rule stores and sidecar configuration
    #[arg(long, global = true, env = "CORDON_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Image for the DNS filtering sidecar
    #[arg(long, global = true, env = "CORDON_SIDECAR_IMAGE")]
    pub sidecar_image: Option<String>,

    /// Upstream resolvers for allowed names (comma-separated)
    #[arg(long, global = true, env = "CORDON_UPSTREAM_DNS", value_delimiter = ',')]
    pub upstream_dns: Vec<IpAddr>,

    /// Answer for blocked names (nxdomain or null-route)
    #[arg(long, global = true, env = "CORDON_BLOCK_RESPONSE")]
    pub block_response: Option<BlockResponse>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a container behind an egress profile
    Create(CreateArgs),

    /// Re-apply egress rules and start a container
    Start {
        /// Container name
        name: String,
    },

    /// Stop a container (its DNS sidecar keeps running)
    Stop {
        /// Container name
        name: String,
    },

    /// Remove a container and everything provisioned for it
    Rm {
        /// Container name
        name: String,
    },

    /// List managed containers
    List,

    /// Inspect and change a container's egress rules
    #[command(subcommand)]
    Network(NetworkCommand),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container name
    pub name: String,

    /// Image to run
    #[arg(long, default_value = "debian:stable-slim")]
    pub image: String,

    #[command(flatten)]
    pub egress: EgressArgs,

    /// Command to run in the container
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct EgressArgs {
    /// Egress profile (permissive, standard, strict, airgapped)
    #[arg(long = "egress", default_value = DEFAULT_PROFILE)]
    pub profile: String,

    /// Additionally allow a domain (repeatable)
    #[arg(long = "allow-domain", value_name = "DOMAIN")]
    pub allow_domains: Vec<String>,

    /// Additionally block a domain (repeatable)
    #[arg(long = "block-domain", value_name = "DOMAIN")]
    pub block_domains: Vec<String>,

    /// Additionally allow a CIDR (repeatable)
    #[arg(long = "allow-ip", value_name = "CIDR")]
    pub allow_ips: Vec<String>,

    /// Additionally block a CIDR (repeatable)
    #[arg(long = "block-ip", value_name = "CIDR")]
    pub block_ips: Vec<String>,

    /// Additionally allow a destination port (repeatable)
    #[arg(long = "allow-port", value_name = "PORT")]
    pub allow_ports: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Show the profile and custom rules in effect
    Show {
        /// Container name
        name: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Persist an allow rule and apply it immediately
    Allow {
        /// Container name
        name: String,

        #[command(flatten)]
        target: AllowTarget,
    },

    /// Persist a block rule and apply it immediately
    Block {
        /// Container name
        name: String,

        #[command(flatten)]
        target: BlockTarget,
    },

    /// Recreate the DNS sidecar, optionally switching profile
    Reset {
        /// Container name
        name: String,

        /// Profile to switch to
        #[arg(long)]
        profile: Option<String>,

        /// Allow switching to a different profile
        #[arg(long)]
        force: bool,
    },

    /// Show DNS sidecar query logs
    Logs {
        /// Container name
        name: String,

        /// Only queries that were refused
        #[arg(long)]
        blocked_only: bool,

        /// Only the last N lines
        #[arg(long, value_name = "N")]
        tail: Option<usize>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct AllowTarget {
    /// Domain or *.domain
    #[arg(long)]
    pub domain: Option<String>,

    /// CIDR or address
    #[arg(long)]
    pub ip: Option<String>,

    /// Destination port
    #[arg(long)]
    pub port: Option<String>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct BlockTarget {
    /// Domain or *.domain
    #[arg(long)]
    pub domain: Option<String>,

    /// CIDR or address
    #[arg(long)]
    pub ip: Option<String>,
}
