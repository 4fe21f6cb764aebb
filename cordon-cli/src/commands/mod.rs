use crate::cli::{Commands, NetworkCommand};
use crate::engine::Engine;
use anyhow::{Context, Result};
use cordon_core::ContainerId;

pub mod create;
pub mod list;
pub mod network;
pub mod rm;
pub mod start;
pub mod stop;

/// Dispatch command to appropriate handler
pub async fn dispatch(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Create(args) => create::execute(engine, &args).await,

        Commands::Start { name } => start::execute(engine, &parse_id(&name)?).await,

        Commands::Stop { name } => stop::execute(engine, &parse_id(&name)?).await,

        Commands::Rm { name } => rm::execute(engine, &parse_id(&name)?).await,

        Commands::List => list::execute(engine).await,

        Commands::Network(command) => match command {
            NetworkCommand::Show { name, json } => {
                network::show(engine, &parse_id(&name)?, json).await
            }
            NetworkCommand::Allow { name, target } => {
                network::allow(engine, &parse_id(&name)?, &target).await
            }
            NetworkCommand::Block { name, target } => {
                network::block(engine, &parse_id(&name)?, &target).await
            }
            NetworkCommand::Reset {
                name,
                profile,
                force,
            } => network::reset(engine, &parse_id(&name)?, profile.as_deref(), force).await,
            NetworkCommand::Logs {
                name,
                blocked_only,
                tail,
            } => network::logs(engine, &parse_id(&name)?, blocked_only, tail).await,
        },
    }
}

fn parse_id(name: &str) -> Result<ContainerId> {
    ContainerId::new(name).context("Invalid container name")
}
