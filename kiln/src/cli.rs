// kiln/src/cli.rs
//! Defines the command-line argument structure using clap.
use clap::{ArgAction, Parser, Subcommand};
use kiln_common::error::Result;
use kiln_common::Config;
use tokio_util::sync::CancellationToken;

pub mod info;
pub mod install;
pub mod link;
pub mod list;
pub mod plan;
pub mod status;
pub mod uninstall;

use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::link::Link;
use crate::cli::list::List;
use crate::cli::plan::Plan;
use crate::cli::test::Test;
use crate::cli::uninstall::Uninstall;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "kiln", bin_name = "kiln")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve, build and link a formula with its dependencies
    Install(InstallArgs),
    /// Show the build plan for a formula without building anything
    Plan(Plan),
    /// Show a formula's options, dependencies and installations
    Info(Info),
    /// List installed formulae
    List(List),
    /// Relink installed prefixes from their install receipts
    Link(Link),
    /// Remove installed formulae
    Uninstall(Uninstall),
    /// Run a formula's test steps against an installation
    Test(Test),
}

impl Command {
    pub async fn run(&self, config: &Config, cancel: CancellationToken) -> Result<()> {
        match self {
            Self::Install(command) => command.run(config, cancel).await,
            Self::Plan(command) => command.run(config).await,
            Self::Info(command) => command.run(config).await,
            Self::List(command) => command.run(config).await,
            Self::Link(command) => command.run(config).await,
            Self::Uninstall(command) => command.run(config).await,
            Self::Test(command) => command.run(config, cancel).await,
        }
    }
}
