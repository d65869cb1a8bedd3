// depot/src/cli.rs
//! Defines the command-line argument structure using clap.
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use depot_common::config::Config;
use depot_common::error::{DepotError, Result};

pub mod acl;
pub mod build;
pub mod deploy;
pub mod ensure;
pub mod fetch;
pub mod installed;
pub mod publish;
pub mod remove;
pub mod resolve;

use crate::cli::acl::AclArgs;
use crate::cli::build::BuildArgs;
use crate::cli::deploy::DeployArgs;
use crate::cli::ensure::EnsureArgs;
use crate::cli::fetch::FetchArgs;
use crate::cli::installed::InstalledArgs;
use crate::cli::publish::PublishArgs;
use crate::cli::remove::RemoveArgs;
use crate::cli::resolve::ResolveArgs;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "depot", bin_name = "depot")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a package archive from a package definition file
    Build(BuildArgs),
    /// Register a built archive with the backend, uploading if needed
    Publish(PublishArgs),
    /// Resolve a version (tag or ref) into an instance ID
    Resolve(ResolveArgs),
    /// Download a package instance file
    Fetch(FetchArgs),
    /// Deploy a local archive into a site root
    Deploy(DeployArgs),
    /// Remove a deployed package from a site root
    Remove(RemoveArgs),
    /// List what is deployed at a site root
    Installed(InstalledArgs),
    /// Make a site root match a declarative package list
    Ensure(EnsureArgs),
    /// Inspect or modify package access control lists
    Acl(AclArgs),
}

impl Command {
    pub async fn run(&self, config: &Config) -> Result<()> {
        match self {
            Self::Build(command) => command.run(config).await,
            Self::Publish(command) => command.run(config).await,
            Self::Resolve(command) => command.run(config).await,
            Self::Fetch(command) => command.run(config).await,
            Self::Deploy(command) => command.run(config).await,
            Self::Remove(command) => command.run(config).await,
            Self::Installed(command) => command.run(config).await,
            Self::Ensure(command) => command.run(config).await,
            Self::Acl(command) => command.run(config).await,
        }
    }
}

/// Site root from the flag, falling back to the configured default.
pub fn site_root(flag: &Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    flag.clone()
        .or_else(|| config.site_root.clone())
        .ok_or_else(|| {
            DepotError::Config("No site root given (use --root or set DEPOT_ROOT)".to_string())
        })
}
