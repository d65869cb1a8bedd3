use std::fs;
use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_core::ensure::{ensure_packages, parse_desired_state, resolve_desired};
use depot_net::api::RemoteClient;
use depot_net::transfer::{RemoteFetcher, StorageClient};

use crate::cli::site_root;

#[derive(Args, Debug)]
pub struct EnsureArgs {
    /// Package list file: one '<package> <version>' per line
    #[arg(value_name = "FILE")]
    pub list: PathBuf,

    /// Site root to reconcile
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

impl EnsureArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let root = site_root(&self.root, config)?;
        let entries = parse_desired_state(&fs::read_to_string(&self.list)?)?;

        let remote = RemoteClient::new(config)?;
        let storage = StorageClient::new(config);
        let desired = resolve_desired(&remote, &entries).await?;

        let fetcher = RemoteFetcher {
            remote: &remote,
            storage: &storage,
        };
        let deployed = ensure_packages(&root, &desired, &fetcher).await?;
        println!(
            "{}",
            format!("Site root holds {} package(s)", deployed.len()).bold()
        );
        Ok(())
    }
}
