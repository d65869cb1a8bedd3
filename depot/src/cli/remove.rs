use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_core::deploy::Deployer;

use crate::cli::site_root;

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Package name to remove
    pub package: String,

    /// Site root to remove from
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

impl RemoveArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let root = site_root(&self.root, config)?;
        Deployer::new(&root).remove_deployed(&self.package)?;
        println!("Removed {}", self.package.bold());
        Ok(())
    }
}
