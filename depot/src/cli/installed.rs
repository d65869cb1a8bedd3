use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_core::deploy::Deployer;

use crate::cli::site_root;

#[derive(Args, Debug)]
pub struct InstalledArgs {
    /// Site root to inspect
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

impl InstalledArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let root = site_root(&self.root, config)?;
        let deployed = Deployer::new(&root).find_deployed()?;
        if deployed.is_empty() {
            println!("{}", "0 packages installed".yellow());
            return Ok(());
        }
        for state in &deployed {
            println!("{} {}", state.package_name.bold(), state.instance_id);
        }
        println!("{}", format!("{} package(s) installed", deployed.len()).bold());
        Ok(())
    }
}
