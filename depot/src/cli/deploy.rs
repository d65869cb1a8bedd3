use std::fs;
use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_core::archive::PackageInstance;
use depot_core::deploy::Deployer;

use crate::cli::site_root;

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Package archive to deploy
    #[arg(value_name = "FILE")]
    pub archive: PathBuf,

    /// Site root to deploy into
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

impl DeployArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let root = site_root(&self.root, config)?;
        let mut instance = PackageInstance::open(fs::File::open(&self.archive)?, None)?;

        let state = Deployer::new(&root).deploy_instance(&mut instance)?;
        println!("Deployed {}", state.to_string().bold().green());
        Ok(())
    }
}
