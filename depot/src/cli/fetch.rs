use std::fs;
use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_core::archive::PackageInstance;
use depot_net::api::{RemoteClient, RemoteRepository};
use depot_net::transfer::{fetch_instance, StorageClient};

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Package name
    pub package: String,
    /// Version to fetch: a tag, a ref, or an instance ID
    #[arg(default_value = "latest")]
    pub version: String,

    /// Where to write the package file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,
}

impl FetchArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let remote = RemoteClient::new(config)?;
        let storage = StorageClient::new(config);
        let pin = remote.resolve_version(&self.package, &self.version).await?;

        let mut out = fs::File::create(&self.output)?;
        fetch_instance(&remote, &storage, &pin, &mut out).await?;
        drop(out);

        // Verify what we got is what was pinned.
        PackageInstance::open(fs::File::open(&self.output)?, Some(&pin.instance_id))?;
        println!(
            "Fetched {} to {}",
            pin.to_string().bold(),
            self.output.display()
        );
        Ok(())
    }
}
