use std::fs;
use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_core::archive::PackageInstance;
use depot_net::api::RemoteClient;
use depot_net::transfer::{attach_tags_when_ready, register_instance, StorageClient};

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Built package archive to publish
    #[arg(value_name = "FILE")]
    pub archive: PathBuf,

    /// Tag to attach to the published instance (repeatable)
    #[arg(long = "tag", value_name = "KEY:VALUE")]
    pub tags: Vec<String>,
}

impl PublishArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let instance = PackageInstance::open(fs::File::open(&self.archive)?, None)?;
        let pin = instance.pin().clone();

        let remote = RemoteClient::new(config)?;
        let storage = StorageClient::new(config);
        let mut data = fs::File::open(&self.archive)?;
        let result = register_instance(&remote, &storage, &pin, &mut data, config).await?;

        if result.already_registered {
            println!(
                "{} was already registered by {}",
                pin.to_string().bold(),
                result.registered_by
            );
        } else {
            println!("{} registered", pin.to_string().bold().green());
        }

        if !self.tags.is_empty() {
            attach_tags_when_ready(&remote, &pin, &self.tags, config).await?;
            for tag in &self.tags {
                println!("  tagged {}", tag.bold());
            }
        }
        Ok(())
    }
}
