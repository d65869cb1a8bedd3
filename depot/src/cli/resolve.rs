use clap::Args;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_net::api::{RemoteClient, RemoteRepository};

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Package name
    pub package: String,
    /// Version to resolve: a tag, a ref, or an instance ID
    #[arg(default_value = "latest")]
    pub version: String,
}

impl ResolveArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let remote = RemoteClient::new(config)?;
        let pin = remote.resolve_version(&self.package, &self.version).await?;
        println!("{}", pin.to_string().bold());
        Ok(())
    }
}
