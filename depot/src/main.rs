// depot/src/main.rs
use std::process;

use clap::Parser;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

mod cli;
use cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let level_filter = match cli_args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("DEPOT_LOG")
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .without_time()
        .try_init();

    let config = Config::load()?;

    if let Err(e) = cli_args.command.run(&config).await {
        error!("Command failed: {}", e);
        eprintln!("{}: {}", "Error".red().bold(), e);
        process::exit(1);
    }
    debug!("Command completed successfully.");
    Ok(())
}
