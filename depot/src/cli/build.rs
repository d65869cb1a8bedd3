use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_core::archive::{build_package, PackageInstance};
use depot_core::pkgdef::PackageDef;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Package definition file (JSON)
    #[arg(long = "pkg-def", value_name = "FILE")]
    pub pkg_def: PathBuf,

    /// Where to write the built archive
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,
}

impl BuildArgs {
    pub async fn run(&self, _config: &Config) -> Result<()> {
        let def = PackageDef::load(&self.pkg_def)?;
        let def_dir = self.pkg_def.parent().unwrap_or_else(|| Path::new("."));
        let files = def.collect_files(def_dir)?;

        let out = fs::File::create(&self.output)?;
        build_package(&def.package, &files, out)?;

        // Read it back to report the instance ID it will publish as.
        let instance = PackageInstance::open(fs::File::open(&self.output)?, None)?;
        println!(
            "Built {} ({} files)",
            instance.pin().to_string().bold(),
            files.len()
        );
        Ok(())
    }
}
