//! `pfupdate skip` / `pfupdate unskip`

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use super::CliConfig;
use super::common::open_manager;

#[derive(Parser, Debug)]
pub struct SkipArgs {
    #[arg(value_name = "VERSION")]
    pub version: String,
}

pub async fn execute_skip(args: SkipArgs, config: &CliConfig) -> Result<()> {
    let manager = open_manager(config, None).await?;
    // The cached manifest tells whether this version is required.
    if let Some(cached) = manager.cached_manifest().await
        && cached.manifest.version == args.version
        && cached.manifest.required
    {
        anyhow::bail!("Version {} is a required update and cannot be skipped", args.version);
    }
    manager.skip_version(&args.version).await?;
    println!("{}", format!("Version {} will no longer be offered", args.version).green());
    Ok(())
}

pub async fn execute_unskip(args: SkipArgs, config: &CliConfig) -> Result<()> {
    let manager = open_manager(config, None).await?;
    if manager.clear_skip_version(&args.version).await? {
        println!("{}", format!("Version {} will be offered again", args.version).green());
    } else {
        println!("{}", format!("Version {} was not skipped", args.version).dimmed());
    }
    Ok(())
}
