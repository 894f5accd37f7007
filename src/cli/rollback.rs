//! Manual restore from a backup.

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;

use super::CliConfig;
use super::common::open_manager;

#[derive(Parser, Debug)]
pub struct RollbackArgs {
    /// Backup to restore; defaults to the newest
    #[arg(value_name = "BACKUP_ID")]
    pub backup_id: Option<String>,
}

pub async fn execute(args: RollbackArgs, config: &CliConfig) -> Result<()> {
    let manager = open_manager(config, None).await?;

    let target = args.backup_id.as_deref().unwrap_or("the latest backup");
    println!("{}", format!("Rolling back to {target}...").yellow());

    let result = manager
        .rollback(args.backup_id.as_deref())
        .await
        .context("Failed to restore from backup")?;

    if !result.success {
        bail!(
            "Rollback to {} did not complete: {}",
            result.backup_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "{}",
        format!("Restored version {} from backup {}", result.restored_version, result.backup_id).green()
    );
    Ok(())
}
