//! `pfupdate backups list|prune`

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use super::CliConfig;
use super::common::{format_bytes, open_manager};

#[derive(Subcommand, Debug)]
pub enum BackupsCommand {
    /// List backups, newest first
    List,

    /// Delete all but the newest backups
    Prune {
        /// How many to keep; defaults to the `keep_backups` setting
        #[arg(long)]
        keep: Option<usize>,
    },
}

impl BackupsCommand {
    pub async fn execute(self, config: &CliConfig) -> Result<()> {
        let manager = open_manager(config, None).await?;
        match self {
            Self::List => {
                let backups = manager.backups().list().await?;
                if backups.is_empty() {
                    println!("{}", "No backups".dimmed());
                    return Ok(());
                }
                for backup in backups {
                    println!(
                        "{}  {}  {:>10}  {}",
                        backup.backup_id.cyan(),
                        backup.source_version,
                        format_bytes(backup.size_bytes),
                        backup.created_at.format("%Y-%m-%d %H:%M UTC")
                    );
                }
            }
            Self::Prune { keep } => {
                let keep = match keep {
                    Some(keep) => keep,
                    None => manager.settings().await.keep_backups,
                };
                let removed = manager.backups().prune(keep).await?;
                if removed.is_empty() {
                    println!("Nothing to prune");
                } else {
                    for id in &removed {
                        println!("Removed {}", id.dimmed());
                    }
                    println!("{}", format!("Pruned {} backup(s)", removed.len()).green());
                }
            }
        }
        Ok(())
    }
}
