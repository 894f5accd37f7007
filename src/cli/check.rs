//! Manual update check.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use super::CliConfig;
use super::common::{describe_session, open_manager, print_changelog};
use crate::update::{CheckTrigger, SessionState};
use crate::utils::ProgressBar;

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Check this channel instead of the configured one (stable, beta, dev)
    #[arg(long)]
    pub channel: Option<String>,
}

pub async fn execute(args: CheckArgs, config: &CliConfig) -> Result<()> {
    let manager = open_manager(config, args.channel.as_deref()).await?;
    let settings = manager.settings().await;

    let spinner = ProgressBar::spinner(format!("Checking {} channel...", settings.channel));
    let session = manager.check(CheckTrigger::Manual).await.context("Update check failed")?;
    spinner.finish_and_clear();

    println!("{}", describe_session(&session));
    match session.state {
        SessionState::UpdateAvailable => {
            print_changelog(&session);
            println!("\nRun {} to install it", "pfupdate upgrade".bold());
        }
        SessionState::Failed => {
            if let Some(error) = &session.error {
                anyhow::bail!("{} ({})", error.message, error.code);
            }
        }
        _ => {}
    }
    Ok(())
}
