//! Interactive check → download → install.

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use super::CliConfig;
use super::common::{
    describe_session, format_bytes, open_manager, print_changelog, print_failovers,
};
use crate::update::{CheckTrigger, InstallRequest, SessionState, UpdateManager, UpdateSession};
use crate::utils::ProgressBar;

#[derive(Parser, Debug)]
pub struct UpgradeArgs {
    /// Upgrade from this channel instead of the configured one
    #[arg(long)]
    pub channel: Option<String>,

    /// Install without asking for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Skip the pre-install backup (refused for required updates)
    #[arg(long)]
    pub no_backup: bool,
}

pub async fn execute(args: UpgradeArgs, config: &CliConfig) -> Result<()> {
    let manager = open_manager(config, args.channel.as_deref()).await?;

    let spinner = ProgressBar::spinner("Checking for updates...");
    let session = manager.check(CheckTrigger::Manual).await.context("Update check failed")?;
    spinner.finish_and_clear();

    let session = match session.state {
        SessionState::UpdateAvailable => {
            println!("{}", describe_session(&session));
            print_changelog(&session);
            if let Some(manifest) = &session.current_manifest {
                println!("Download size: {}", format_bytes(manifest.download_size));
            }
            if !args.yes && !confirm("Install this update?").await? {
                println!("{}", "Update postponed".yellow());
                manager.cancel(false)?;
                return Ok(());
            }
            download(&manager, config.quiet).await?
        }
        // Auto-download policy may already have fetched it.
        SessionState::Verifying | SessionState::Succeeded => session,
        _ => return report(&session),
    };

    if session.state != SessionState::Verifying {
        print_failovers(&manager.failover_history().await);
        return report(&session);
    }

    let spinner = ProgressBar::spinner("Installing update...");
    let session = manager
        .install(InstallRequest {
            skip_backup: args.no_backup,
        })
        .await?;
    spinner.finish_and_clear();

    if let Some(backup_id) = &session.backup_id
        && session.state == SessionState::Succeeded
    {
        println!("Backup {} saved; run {} to undo", backup_id.cyan(), "pfupdate rollback".bold());
    }
    if session.backup_skipped {
        println!("{}", "No backup was taken for this update".yellow());
    }
    print_failovers(&manager.failover_history().await);
    report(&session)
}

async fn download(manager: &Arc<UpdateManager>, quiet: bool) -> Result<UpdateSession> {
    let total = manager
        .snapshot()
        .current_manifest
        .map_or(0, |m| m.download_size);
    let bar = if quiet { None } else { Some(ProgressBar::bytes(total)) };
    if let Some(bar) = &bar {
        bar.set_message("Downloading");
    }

    let mut events = manager.subscribe();
    let progress_bar = bar.clone();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.state == SessionState::Downloading => {
                    if let (Some(bar), Some(p)) = (&progress_bar, event.progress) {
                        bar.set_position(p.bytes_done, p.bytes_total);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let canceller = Arc::clone(manager);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = canceller.cancel(false);
        }
    });

    let session = manager.download().await;
    interrupt.abort();
    progress.abort();

    let session = session?;
    if let Some(bar) = bar {
        match session.state {
            SessionState::Verifying => bar.finish_with_message("Downloaded and verified"),
            _ => bar.finish_and_clear(),
        }
    }
    if session.state == SessionState::Idle {
        println!("{}", "Download cancelled; it will resume next time".yellow());
    }
    Ok(session)
}

async fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .context("Failed to read confirmation")??;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn report(session: &UpdateSession) -> Result<()> {
    println!("{}", describe_session(session));
    match (&session.state, &session.error) {
        (SessionState::Failed | SessionState::RolledBack, Some(error)) => {
            if let Some(rollback) = &error.rollback
                && !rollback.success
            {
                bail!(
                    "{}; automatic rollback failed, restore with `pfupdate rollback {}`",
                    error.message,
                    rollback.backup_id
                );
            }
            bail!("{}", error.message)
        }
        _ => Ok(()),
    }
}
