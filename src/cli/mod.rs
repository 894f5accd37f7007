//! Command-line interface for pfupdate.
//!
//! Each subcommand lives in its own module with a `clap` args struct and an
//! `execute` function. Commands that touch the update engine build an
//! [`UpdateManager`](crate::update::UpdateManager) through [`common::open_manager`].
//!
//! ```bash
//! pfupdate check                 # manual check on the configured channel
//! pfupdate upgrade --yes         # check, download and install
//! pfupdate status --probe        # installed version, cache and endpoint health
//! pfupdate rollback              # restore the newest backup
//! pfupdate backups prune --keep 2
//! pfupdate skip 1.4.0
//! pfupdate config set channel beta
//! pfupdate manifest dist/PersonalFinanceDashboard-1.4.0.zip \
//!     --version 1.4.0 --channel stable --url https://updates.example.com/stable/PersonalFinanceDashboard-1.4.0.zip
//! ```

mod backups;
mod check;
pub mod common;
mod config;
mod manifest;
mod rollback;
mod skip;
mod status;
mod upgrade;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Runtime options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Data directory override (`--home`).
    pub home: Option<PathBuf>,
    /// Suppress progress bars and informational output.
    pub quiet: bool,
}

/// Self-update engine for the Personal Finance Dashboard.
#[derive(Parser)]
#[command(
    name = "pfupdate",
    about = "Check, download and install Personal Finance Dashboard updates",
    version,
    long_about = "pfupdate keeps the Personal Finance Dashboard up to date: it checks the \
                  configured release channel, downloads verified artifacts with resume \
                  support, installs them atomically and rolls back automatically on failure."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging (same as `RUST_LOG=pfupdate=debug`).
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Data directory holding settings, cache, downloads and backups.
    ///
    /// Defaults to `$PFUPDATE_HOME`, then the platform data directory.
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the release channel for a newer version
    Check(check::CheckArgs),

    /// Check, download and install the latest version
    Upgrade(upgrade::UpgradeArgs),

    /// Show installed version, cached manifest and endpoint health
    Status(status::StatusArgs),

    /// Restore a backup taken before an update
    Rollback(rollback::RollbackArgs),

    /// List or prune install backups
    #[command(subcommand)]
    Backups(backups::BackupsCommand),

    /// Stop offering a version
    Skip(skip::SkipArgs),

    /// Offer a previously skipped version again
    Unskip(skip::SkipArgs),

    /// Show or change update settings
    #[command(subcommand)]
    Config(config::ConfigCommand),

    /// Generate a version manifest for a release artifact
    Manifest(manifest::ManifestArgs),
}

impl Cli {
    /// Log filter implied by the global flags, unless `RUST_LOG` overrides it.
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "pfupdate=debug"
        } else if self.quiet {
            "warn"
        } else {
            "pfupdate=info"
        }
    }

    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        CliConfig {
            home: self.home.clone(),
            quiet: self.quiet,
        }
    }

    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        match self.command {
            Commands::Check(args) => check::execute(args, &config).await,
            Commands::Upgrade(args) => upgrade::execute(args, &config).await,
            Commands::Status(args) => status::execute(args, &config).await,
            Commands::Rollback(args) => rollback::execute(args, &config).await,
            Commands::Backups(cmd) => cmd.execute(&config).await,
            Commands::Skip(args) => skip::execute_skip(args, &config).await,
            Commands::Unskip(args) => skip::execute_unskip(args, &config).await,
            Commands::Config(cmd) => cmd.execute(&config).await,
            Commands::Manifest(args) => manifest::execute(args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["pfupdate", "--home", "/tmp/pf", "-v", "status"]).unwrap();
        assert_eq!(cli.log_filter(), "pfupdate=debug");
        assert_eq!(cli.build_config().home, Some(PathBuf::from("/tmp/pf")));

        let cli = Cli::try_parse_from(["pfupdate", "status", "--quiet"]).unwrap();
        assert_eq!(cli.log_filter(), "warn");
        assert!(cli.build_config().quiet);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["pfupdate", "-v", "-q", "status"]).is_err());
    }

    #[test]
    fn test_status_flags() {
        let cli = Cli::try_parse_from(["pfupdate", "status", "--probe"]).unwrap();
        let Commands::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert!(args.probe);
    }

    #[test]
    fn test_upgrade_flags() {
        let cli =
            Cli::try_parse_from(["pfupdate", "upgrade", "--channel", "beta", "--yes", "--no-backup"])
                .unwrap();
        let Commands::Upgrade(args) = cli.command else {
            panic!("expected upgrade");
        };
        assert_eq!(args.channel.as_deref(), Some("beta"));
        assert!(args.yes);
        assert!(args.no_backup);
    }
}
