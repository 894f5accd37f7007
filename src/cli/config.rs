//! `pfupdate config show|set`

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use super::CliConfig;
use super::common::{data_dir, load_settings};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective settings as TOML
    Show,

    /// Change one setting and save it
    ///
    /// Keys: channel, check_interval_hours, check_on_startup, auto_download,
    /// auto_install, backup_before_update, keep_backups, keep_downloads,
    /// health_path, probe_timeout_secs, health_ttl_secs, failure_backoff_secs,
    /// install_dir, endpoints (as `id=url,id=url`).
    Set {
        key: String,
        value: String,
    },

    /// Print the settings file location
    Path,
}

impl ConfigCommand {
    pub async fn execute(self, config: &CliConfig) -> Result<()> {
        match self {
            Self::Show => {
                let store = load_settings(config, None).await?;
                let rendered =
                    toml::to_string_pretty(store.get()).context("Failed to render settings")?;
                println!("{}", format!("# {}", store.path().display()).dimmed());
                print!("{rendered}");
            }
            Self::Set { key, value } => {
                let mut store = load_settings(config, None).await?;
                store.update(|s| s.set_key(&key, &value))?;
                store.persist().await?;
                println!("{}", format!("Set {key} = {value}").green());
            }
            Self::Path => {
                println!("{}", data_dir(config)?.settings_path().display());
            }
        }
        Ok(())
    }
}
