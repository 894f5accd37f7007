//! Shared helpers for CLI commands.

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;

use super::CliConfig;
use crate::config::{DataDir, SettingsStore, default_install_dir};
use crate::core::Channel;
use crate::update::{FailoverEvent, HttpTransport, SessionState, UpdateManager, UpdateSession};

/// Resolve the data directory for `config`.
pub fn data_dir(config: &CliConfig) -> Result<DataDir> {
    DataDir::resolve(config.home.clone()).context("Failed to resolve data directory")
}

/// Load settings, optionally switching channel for this invocation only.
pub async fn load_settings(config: &CliConfig, channel: Option<&str>) -> Result<SettingsStore> {
    let data_dir = data_dir(config)?;
    let mut store = SettingsStore::load(data_dir.settings_path())
        .await
        .with_context(|| format!("Failed to load {}", data_dir.settings_path().display()))?;
    if let Some(channel) = channel {
        let channel: Channel = channel.parse()?;
        store.update(|s| {
            s.channel = channel;
            Ok(())
        })?;
    }
    Ok(store)
}

/// Build an update manager over the real HTTP transport.
pub async fn open_manager(config: &CliConfig, channel: Option<&str>) -> Result<Arc<UpdateManager>> {
    let data_dir = data_dir(config)?;
    let store = load_settings(config, channel).await?;
    let install_dir = match store.get().install_dir.clone() {
        Some(dir) => dir,
        None => default_install_dir()?,
    };
    let transport = Arc::new(HttpTransport::new()?);
    Ok(Arc::new(UpdateManager::new(&data_dir, store, install_dir, transport)))
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{bytes} B") } else { format!("{value:.1} {}", UNITS[unit]) }
}

/// One-line colored summary of a session.
pub fn describe_session(session: &UpdateSession) -> String {
    let manifest = session.current_manifest.as_ref();
    match session.state {
        SessionState::UpdateAvailable => {
            let manifest_version = manifest.map_or("?", |m| m.version.as_str());
            let line = format!("Update available: {} -> {}", session.local_version.version, manifest_version);
            let mut text = line.green().to_string();
            if manifest.is_some_and(|m| m.required) {
                text = format!("{text} {}", "(required)".red().bold());
            }
            if manifest.is_some_and(|m| !m.rollback_supported) {
                text = format!("{text} {}", "(cannot be rolled back once installed)".yellow());
            }
            text
        }
        SessionState::Idle => {
            format!("You are on the latest version ({})", session.local_version.version)
                .green()
                .to_string()
        }
        SessionState::Verifying => format!(
            "Update {} downloaded and verified",
            manifest.map_or("?", |m| m.version.as_str())
        )
        .cyan()
        .to_string(),
        SessionState::Succeeded => {
            format!("Updated to {}", session.local_version.version).green().bold().to_string()
        }
        SessionState::RolledBack => {
            let reason = session.error.as_ref().map_or("", |e| e.message.as_str());
            format!("Update failed and was rolled back: {reason}").yellow().to_string()
        }
        SessionState::Failed => {
            let reason = session.error.as_ref().map_or("", |e| e.message.as_str());
            format!("Update failed: {reason}").red().to_string()
        }
        state => format!("Session is {state}").dimmed().to_string(),
    }
}

/// Print failovers seen during this run.
pub fn print_failovers(events: &[FailoverEvent]) {
    if events.is_empty() {
        return;
    }
    println!("\n{}", "Failovers".bold());
    for event in events {
        println!(
            "  {} {} -> {}: {}",
            event.at.format("%H:%M:%S"),
            event.from,
            event.to.as_deref().unwrap_or("none"),
            event.reason.dimmed()
        );
    }
}

/// Print the changelog of the session's manifest, if any.
pub fn print_changelog(session: &UpdateSession) {
    let Some(manifest) = &session.current_manifest else {
        return;
    };
    if manifest.changelog.is_empty() && manifest.update_notes.is_empty() {
        return;
    }
    println!("\n{}", format!("What's new in {}:", manifest.version).bold());
    for entry in &manifest.changelog {
        println!("  {} {}", format!("[{}]", entry.kind).cyan(), entry.description);
    }
    if !manifest.update_notes.is_empty() {
        println!("\n{}", manifest.update_notes);
    }
}
