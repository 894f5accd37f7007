//! `pfupdate status`

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use super::CliConfig;
use super::common::{format_bytes, open_manager, print_failovers};
use crate::update::EndpointSummary;

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Probe every endpoint now and report its health and latency
    #[arg(long)]
    pub probe: bool,
}

pub async fn execute(args: StatusArgs, config: &CliConfig) -> Result<()> {
    let manager = open_manager(config, None).await?;
    let settings = manager.settings().await;
    let local = manager.local_version().await;

    println!("{}", "Installation".bold());
    println!("  Version:     {}", local.version.cyan());
    if let Some(build) = local.build_number {
        println!("  Build:       {build}");
    }
    println!("  Directory:   {}", manager.installer().install_dir().display());
    println!("  Platform:    {}", manager.installer().platform());

    println!("\n{}", "Policy".bold());
    println!("  Channel:     {}", settings.channel.to_string().cyan());
    println!("  Interval:    every {}h", settings.check_interval_hours);
    println!(
        "  Automatic:   download {}, install {}",
        on_off(settings.auto_download),
        on_off(settings.auto_install)
    );
    if !settings.skip_versions.is_empty() {
        println!("  Skipped:     {}", settings.skip_versions.join(", "));
    }
    if let Some(deferred) = &settings.deferred {
        println!("  Deferred:    {} until {}", deferred.version, deferred.until.format("%Y-%m-%d %H:%M UTC"));
    }

    println!("\n{}", "Last check".bold());
    match manager.cached_manifest().await {
        Some(cached) => {
            let m = &cached.manifest;
            println!(
                "  {} build {} ({}), checked {}",
                m.version.cyan(),
                m.build_number,
                format_bytes(m.download_size),
                cached.checked_at.format("%Y-%m-%d %H:%M UTC")
            );
            if m.required {
                println!("  {}", "This update is required".red());
            }
        }
        None => println!("  {}", "never checked".dimmed()),
    }

    println!("\n{}", "Endpoints".bold());
    if settings.endpoints.is_empty() {
        println!("  {}", "none configured; run `pfupdate config set endpoints id=url,...`".yellow());
    }
    let summary = if args.probe {
        manager.probe_endpoints().await
    } else {
        manager.endpoint_summary().await
    };
    for entry in &summary {
        let endpoint = &entry.endpoint;
        println!(
            "  [{}] {:<12} {} {}",
            endpoint.priority,
            endpoint.id,
            endpoint.base_url,
            endpoint_label(entry)
        );
        if entry.stats.requests > 0 {
            let average = entry.stats.average_latency().unwrap_or_default();
            println!(
                "      {} requests, {} failed, avg {} ms",
                entry.stats.requests,
                entry.stats.failures,
                average.as_millis()
            );
        }
    }
    if !args.probe && !summary.is_empty() {
        println!("  {}", "run with --probe to check reachability now".dimmed());
    }
    print_failovers(&manager.failover_history().await);

    let backups = manager.backups().list().await?;
    println!("\n{}", "Backups".bold());
    match backups.first() {
        Some(latest) => println!(
            "  {} total, latest {} ({})",
            backups.len(),
            latest.backup_id.cyan(),
            latest.source_version
        ),
        None => println!("  {}", "none".dimmed()),
    }

    Ok(())
}

fn endpoint_label(entry: &EndpointSummary) -> String {
    let health = &entry.health;
    let latency = health
        .probe_latency
        .map(|l| format!(" in {} ms", l.as_millis()))
        .unwrap_or_default();
    if health.last_check_time.is_none() {
        "not probed".dimmed().to_string()
    } else if health.is_healthy {
        format!("{}{latency}", "healthy".green())
    } else {
        format!(
            "{}{latency}",
            format!("unhealthy ({} failures)", health.consecutive_failures).red()
        )
    }
}

fn on_off(enabled: bool) -> colored::ColoredString {
    if enabled { "on".green() } else { "off".dimmed() }
}
