//! Manifest generation for release tooling.
//!
//! Computes size and digests of a built artifact and prints the
//! `version.json` document an update endpoint serves for its channel.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::Channel;
use crate::update::manifest::{ChangelogEntry, Checksums, VersionManifest};
use crate::update::verification::ChecksumVerifier;
use crate::update::version_check::default_build_number;
use crate::utils::atomic_write;

#[derive(Parser, Debug)]
pub struct ManifestArgs {
    /// Release artifact (.zip package or executable)
    #[arg(value_name = "ARTIFACT")]
    pub artifact: PathBuf,

    /// Version being released
    #[arg(long)]
    pub version: String,

    /// Release channel
    #[arg(long, default_value = "stable")]
    pub channel: String,

    /// Absolute URL the artifact will be served from
    #[arg(long)]
    pub url: String,

    /// Build number; derived from the version when omitted
    #[arg(long)]
    pub build: Option<u64>,

    /// Mark as a required update
    #[arg(long)]
    pub required: bool,

    /// Allow clients with auto-update policies to install it unattended
    #[arg(long)]
    pub auto_update: bool,

    /// Changelog entry as `type:description`, repeatable
    #[arg(long = "change", value_name = "TYPE:DESCRIPTION")]
    pub changes: Vec<String>,

    /// Required operating system (e.g. "Windows 10 or later")
    #[arg(long)]
    pub os: Option<String>,

    /// Required architecture (e.g. x64)
    #[arg(long)]
    pub arch: Option<String>,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn execute(args: ManifestArgs) -> Result<()> {
    let channel: Channel = args.channel.parse()?;
    let manifest = build(&args, channel).await?;

    let json = serde_json::to_string_pretty(&manifest).context("Failed to render manifest")?;
    // Reject anything a client would refuse.
    VersionManifest::parse(json.as_bytes(), channel).context("Generated manifest is invalid")?;

    match &args.output {
        Some(path) => {
            atomic_write(path, json.as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn build(args: &ManifestArgs, channel: Channel) -> Result<VersionManifest> {
    let digests = ChecksumVerifier::compute(&args.artifact)
        .await
        .with_context(|| format!("Failed to read {}", args.artifact.display()))?;

    let changelog = args
        .changes
        .iter()
        .map(|change| match change.split_once(':') {
            Some((kind, description)) => ChangelogEntry {
                kind: kind.trim().to_string(),
                description: description.trim().to_string(),
            },
            None => ChangelogEntry {
                kind: "improvement".to_string(),
                description: change.trim().to_string(),
            },
        })
        .collect();

    let mut system_requirements = BTreeMap::new();
    if let Some(os) = &args.os {
        system_requirements.insert("os".to_string(), os.clone());
    }
    if let Some(arch) = &args.arch {
        system_requirements.insert("architecture".to_string(), arch.clone());
    }

    Ok(VersionManifest {
        version: args.version.trim_start_matches('v').to_string(),
        build_number: args.build.unwrap_or_else(|| default_build_number(&args.version)),
        channel,
        release_date: Some(Utc::now()),
        download_url: args.url.clone(),
        download_size: digests.size,
        checksum: Checksums::new([
            ("sha256".to_string(), digests.sha256),
            ("md5".to_string(), digests.md5),
        ]),
        required: args.required,
        changelog,
        system_requirements,
        update_notes: String::new(),
        rollback_supported: true,
        auto_update_eligible: args.auto_update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_generated_manifest_round_trips() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("PersonalFinanceDashboard-1.2.0.zip");
        std::fs::write(&artifact, b"Hello, World!").unwrap();

        let args = ManifestArgs {
            artifact,
            version: "v1.2.0".to_string(),
            channel: "beta".to_string(),
            url: "https://updates.example.com/beta/PersonalFinanceDashboard-1.2.0.zip".to_string(),
            build: None,
            required: true,
            auto_update: false,
            changes: vec!["bugfix: Fix CSV import".to_string()],
            os: Some("Windows 10 or later".to_string()),
            arch: None,
            output: Some(temp.path().join("version.json")),
        };
        execute(args).await.unwrap();

        let written = std::fs::read(temp.path().join("version.json")).unwrap();
        let manifest = VersionManifest::parse(&written, Channel::Beta).unwrap();
        assert_eq!(manifest.version, "1.2.0");
        assert_eq!(manifest.build_number, 10200);
        assert_eq!(manifest.download_size, 13);
        assert_eq!(
            manifest.checksum.sha256(),
            Some("dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f")
        );
        assert_eq!(manifest.checksum.md5(), Some("65a8e27d8879283831b664bd8b7f0ad4"));
        assert!(manifest.required);
        assert_eq!(manifest.changelog[0].kind, "bugfix");
        assert_eq!(manifest.system_requirements["os"], "Windows 10 or later");
    }
}
