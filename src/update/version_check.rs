//! Version comparison, the installed-version marker, and the check cache.
//!
//! Comparison is a pure function over a local version and a manifest's
//! `(version, build_number)` pair. Versions are compared numerically by
//! `major.minor.patch` via `semver`; when those are equal the build number
//! breaks the tie. Anything that does not parse fails closed as
//! [`VersionOrdering::Older`] so a garbled manifest can never force an update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::{Channel, UpdateError};
use crate::update::manifest::VersionManifest;
use crate::utils::atomic_write;

/// File written into the install directory after a successful install.
pub const VERSION_MARKER_FILE: &str = "app_version.json";

/// Where a manifest version sits relative to the local install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionOrdering {
    Older,
    Equal,
    Newer,
}

/// The version currently installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVersion {
    pub version: String,
    /// Unknown for installs that predate build numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u64>,
}

impl LocalVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            build_number: None,
        }
    }

    #[must_use]
    pub fn with_build(mut self, build_number: u64) -> Self {
        self.build_number = Some(build_number);
        self
    }
}

/// Parse a version leniently: a leading `v` is dropped and missing minor or
/// patch components are treated as zero (`"2.1"` is `2.1.0`).
#[must_use]
pub fn parse_version(version: &str) -> Option<semver::Version> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);

    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let parts = core.split('.').count();
    let padded = match parts {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };

    semver::Version::parse(&padded).ok()
}

/// Build number the release tooling assigns when none is given:
/// `major * 10000 + minor * 100 + patch`.
///
/// Falls back to 1 for unparseable versions.
#[must_use]
pub fn default_build_number(version: &str) -> u64 {
    parse_version(version).map_or(1, |v| v.major * 10_000 + v.minor * 100 + v.patch)
}

/// Compare a manifest's `(version, build_number)` against the local install.
///
/// Returns how the *manifest* relates to the local version, so `Newer`
/// means an update is available. If the semantic versions are equal and the
/// local build number is unknown, the result is `Equal`.
#[must_use]
pub fn compare(local: &LocalVersion, version: &str, build_number: u64) -> VersionOrdering {
    let (Some(local_semver), Some(remote_semver)) =
        (parse_version(&local.version), parse_version(version))
    else {
        debug!(local = %local.version, remote = %version, "Malformed version, treating as older");
        return VersionOrdering::Older;
    };

    let ordering = remote_semver
        .cmp_precedence(&local_semver)
        .then_with(|| match local.build_number {
            Some(local_build) => build_number.cmp(&local_build),
            None => std::cmp::Ordering::Equal,
        });

    match ordering {
        std::cmp::Ordering::Less => VersionOrdering::Older,
        std::cmp::Ordering::Equal => VersionOrdering::Equal,
        std::cmp::Ordering::Greater => VersionOrdering::Newer,
    }
}

/// Contents of [`VERSION_MARKER_FILE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub version: String,
    pub build_number: u64,
    pub channel: Channel,
}

impl InstalledVersion {
    pub fn from_manifest(manifest: &VersionManifest) -> Self {
        Self {
            version: manifest.version.clone(),
            build_number: manifest.build_number,
            channel: manifest.channel,
        }
    }

    /// Read the marker from `install_dir`, `None` when absent or unreadable.
    pub async fn load(install_dir: &Path) -> Option<Self> {
        let path = install_dir.join(VERSION_MARKER_FILE);
        let content = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("Ignoring unreadable version marker {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write the marker into `dir` (normally the staging directory).
    pub fn write_to(&self, dir: &Path) -> Result<(), UpdateError> {
        let path = dir.join(VERSION_MARKER_FILE);
        let content = serde_json::to_vec_pretty(self)
            .map_err(|e| UpdateError::parse("version marker", e))?;
        atomic_write(&path, &content).map_err(|e| UpdateError::io("writing", &path, e))
    }

    pub fn local_version(&self) -> LocalVersion {
        LocalVersion::new(&self.version).with_build(self.build_number)
    }
}

/// Last manifest seen for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedManifest {
    pub checked_at: DateTime<Utc>,
    pub manifest: VersionManifest,
}

impl CachedManifest {
    pub fn new(manifest: VersionManifest) -> Self {
        Self {
            checked_at: Utc::now(),
            manifest,
        }
    }

    /// Check if the entry is younger than `interval_seconds`.
    pub fn is_valid(&self, interval_seconds: u64) -> bool {
        let age = Utc::now() - self.checked_at;
        age.num_seconds() < i64::try_from(interval_seconds).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VersionCacheFile {
    #[serde(default)]
    channels: BTreeMap<Channel, CachedManifest>,
}

/// JSON-backed cache of the last manifest per channel.
///
/// Used to throttle scheduled checks to the configured interval. A corrupt
/// cache file is treated as empty.
#[derive(Debug, Clone)]
pub struct VersionCache {
    path: PathBuf,
}

impl VersionCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> VersionCacheFile {
        let Ok(content) = tokio::fs::read(&self.path).await else {
            return VersionCacheFile::default();
        };
        serde_json::from_slice(&content).unwrap_or_else(|e| {
            warn!("Discarding corrupt version cache {}: {}", self.path.display(), e);
            VersionCacheFile::default()
        })
    }

    pub async fn get(&self, channel: Channel) -> Option<CachedManifest> {
        self.load().await.channels.remove(&channel)
    }

    pub async fn put(&self, manifest: &VersionManifest) -> Result<(), UpdateError> {
        let mut file = self.load().await;
        file.channels.insert(manifest.channel, CachedManifest::new(manifest.clone()));

        let content = serde_json::to_vec_pretty(&file)
            .map_err(|e| UpdateError::parse("version cache", e))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, &content))
            .await
            .map_err(|e| UpdateError::io("writing", &self.path, std::io::Error::other(e)))?
            .map_err(|e| UpdateError::io("writing", &self.path, e))?;

        debug!(channel = %manifest.channel, "Saved manifest to version cache");
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), UpdateError> {
        crate::utils::fs::remove_file_if_exists(&self.path)
            .map_err(|e| UpdateError::io("removing", &self.path, e))
    }
}
