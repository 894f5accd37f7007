//! Update policy settings persisted in `settings.toml`.
//!
//! Settings are an explicit object: [`SettingsStore`] loads them once, hands
//! out copies, and writes them back only through [`SettingsStore::persist`].
//! Nothing reads the file behind the store's back; [`SettingsStore::reload`]
//! picks up external edits.
//!
//! # File Format
//!
//! ```toml
//! channel = "stable"
//! check_interval_hours = 24
//! check_on_startup = true
//! auto_download = false
//! auto_install = false
//! backup_before_update = true
//! skip_versions = ["1.0.2"]
//! keep_backups = 5
//! keep_downloads = 3
//!
//! [[endpoints]]
//! id = "primary"
//! base_url = "https://updates.example.com"
//! priority = 0
//!
//! [[endpoints]]
//! id = "mirror"
//! base_url = "https://mirror.example.net/releases"
//! priority = 1
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::{Channel, UpdateError};
use crate::update::failover::{Endpoint, FailoverPolicy};
use crate::utils::atomic_write;

/// Allowed range for the periodic check interval.
pub const CHECK_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 1..=168;

/// A "remind me later" for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferral {
    pub version: String,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSettings {
    #[serde(default)]
    pub channel: Channel,

    /// Hours between scheduled checks (1–168).
    #[serde(default = "default_check_interval_hours")]
    pub check_interval_hours: u64,

    #[serde(default = "default_true")]
    pub check_on_startup: bool,

    /// Download eligible updates without asking.
    #[serde(default)]
    pub auto_download: bool,

    /// Install eligible updates once downloaded without asking.
    #[serde(default)]
    pub auto_install: bool,

    #[serde(default = "default_true")]
    pub backup_before_update: bool,

    /// Versions the user chose not to be offered again.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_versions: Vec<String>,

    #[serde(default = "default_keep_backups")]
    pub keep_backups: usize,

    /// Completed downloads kept besides the one waiting to be installed.
    #[serde(default = "default_keep_downloads")]
    pub keep_downloads: usize,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_health_ttl_secs")]
    pub health_ttl_secs: u64,

    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,

    /// Application directory to update. Defaults to the directory of the
    /// running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<Deferral>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            channel: Channel::default(),
            check_interval_hours: default_check_interval_hours(),
            check_on_startup: true,
            auto_download: false,
            auto_install: false,
            backup_before_update: true,
            skip_versions: Vec::new(),
            deferred: None,
            keep_backups: default_keep_backups(),
            keep_downloads: default_keep_downloads(),
            endpoints: Vec::new(),
            health_path: default_health_path(),
            probe_timeout_secs: default_probe_timeout_secs(),
            health_ttl_secs: default_health_ttl_secs(),
            failure_backoff_secs: default_failure_backoff_secs(),
            install_dir: None,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_check_interval_hours() -> u64 {
    24
}

const fn default_keep_backups() -> usize {
    5
}

const fn default_keep_downloads() -> usize {
    3
}

fn default_health_path() -> String {
    "/health".to_string()
}

const fn default_probe_timeout_secs() -> u64 {
    5
}

const fn default_health_ttl_secs() -> u64 {
    300
}

const fn default_failure_backoff_secs() -> u64 {
    30
}

fn parse_bool(key: &str, value: &str) -> Result<bool, UpdateError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(UpdateError::Config {
            message: format!("{key} expects true or false, got '{value}'"),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, UpdateError> {
    value.trim().parse().map_err(|_| UpdateError::Config {
        message: format!("{key} expects a non-negative integer, got '{value}'"),
    })
}

impl UpdateSettings {
    /// Reject values outside their allowed ranges.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if !CHECK_INTERVAL_RANGE.contains(&self.check_interval_hours) {
            return Err(UpdateError::Config {
                message: format!(
                    "check_interval_hours must be between {} and {}, got {}",
                    CHECK_INTERVAL_RANGE.start(),
                    CHECK_INTERVAL_RANGE.end(),
                    self.check_interval_hours
                ),
            });
        }
        if self.probe_timeout_secs == 0 {
            return Err(UpdateError::Config {
                message: "probe_timeout_secs must be at least 1".to_string(),
            });
        }

        let mut ids = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !ids.insert(endpoint.id.as_str()) {
                return Err(UpdateError::Config {
                    message: format!("duplicate endpoint id '{}'", endpoint.id),
                });
            }
            let url = reqwest::Url::parse(&endpoint.base_url).map_err(|e| UpdateError::Config {
                message: format!("endpoint '{}' has invalid base_url: {e}", endpoint.id),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(UpdateError::Config {
                    message: format!("endpoint '{}' must use http or https", endpoint.id),
                });
            }
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_hours * 3600)
    }

    pub fn failover_policy(&self) -> FailoverPolicy {
        let failure_backoff = Duration::from_secs(self.failure_backoff_secs);
        FailoverPolicy {
            health_path: self.health_path.clone(),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            health_ttl: Duration::from_secs(self.health_ttl_secs),
            failure_backoff,
            max_backoff: failure_backoff.saturating_mul(20),
        }
    }

    pub fn is_skipped(&self, version: &str) -> bool {
        self.skip_versions.iter().any(|v| v == version)
    }

    /// Whether `version` is deferred at `now`.
    pub fn is_deferred(&self, version: &str, now: DateTime<Utc>) -> bool {
        self.deferred.as_ref().is_some_and(|d| d.version == version && d.until > now)
    }

    /// Set one setting from its textual form, as used by `pfupdate config set`.
    ///
    /// `endpoints` takes a comma-separated `id=url` list; order sets priority.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<(), UpdateError> {
        match key {
            "channel" => self.channel = value.parse()?,
            "check_interval_hours" => self.check_interval_hours = parse_number(key, value)?,
            "check_on_startup" => self.check_on_startup = parse_bool(key, value)?,
            "auto_download" => self.auto_download = parse_bool(key, value)?,
            "auto_install" => self.auto_install = parse_bool(key, value)?,
            "backup_before_update" => self.backup_before_update = parse_bool(key, value)?,
            "keep_backups" => self.keep_backups = parse_number(key, value)?,
            "keep_downloads" => self.keep_downloads = parse_number(key, value)?,
            "health_path" => self.health_path = value.trim().to_string(),
            "probe_timeout_secs" => self.probe_timeout_secs = parse_number(key, value)?,
            "health_ttl_secs" => self.health_ttl_secs = parse_number(key, value)?,
            "failure_backoff_secs" => self.failure_backoff_secs = parse_number(key, value)?,
            "install_dir" => {
                self.install_dir =
                    (!value.trim().is_empty()).then(|| PathBuf::from(value.trim()));
            }
            "endpoints" => {
                let mut endpoints = Vec::new();
                for (priority, item) in
                    value.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate()
                {
                    let (id, url) = item.split_once('=').ok_or_else(|| UpdateError::Config {
                        message: format!("endpoint '{item}' must be written as id=url"),
                    })?;
                    endpoints.push(Endpoint::new(
                        id.trim(),
                        url.trim(),
                        u32::try_from(priority).unwrap_or(u32::MAX),
                    ));
                }
                self.endpoints = endpoints;
            }
            _ => {
                return Err(UpdateError::Config {
                    message: format!("unknown setting '{key}'"),
                });
            }
        }
        self.validate()
    }
}

/// Owns the settings and their file.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    settings: UpdateSettings,
}

impl SettingsStore {
    /// In-memory store that persists to `path`.
    pub fn new(path: impl Into<PathBuf>, settings: UpdateSettings) -> Self {
        Self {
            path: path.into(),
            settings,
        }
    }

    /// Load from `path`; a missing file yields defaults.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, UpdateError> {
        let path = path.into();
        let settings = Self::read(&path).await?;
        Ok(Self { path, settings })
    }

    async fn read(path: &Path) -> Result<UpdateSettings, UpdateError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                return Ok(UpdateSettings::default());
            }
            Err(e) => return Err(UpdateError::io("reading", path, e)),
        };

        let settings: UpdateSettings = toml::from_str(&content)
            .map_err(|e| UpdateError::parse(format!("settings {}", path.display()), e))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> &UpdateSettings {
        &self.settings
    }

    /// Apply `change` in memory after validating the result.
    pub fn update(
        &mut self,
        change: impl FnOnce(&mut UpdateSettings) -> Result<(), UpdateError>,
    ) -> Result<(), UpdateError> {
        let mut next = self.settings.clone();
        change(&mut next)?;
        next.validate()?;
        self.settings = next;
        Ok(())
    }

    /// Replace in-memory settings with the file contents.
    pub async fn reload(&mut self) -> Result<(), UpdateError> {
        self.settings = Self::read(&self.path).await?;
        Ok(())
    }

    /// Write the current settings atomically.
    pub async fn persist(&self) -> Result<(), UpdateError> {
        let content = toml::to_string_pretty(&self.settings)
            .map_err(|e| UpdateError::parse("settings", e))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, content.as_bytes()))
            .await
            .map_err(|e| UpdateError::io("writing", &self.path, std::io::Error::other(e)))?
            .map_err(|e| UpdateError::io("writing", &self.path, e))?;
        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = UpdateSettings::default();
        assert_eq!(settings.channel, Channel::Stable);
        assert_eq!(settings.check_interval_hours, 24);
        assert!(settings.backup_before_update);
        assert!(!settings.auto_install);
        assert_eq!(settings.keep_backups, 5);
        settings.validate().unwrap();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: UpdateSettings = toml::from_str(
            r#"
channel = "beta"
auto_download = true

[[endpoints]]
id = "primary"
base_url = "https://updates.example.com"
"#,
        )
        .unwrap();
        assert_eq!(settings.channel, Channel::Beta);
        assert!(settings.auto_download);
        assert_eq!(settings.check_interval_hours, 24);
        assert_eq!(settings.endpoints[0].priority, 0);
    }

    #[test]
    fn test_interval_bounds() {
        let mut settings = UpdateSettings::default();
        assert!(settings.set_key("check_interval_hours", "0").is_err());
        assert!(settings.set_key("check_interval_hours", "169").is_err());
        settings.set_key("check_interval_hours", "168").unwrap();
        assert_eq!(settings.check_interval(), Duration::from_secs(168 * 3600));
    }

    #[test]
    fn test_set_key() {
        let mut settings = UpdateSettings::default();
        settings.set_key("channel", "Dev").unwrap();
        settings.set_key("auto_install", "yes").unwrap();
        settings
            .set_key("endpoints", "primary=https://a.example.com, mirror=https://b.example.com")
            .unwrap();

        assert_eq!(settings.channel, Channel::Dev);
        assert!(settings.auto_install);
        assert_eq!(settings.endpoints[1], Endpoint::new("mirror", "https://b.example.com", 1));

        assert!(matches!(
            settings.set_key("channel", "nightly"),
            Err(UpdateError::InvalidChannel(_))
        ));
        assert!(settings.set_key("auto_install", "maybe").is_err());
        assert!(settings.set_key("colour", "blue").is_err());
        assert!(settings.set_key("endpoints", "a=https://x.com,a=https://y.com").is_err());
        assert!(settings.set_key("endpoints", "a=ftp://x.com").is_err());
    }

    #[test]
    fn test_deferral_expires() {
        let now = Utc::now();
        let mut settings = UpdateSettings::default();
        settings.deferred = Some(Deferral {
            version: "1.0.1".into(),
            until: now + chrono::Duration::hours(1),
        });
        assert!(settings.is_deferred("1.0.1", now));
        assert!(!settings.is_deferred("1.0.2", now));
        assert!(!settings.is_deferred("1.0.1", now + chrono::Duration::hours(2)));
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.toml");

        let mut store = SettingsStore::load(&path).await.unwrap();
        assert_eq!(store.get(), &UpdateSettings::default());

        store
            .update(|s| {
                s.skip_versions.push("1.0.2".into());
                s.set_key("channel", "beta")
            })
            .unwrap();
        store.persist().await.unwrap();

        let other = SettingsStore::load(&path).await.unwrap();
        assert_eq!(other.get().channel, Channel::Beta);
        assert!(other.get().is_skipped("1.0.2"));

        std::fs::write(&path, "channel = \"dev\"\n").unwrap();
        store.reload().await.unwrap();
        assert_eq!(store.get().channel, Channel::Dev);
        assert!(store.get().skip_versions.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.toml");
        std::fs::write(&path, "check_interval_hours = 500\n").unwrap();
        assert!(matches!(SettingsStore::load(&path).await, Err(UpdateError::Config { .. })));

        std::fs::write(&path, "channel = [").unwrap();
        assert!(matches!(SettingsStore::load(&path).await, Err(UpdateError::Parse { .. })));
    }

    #[test]
    fn test_update_rolls_back_invalid_change() {
        let mut store = SettingsStore::new("unused.toml", UpdateSettings::default());
        let result = store.update(|s| {
            s.check_interval_hours = 0;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.get().check_interval_hours, 24);
    }
}
