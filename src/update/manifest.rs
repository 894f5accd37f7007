//! Version manifest schema and strict parsing.
//!
//! A manifest describes the latest build published on one [`Channel`]. The
//! wire format is loose JSON produced by release tooling; it is validated
//! once, here, into a [`VersionManifest`]. Nothing downstream ever sees a
//! partially-typed manifest.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "version": "1.0.1",
//!   "build_number": 10001,
//!   "release_date": "2024-03-01T10:00:00+00:00",
//!   "channel": "stable",
//!   "required": false,
//!   "download_url": "https://updates.example.com/stable/PersonalFinanceDashboard-1.0.1.exe",
//!   "download_size": 73400320,
//!   "checksum": { "sha256": "…", "md5": "…" },
//!   "changelog": [{ "type": "feature", "description": "Budget export" }],
//!   "system_requirements": { "os": "Windows 10 or later", "architecture": "x64" },
//!   "update_notes": "",
//!   "rollback_supported": true,
//!   "auto_update_eligible": true
//! }
//! ```
//!
//! Missing optional fields take safe defaults: `required = false`, empty
//! changelog, `rollback_supported = true`, `auto_update_eligible = false`,
//! and a build number derived from the version. `version`, `download_url`,
//! `download_size` and `checksum.sha256` are mandatory.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{Channel, UpdateError};
use crate::update::version_check::{default_build_number, parse_version};

/// One changelog line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// Category such as `feature`, `improvement` or `bugfix`.
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

/// Digest map keyed by lowercase algorithm name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksums(BTreeMap<String, String>);

impl Checksums {
    pub fn new(digests: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(
            digests
                .into_iter()
                .map(|(algo, digest)| (algo.to_ascii_lowercase(), digest.trim().to_ascii_lowercase()))
                .collect(),
        )
    }

    /// Authoritative SHA-256 digest (hex).
    #[must_use]
    pub fn sha256(&self) -> Option<&str> {
        self.0.get("sha256").map(String::as_str)
    }

    /// Secondary MD5 digest (hex), if published.
    #[must_use]
    pub fn md5(&self) -> Option<&str> {
        self.0.get("md5").map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Latest available build for one channel. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawManifest")]
pub struct VersionManifest {
    pub version: String,
    pub build_number: u64,
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<DateTime<Utc>>,
    pub download_url: String,
    pub download_size: u64,
    pub checksum: Checksums,
    pub required: bool,
    pub changelog: Vec<ChangelogEntry>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub system_requirements: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub update_notes: String,
    pub rollback_supported: bool,
    pub auto_update_eligible: bool,
}

impl VersionManifest {
    /// Parse and validate a manifest fetched for `channel`.
    ///
    /// A manifest without a `channel` field is attributed to the requested
    /// channel; one that names a different channel is rejected.
    pub fn parse(bytes: &[u8], channel: Channel) -> Result<Self, UpdateError> {
        let what = format!("manifest for channel '{channel}'");

        let mut raw: RawManifest =
            serde_json::from_slice(bytes).map_err(|e| UpdateError::parse(&what, e))?;
        if raw.channel.is_none() {
            raw.channel = Some(channel.to_string());
        }

        let manifest = Self::try_from(raw).map_err(|e| UpdateError::parse(&what, e))?;
        if manifest.channel != channel {
            return Err(UpdateError::parse(
                &what,
                format!("manifest declares channel '{}'", manifest.channel),
            ));
        }

        Ok(manifest)
    }

    /// File name of the artifact, taken from the last URL path segment.
    #[must_use]
    pub fn artifact_name(&self) -> String {
        Url::parse(&self.download_url)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .unwrap_or_else(|| format!("update-{}.bin", self.version))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawChangelog {
    Entries(Vec<ChangelogEntry>),
    Document { changes: Vec<ChangelogEntry> },
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    version: Option<String>,
    build_number: Option<u64>,
    channel: Option<String>,
    release_date: Option<String>,
    download_url: Option<String>,
    download_size: Option<u64>,
    checksum: Option<BTreeMap<String, String>>,
    required: Option<bool>,
    changelog: Option<RawChangelog>,
    system_requirements: Option<BTreeMap<String, serde_json::Value>>,
    update_notes: Option<String>,
    rollback_supported: Option<bool>,
    auto_update_eligible: Option<bool>,
}

impl TryFrom<RawManifest> for VersionManifest {
    type Error = String;

    fn try_from(raw: RawManifest) -> Result<Self, Self::Error> {
        let version = raw
            .version
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or("missing required field 'version'")?;
        if parse_version(&version).is_none() {
            return Err(format!("'{version}' is not a valid version"));
        }

        let download_url = raw.download_url.ok_or("missing required field 'download_url'")?;
        let url = Url::parse(&download_url)
            .map_err(|e| format!("download_url '{download_url}' is not an absolute URL: {e}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("download_url scheme '{}' is not supported", url.scheme()));
        }

        let download_size = raw.download_size.ok_or("missing required field 'download_size'")?;
        if download_size == 0 {
            return Err("download_size must be greater than zero".to_string());
        }

        let checksum = Checksums::new(raw.checksum.ok_or("missing required field 'checksum'")?);
        let sha256 = checksum.sha256().ok_or("checksum map has no 'sha256' digest")?;
        validate_hex("sha256", sha256, 64)?;
        if let Some(md5) = checksum.md5() {
            validate_hex("md5", md5, 32)?;
        }

        let channel_name = raw.channel.ok_or("missing required field 'channel'")?;
        let channel = channel_name.parse::<Channel>().map_err(|e| e.to_string())?;

        let release_date = raw.release_date.as_deref().map(parse_release_date).transpose()?;

        let changelog = match raw.changelog {
            Some(RawChangelog::Entries(entries)) => entries,
            Some(RawChangelog::Document { changes }) => changes,
            None => Vec::new(),
        };

        let system_requirements = raw
            .system_requirements
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();

        Ok(Self {
            build_number: raw.build_number.unwrap_or_else(|| default_build_number(&version)),
            version,
            channel,
            release_date,
            download_url,
            download_size,
            checksum,
            required: raw.required.unwrap_or(false),
            changelog,
            system_requirements,
            update_notes: raw.update_notes.unwrap_or_default(),
            rollback_supported: raw.rollback_supported.unwrap_or(true),
            auto_update_eligible: raw.auto_update_eligible.unwrap_or(false),
        })
    }
}

fn validate_hex(algorithm: &str, digest: &str, len: usize) -> Result<(), String> {
    if digest.len() != len || hex::decode(digest).is_err() {
        return Err(format!("{algorithm} digest '{digest}' is not {len} hex characters"));
    }
    Ok(())
}

/// Accepts RFC 3339, naive ISO timestamps (assumed UTC) and plain dates.
fn parse_release_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        && let Some(naive) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(naive.and_utc());
    }
    Err(format!("release_date '{value}' is not a recognised timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SHA: &str = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";

    fn full() -> serde_json::Value {
        json!({
            "version": "1.0.1",
            "build_number": 10001,
            "release_date": "2024-03-01T10:00:00+00:00",
            "channel": "stable",
            "required": false,
            "download_url": "https://cdn.example.com/stable/PersonalFinanceDashboard-1.0.1.exe",
            "download_size": 1024,
            "checksum": { "sha256": SHA, "md5": "65a8e27d8879283831b664bd8b7f0ad4" },
            "changelog": [{ "type": "feature", "description": "Budget export" }],
            "system_requirements": { "os": "Windows 10 or later", "architecture": "x64", "ram_gb": 4 },
            "update_notes": "Restart required",
            "rollback_supported": true,
            "auto_update_eligible": true
        })
    }

    #[test]
    fn test_parse_full_manifest() {
        let bytes = serde_json::to_vec(&full()).unwrap();
        let manifest = VersionManifest::parse(&bytes, Channel::Stable).unwrap();

        assert_eq!(manifest.version, "1.0.1");
        assert_eq!(manifest.build_number, 10001);
        assert_eq!(manifest.checksum.sha256(), Some(SHA));
        assert_eq!(manifest.changelog.len(), 1);
        assert_eq!(manifest.changelog[0].kind, "feature");
        assert_eq!(manifest.system_requirements["ram_gb"], "4");
        assert!(manifest.auto_update_eligible);
        assert_eq!(manifest.artifact_name(), "PersonalFinanceDashboard-1.0.1.exe");
    }

    #[test]
    fn test_round_trip_preserves_required_fields() {
        let bytes = serde_json::to_vec(&full()).unwrap();
        let manifest = VersionManifest::parse(&bytes, Channel::Stable).unwrap();

        let reserialized = serde_json::to_vec(&manifest).unwrap();
        let reparsed = VersionManifest::parse(&reserialized, Channel::Stable).unwrap();
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn test_optional_fields_take_safe_defaults() {
        let bytes = serde_json::to_vec(&json!({
            "version": "2.1.3",
            "download_url": "https://cdn.example.com/beta/app.zip",
            "download_size": 10,
            "checksum": { "SHA256": SHA.to_uppercase() }
        }))
        .unwrap();
        let manifest = VersionManifest::parse(&bytes, Channel::Beta).unwrap();

        assert_eq!(manifest.channel, Channel::Beta);
        assert_eq!(manifest.build_number, 20103);
        assert!(!manifest.required);
        assert!(manifest.changelog.is_empty());
        assert!(manifest.rollback_supported);
        assert!(!manifest.auto_update_eligible);
        assert_eq!(manifest.checksum.sha256(), Some(SHA));
        assert!(manifest.release_date.is_none());
    }

    #[test]
    fn test_missing_required_fields_fail() {
        for field in ["version", "download_url", "checksum", "download_size"] {
            let mut value = full();
            value.as_object_mut().unwrap().remove(field);
            let bytes = serde_json::to_vec(&value).unwrap();
            let err = VersionManifest::parse(&bytes, Channel::Stable).unwrap_err();
            assert!(matches!(err, UpdateError::Parse { .. }), "{field}: {err}");
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            ("download_url", json!("/relative/path.exe")),
            ("download_url", json!("ftp://cdn.example.com/a.exe")),
            ("checksum", json!({ "md5": "65a8e27d8879283831b664bd8b7f0ad4" })),
            ("checksum", json!({ "sha256": "not-hex" })),
            ("version", json!("one.two")),
            ("channel", json!("beta")),
            ("release_date", json!("yesterday")),
            ("download_size", json!(0)),
        ];
        for (field, bad) in cases {
            let mut value = full();
            value[field] = bad.clone();
            let bytes = serde_json::to_vec(&value).unwrap();
            assert!(
                VersionManifest::parse(&bytes, Channel::Stable).is_err(),
                "{field}={bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_changelog_document_form() {
        let mut value = full();
        value["changelog"] = json!({
            "version": "1.0.1",
            "date": "2024-03-01",
            "changes": [
                { "type": "improvement", "description": "Faster charts" },
                { "type": "bugfix", "description": "Budget rounding" }
            ]
        });
        let bytes = serde_json::to_vec(&value).unwrap();
        let manifest = VersionManifest::parse(&bytes, Channel::Stable).unwrap();
        assert_eq!(manifest.changelog.len(), 2);
        assert_eq!(manifest.changelog[1].kind, "bugfix");
    }

    #[test]
    fn test_release_date_formats() {
        assert!(parse_release_date("2024-03-01T10:00:00Z").is_ok());
        assert!(parse_release_date("2024-03-01T10:00:00.123456").is_ok());
        assert!(parse_release_date("2024-03-01").is_ok());
        assert!(parse_release_date("03/01/2024").is_err());
    }

    #[test]
    fn test_artifact_name_fallback() {
        let mut value = full();
        value["download_url"] = json!("https://cdn.example.com/");
        let bytes = serde_json::to_vec(&value).unwrap();
        let manifest = VersionManifest::parse(&bytes, Channel::Stable).unwrap();
        assert_eq!(manifest.artifact_name(), "update-1.0.1.bin");
    }
}
