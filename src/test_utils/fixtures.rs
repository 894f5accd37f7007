//! Manifest and payload fixtures.

use std::collections::BTreeMap;

use crate::core::Channel;
use crate::update::manifest::{ChangelogEntry, Checksums, VersionManifest};
use crate::update::verification::ChecksumVerifier;
use crate::update::version_check::default_build_number;

/// Base URL artifacts are published under in fixtures.
pub const ARTIFACT_BASE: &str = "https://updates.example.com";

/// A valid manifest describing `body` as the artifact for `version`.
pub fn manifest(version: &str, channel: Channel, body: &[u8]) -> VersionManifest {
    VersionManifest {
        version: version.to_string(),
        build_number: default_build_number(version),
        channel,
        release_date: None,
        download_url: format!("{ARTIFACT_BASE}/{channel}/PersonalFinanceDashboard-{version}.zip"),
        download_size: body.len() as u64,
        checksum: Checksums::new([
            ("sha256".to_string(), ChecksumVerifier::sha256_hex(body)),
            ("md5".to_string(), ChecksumVerifier::md5_hex(body)),
        ]),
        required: false,
        changelog: vec![ChangelogEntry {
            kind: "feature".to_string(),
            description: format!("Release {version}"),
        }],
        system_requirements: BTreeMap::new(),
        update_notes: String::new(),
        rollback_supported: true,
        auto_update_eligible: false,
    }
}

/// Manifest as served by an update endpoint.
pub fn manifest_json(manifest: &VersionManifest) -> Vec<u8> {
    serde_json::to_vec_pretty(manifest).unwrap_or_default()
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A zip archive holding `files` as `(relative path, contents)` pairs.
pub fn zip_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in files {
        if writer.start_file(*name, SimpleFileOptions::default()).is_err()
            || writer.write_all(contents).is_err()
        {
            return Vec::new();
        }
    }
    writer.finish().map(std::io::Cursor::into_inner).unwrap_or_default()
}
