//! Checksum verification for downloaded artifacts.
//!
//! SHA-256 is authoritative: a mismatch is an [`UpdateError::Integrity`]
//! failure. MD5 is a secondary sanity check; when SHA-256 matches but MD5
//! does not, the mismatch is logged and reported but does not block the
//! install.

use md5::Md5;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::UpdateError;
use crate::update::manifest::Checksums;

const READ_BUFFER: usize = 64 * 1024;

/// Digests of a file, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub sha256: String,
    pub md5: String,
    pub size: u64,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub sha256: String,
    /// `Some(false)` when the manifest's MD5 disagreed with the file.
    pub md5_matched: Option<bool>,
}

/// Stateless checksum helpers.
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Hash `bytes` with SHA-256.
    #[must_use]
    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[must_use]
    pub fn md5_hex(bytes: &[u8]) -> String {
        hex::encode(Md5::digest(bytes))
    }

    /// Stream `path` through SHA-256 and MD5 on the blocking pool.
    pub async fn compute(path: &Path) -> Result<FileDigests, UpdateError> {
        let owned: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::compute_blocking(&owned))
            .await
            .map_err(|e| UpdateError::io("hashing", path, std::io::Error::other(e)))?
    }

    fn compute_blocking(path: &Path) -> Result<FileDigests, UpdateError> {
        debug!("Computing checksums for {}", path.display());
        let mut file =
            std::fs::File::open(path).map_err(|e| UpdateError::io("opening", path, e))?;

        let mut sha256 = Sha256::new();
        let mut md5 = Md5::new();
        let mut buffer = vec![0u8; READ_BUFFER];
        let mut size = 0u64;

        loop {
            let read = file.read(&mut buffer).map_err(|e| UpdateError::io("reading", path, e))?;
            if read == 0 {
                break;
            }
            sha256.update(&buffer[..read]);
            md5.update(&buffer[..read]);
            size += read as u64;
        }

        Ok(FileDigests {
            sha256: hex::encode(sha256.finalize()),
            md5: hex::encode(md5.finalize()),
            size,
        })
    }

    /// Verify `path` against the manifest's checksum map.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Integrity`] when the SHA-256 digest differs or the
    /// manifest carries no SHA-256 digest at all.
    pub async fn verify(path: &Path, expected: &Checksums) -> Result<VerificationReport, UpdateError> {
        info!("Verifying checksum for: {}", path.display());
        let digests = Self::compute(path).await?;

        let Some(expected_sha256) = expected.sha256() else {
            return Err(UpdateError::Integrity {
                algorithm: "sha256".into(),
                expected: "<missing>".into(),
                actual: digests.sha256,
            });
        };
        if !digests.sha256.eq_ignore_ascii_case(expected_sha256) {
            return Err(UpdateError::Integrity {
                algorithm: "sha256".into(),
                expected: expected_sha256.to_string(),
                actual: digests.sha256,
            });
        }

        let md5_matched = expected.md5().map(|expected_md5| {
            let matched = digests.md5.eq_ignore_ascii_case(expected_md5);
            if !matched {
                warn!(
                    expected = expected_md5,
                    actual = %digests.md5,
                    "MD5 mismatch on {} (SHA-256 verified, continuing)",
                    path.display()
                );
            }
            matched
        });

        info!("Checksum verification successful");
        Ok(VerificationReport {
            sha256: digests.sha256,
            md5_matched,
        })
    }
}
