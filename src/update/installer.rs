//! Applying a verified artifact to the install directory, with rollback.
//!
//! # Install Sequence
//!
//! 1. **Platform check**: `system_requirements` must match the running OS and
//!    architecture. Nothing is touched on mismatch.
//! 2. **Backup**: the install directory is copied to `backups/<id>/`.
//! 3. **Stage**: the install directory is copied to a hidden sibling
//!    (`.app.staging-<id>`) and the artifact is applied on top of it. A `.zip`
//!    artifact is extracted; any other artifact is placed as a single file.
//! 4. **Swap**: two renames move the live directory aside (`.app.old-<id>`)
//!    and the staged one into place.
//! 5. **Verify**: every file the artifact delivered must exist with the
//!    expected size.
//!
//! Any failure in steps 3–5 restores the backup automatically and surfaces
//! as [`UpdateError::FileSystem`] carrying the [`RollbackResult`].
//!
//! Install and rollback both hold the cross-process [`InstallLock`].

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{RollbackResult, UpdateError};
use crate::update::backup::{BackupManager, BackupRecord};
use crate::update::downloader::VerifiedArtifact;
use crate::update::lock::InstallLock;
use crate::update::manifest::VersionManifest;
use crate::update::version_check::{InstalledVersion, LocalVersion};
use crate::utils::fs::{copy_dir, list_files, remove_dir_if_exists, sibling_path};

/// Renames are retried this many times; Windows reports transient sharing
/// violations while the app or a scanner still holds a file.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Operating system and CPU architecture, normalised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// The platform this binary runs on.
    pub fn current() -> Self {
        Self {
            os: normalize_os(std::env::consts::OS),
            arch: normalize_arch(std::env::consts::ARCH),
        }
    }

    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: normalize_os(os),
            arch: normalize_arch(arch),
        }
    }

    /// Check the manifest's `system_requirements` against this platform.
    ///
    /// Missing requirements, and the wildcards `any`/`all`/`*`, match everything.
    pub fn check(&self, manifest: &VersionManifest) -> Result<(), UpdateError> {
        let requirements = &manifest.system_requirements;

        if let Some(os) = requirements.get("os").filter(|v| !is_wildcard(v)) {
            let wanted = normalize_os(os);
            if wanted != self.os {
                return Err(UpdateError::IncompatibleArtifact {
                    reason: format!("artifact requires {os}, running on {}", self.os),
                });
            }
        }

        let arch = requirements.get("architecture").or_else(|| requirements.get("arch"));
        if let Some(arch) = arch.filter(|v| !is_wildcard(v)) {
            let wanted = normalize_arch(arch);
            if wanted != self.arch {
                return Err(UpdateError::IncompatibleArtifact {
                    reason: format!("artifact requires {arch}, running on {}", self.arch),
                });
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

fn is_wildcard(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "" | "any" | "all" | "*" | "universal")
}

/// `"Windows 10 or later"` → `windows`, `"macOS 12+"` → `macos`.
fn normalize_os(value: &str) -> String {
    let lower = value.trim().to_ascii_lowercase();
    if lower.contains("windows") || lower.starts_with("win") {
        "windows".to_string()
    } else if lower.contains("mac") || lower.contains("darwin") || lower.contains("osx") {
        "macos".to_string()
    } else if lower.contains("linux") {
        "linux".to_string()
    } else {
        lower
    }
}

/// `x64`/`amd64` → `x86_64`, `arm64` → `aarch64`.
fn normalize_arch(value: &str) -> String {
    let lower = value.trim().to_ascii_lowercase();
    match lower.as_str() {
        "x64" | "amd64" | "x86_64" | "x86-64" | "64-bit" => "x86_64".to_string(),
        "arm64" | "aarch64" => "aarch64".to_string(),
        "x86" | "i386" | "i686" | "ia32" | "32-bit" => "x86".to_string(),
        _ => lower,
    }
}

/// Caller choices for one install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOptions {
    /// Take a backup first. Turning this off also disables automatic rollback.
    pub create_backup: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self { create_backup: true }
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResult {
    pub version: String,
    pub build_number: u64,
    pub backup_id: Option<String>,
    pub backup_skipped: bool,
    /// Files delivered by the artifact.
    pub installed_files: usize,
}

/// Steps at which tests can force an install to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallFailpoint {
    /// While applying the artifact to the staging directory.
    Stage,
    /// Between moving the live directory aside and moving staging in.
    Swap,
    /// Post-install file verification.
    Verify,
    /// While swapping a backup back in.
    Restore,
}

/// Mutates the install directory. One instance per install directory.
pub struct Installer {
    install_dir: PathBuf,
    backups: BackupManager,
    lock_path: PathBuf,
    platform: Platform,
    #[cfg(any(test, feature = "test-utils"))]
    failpoints: std::sync::Mutex<std::collections::HashSet<InstallFailpoint>>,
}

impl Installer {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        backups: BackupManager,
        lock_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            backups,
            lock_path: lock_path.into(),
            platform: Platform::current(),
            #[cfg(any(test, feature = "test-utils"))]
            failpoints: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Override the detected platform.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Arm a failpoint for subsequent installs.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn arm_failpoint(&self, point: InstallFailpoint) {
        if let Ok(mut points) = self.failpoints.lock() {
            points.insert(point);
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn disarm_failpoints(&self) {
        if let Ok(mut points) = self.failpoints.lock() {
            points.clear();
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    fn trip(&self, point: InstallFailpoint) -> io::Result<()> {
        let armed = self.failpoints.lock().is_ok_and(|points| points.contains(&point));
        if armed {
            return Err(io::Error::other(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "test-utils")))]
    #[allow(clippy::unused_self)]
    fn trip(&self, _point: InstallFailpoint) -> io::Result<()> {
        Ok(())
    }

    /// Version recorded in the install directory, if any.
    pub async fn installed_version(&self) -> Option<InstalledVersion> {
        InstalledVersion::load(&self.install_dir).await
    }

    /// Install `artifact` over the current install.
    ///
    /// `current` describes the version being replaced and is recorded on the
    /// backup.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::IncompatibleArtifact`] before anything is touched
    /// - [`UpdateError::Backup`] before anything is touched
    /// - [`UpdateError::FileSystem`] after staging began; carries the rollback outcome
    pub async fn install(
        &self,
        artifact: &VerifiedArtifact,
        current: &LocalVersion,
        options: InstallOptions,
    ) -> Result<InstallResult, UpdateError> {
        let manifest = &artifact.manifest;
        self.platform.check(manifest)?;

        let _lock = InstallLock::acquire(&self.lock_path).await?;

        let backup = if options.create_backup {
            Some(self.backups.create(&self.install_dir, current).await?)
        } else {
            warn!(version = %manifest.version, "Installing without a backup");
            None
        };

        info!(
            from = %current.version,
            to = %manifest.version,
            backup_id = backup.as_ref().map_or("none", |b| b.backup_id.as_str()),
            "Installing update"
        );

        match self.replace(artifact).await {
            Ok(installed_files) => {
                info!(version = %manifest.version, "Update installed successfully");
                Ok(InstallResult {
                    version: manifest.version.clone(),
                    build_number: manifest.build_number,
                    backup_id: backup.map(|b| b.backup_id),
                    backup_skipped: !options.create_backup,
                    installed_files,
                })
            }
            Err((operation, e)) => {
                warn!("Install of {} failed during {}: {}", manifest.version, operation, e);
                let rollback = match &backup {
                    Some(record) => Some(self.auto_rollback(record, manifest).await),
                    None => None,
                };
                Err(UpdateError::FileSystem {
                    operation: operation.to_string(),
                    reason: e.to_string(),
                    rollback,
                })
            }
        }
    }

    async fn auto_rollback(
        &self,
        record: &BackupRecord,
        manifest: &VersionManifest,
    ) -> RollbackResult {
        match self.restore(record).await {
            Ok(result) => {
                info!(
                    backup_id = %record.backup_id,
                    "Automatic rollback restored {}",
                    record.source_version
                );
                result
            }
            Err(e) => {
                error!(
                    backup_id = %record.backup_id,
                    attempted_version = %manifest.version,
                    backup_dir = %self.backups.backup_dir(&record.backup_id).display(),
                    "Automatic rollback failed, manual recovery from backup required: {}",
                    e
                );
                RollbackResult {
                    backup_id: record.backup_id.clone(),
                    success: false,
                    restored_version: record.source_version.clone(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Stage, swap and verify. Errors carry the failing step name.
    async fn replace(
        &self,
        artifact: &VerifiedArtifact,
    ) -> Result<usize, (&'static str, io::Error)> {
        let tag = Uuid::new_v4().simple().to_string();
        let staging = sibling_path(&self.install_dir, &format!("staging-{}", &tag[..8]));
        let old = sibling_path(&self.install_dir, &format!("old-{}", &tag[..8]));

        let delivered = match self.stage(artifact, &staging).await {
            Ok(delivered) => delivered,
            Err(e) => {
                let _ = remove_dir_if_exists(&staging);
                return Err(("staging", e));
            }
        };

        if let Err(e) = self.swap_in(&staging, &old).await {
            let _ = remove_dir_if_exists(&staging);
            return Err(("swap", e));
        }

        let verified = self.trip(InstallFailpoint::Verify).and_then(|()| {
            for (relative, size) in &delivered {
                let path = self.install_dir.join(relative);
                let actual = std::fs::metadata(&path)?.len();
                if actual != *size {
                    return Err(io::Error::other(format!(
                        "{} has {actual} bytes, expected {size}",
                        relative.display()
                    )));
                }
            }
            Ok(())
        });
        if let Err(e) = verified {
            let _ = remove_dir_if_exists(&old);
            return Err(("verification", e));
        }

        if let Err(e) = remove_dir_if_exists(&old) {
            warn!("Failed to remove previous install at {}: {}", old.display(), e);
        }
        Ok(delivered.len())
    }

    /// Build the new install in `staging`, returning the files the artifact
    /// delivered with their sizes.
    async fn stage(
        &self,
        artifact: &VerifiedArtifact,
        staging: &Path,
    ) -> io::Result<Vec<(PathBuf, u64)>> {
        debug!("Staging update in {}", staging.display());
        let install_dir = self.install_dir.clone();
        let staging_dir = staging.to_path_buf();
        let artifact_path = artifact.path.clone();
        let marker = InstalledVersion::from_manifest(&artifact.manifest);
        let fail = self.trip(InstallFailpoint::Stage);

        tokio::task::spawn_blocking(move || -> io::Result<Vec<(PathBuf, u64)>> {
            remove_dir_if_exists(&staging_dir)?;
            copy_dir(&install_dir, &staging_dir)?;
            fail?;

            let delivered = if is_zip(&artifact_path) {
                extract_zip(&artifact_path, &staging_dir)?
            } else {
                place_file(&artifact_path, &staging_dir)?
            };

            marker
                .write_to(&staging_dir)
                .map_err(|e| io::Error::other(e.to_string()))?;
            Ok(delivered)
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Move the live directory to `old` and `staging` into its place.
    ///
    /// If the second rename fails the live directory is moved back.
    async fn swap_in(&self, staging: &Path, old: &Path) -> io::Result<()> {
        let live_exists = self.install_dir.exists();
        if live_exists {
            rename_with_retry(&self.install_dir, old).await?;
        }

        let second = match self.trip(InstallFailpoint::Swap) {
            Ok(()) => rename_with_retry(staging, &self.install_dir).await,
            Err(e) => Err(e),
        };

        if let Err(e) = second {
            if live_exists && !self.install_dir.exists() {
                if let Err(restore) = rename_with_retry(old, &self.install_dir).await {
                    warn!("Could not move previous install back into place: {}", restore);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Restore `backup_id` into the install directory.
    ///
    /// Idempotent: when the install directory already matches the backup the
    /// call succeeds without touching anything.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::BackupNotFound`] for an unknown or deleted backup
    /// - [`UpdateError::FileSystem`] if the restore swap fails
    pub async fn rollback(&self, backup_id: &str) -> Result<RollbackResult, UpdateError> {
        let record = self.backups.get(backup_id).await?;
        let _lock = InstallLock::acquire(&self.lock_path).await?;
        self.restore(&record).await
    }

    /// Restore without taking the lock; callers hold it.
    async fn restore(&self, record: &BackupRecord) -> Result<RollbackResult, UpdateError> {
        let source = self.backups.backup_dir(&record.backup_id);
        if !source.is_dir() {
            return Err(UpdateError::BackupNotFound {
                backup_id: record.backup_id.clone(),
            });
        }

        let result = RollbackResult {
            backup_id: record.backup_id.clone(),
            success: true,
            restored_version: record.source_version.clone(),
            error: None,
        };

        let (a, b) = (source.clone(), self.install_dir.clone());
        let already_restored = tokio::task::spawn_blocking(move || trees_match(&a, &b))
            .await
            .map_err(|e| io::Error::other(e.to_string()))
            .and_then(|r| r)
            .unwrap_or(false);
        if already_restored {
            debug!(backup_id = %record.backup_id, "Install already matches backup");
            return Ok(result);
        }

        warn!(backup_id = %record.backup_id, "Restoring {} from backup", record.source_version);

        let tag = Uuid::new_v4().simple().to_string();
        let staging = sibling_path(&self.install_dir, &format!("restore-{}", &tag[..8]));
        let old = sibling_path(&self.install_dir, &format!("old-{}", &tag[..8]));

        let fs_error = |operation: &str, e: io::Error| UpdateError::FileSystem {
            operation: operation.to_string(),
            reason: e.to_string(),
            rollback: None,
        };

        let (src, dst) = (source.clone(), staging.clone());
        let copied = tokio::task::spawn_blocking(move || {
            remove_dir_if_exists(&dst)?;
            copy_dir(&src, &dst)
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))
        .and_then(|r| r);
        if let Err(e) = copied {
            let _ = remove_dir_if_exists(&staging);
            return Err(fs_error("restore staging", e));
        }

        let swapped = match self.trip(InstallFailpoint::Restore) {
            Ok(()) => self.swap_in(&staging, &old).await,
            Err(e) => Err(e),
        };
        if let Err(e) = swapped {
            let _ = remove_dir_if_exists(&staging);
            return Err(fs_error("restore swap", e));
        }

        if let Err(e) = remove_dir_if_exists(&old) {
            warn!("Failed to remove replaced install at {}: {}", old.display(), e);
        }
        info!(backup_id = %record.backup_id, "Restored version {}", record.source_version);
        Ok(result)
    }
}

async fn rename_with_retry(from: &Path, to: &Path) -> io::Result<()> {
    let mut attempts = 0;
    loop {
        match tokio::fs::rename(from, to).await {
            Ok(()) => return Ok(()),
            Err(e) if attempts < MAX_ATTEMPTS - 1 && e.kind() != io::ErrorKind::NotFound => {
                warn!("Rename attempt {} failed: {}. Retrying...", attempts + 1, e);
                tokio::time::sleep(RETRY_DELAY).await;
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Copy a single-file artifact into `staging` under its own name.
fn place_file(artifact: &Path, staging: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let name = artifact
        .file_name()
        .ok_or_else(|| io::Error::other(format!("artifact {} has no file name", artifact.display())))?;
    let size = std::fs::copy(artifact, staging.join(name))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(staging.join(name), std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(vec![(PathBuf::from(name), size)])
}

/// Extract a zip archive over `staging`. Entries escaping the directory are rejected.
fn extract_zip(artifact: &Path, staging: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let file = std::fs::File::open(artifact)?;
    let mut archive = zip::ZipArchive::new(file).map_err(io::Error::other)?;
    let mut delivered = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(io::Error::other)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(io::Error::other(format!("unsafe path in archive: {}", entry.name())));
        };
        let target = staging.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        let size = io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }

        delivered.push((relative, size));
    }

    Ok(delivered)
}

/// Same relative files with identical contents.
fn trees_match(a: &Path, b: &Path) -> io::Result<bool> {
    if !b.is_dir() {
        return Ok(false);
    }
    let (left, right) = (list_files(a)?, list_files(b)?);
    if left != right {
        return Ok(false);
    }
    for (relative, _) in &left {
        if std::fs::read(a.join(relative))? != std::fs::read(b.join(relative))? {
            return Ok(false);
        }
    }
    Ok(true)
}
