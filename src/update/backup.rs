//! Snapshots of the installed application taken before an update.
//!
//! Each backup is a full copy of the install directory under
//! `backups/<backup_id>/`, described by an entry in `backups/backups.json`.
//! Backups are never modified after creation; [`BackupManager::prune`] and
//! [`BackupManager::delete`] are explicit maintenance operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::UpdateError;
use crate::update::version_check::LocalVersion;
use crate::utils::fs::{copy_dir, list_files, remove_dir_if_exists};
use crate::utils::atomic_write;

const INDEX_FILE: &str = "backups.json";

/// Metadata for one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub source_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_build: Option<u64>,
    /// Number of files captured.
    #[serde(default)]
    pub files: usize,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupIndex {
    #[serde(default)]
    backups: Vec<BackupRecord>,
}

/// Creates, lists and prunes backups under one directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the files of `backup_id`.
    pub fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.root.join(backup_id)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    async fn load_index(&self) -> Result<BackupIndex, UpdateError> {
        let path = self.index_path();
        match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)
                .map_err(|e| UpdateError::parse(format!("backup index {}", path.display()), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackupIndex::default()),
            Err(e) => Err(UpdateError::io("reading", &path, e)),
        }
    }

    async fn save_index(&self, index: &BackupIndex) -> Result<(), UpdateError> {
        let path = self.index_path();
        let content =
            serde_json::to_vec_pretty(index).map_err(|e| UpdateError::parse("backup index", e))?;
        atomic_write(&path, &content).map_err(|e| UpdateError::io("writing", &path, e))
    }

    /// All backups, newest first.
    pub async fn list(&self) -> Result<Vec<BackupRecord>, UpdateError> {
        let mut backups = self.load_index().await?.backups;
        backups.sort_by(|a, b| {
            b.created_at.cmp(&a.created_at).then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(backups)
    }

    pub async fn latest(&self) -> Result<Option<BackupRecord>, UpdateError> {
        Ok(self.list().await?.into_iter().next())
    }

    /// Look up a backup whose files are still on disk.
    pub async fn get(&self, backup_id: &str) -> Result<BackupRecord, UpdateError> {
        let record = self
            .load_index()
            .await?
            .backups
            .into_iter()
            .find(|b| b.backup_id == backup_id);

        match record {
            Some(record) if self.backup_dir(backup_id).is_dir() => Ok(record),
            _ => Err(UpdateError::BackupNotFound {
                backup_id: backup_id.to_string(),
            }),
        }
    }

    /// Copy `install_dir` into a new backup tagged with `source`.
    ///
    /// Files are copied into a temporary directory and renamed into place,
    /// so a failed backup leaves nothing behind.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Backup`] on any failure. The install directory is only read.
    pub async fn create(
        &self,
        install_dir: &Path,
        source: &LocalVersion,
    ) -> Result<BackupRecord, UpdateError> {
        if !install_dir.is_dir() {
            return Err(UpdateError::Backup {
                reason: format!("install directory {} does not exist", install_dir.display()),
            });
        }

        let created_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let backup_id = format!(
            "{}-{}-{}",
            created_at.format("%Y%m%d%H%M%S"),
            sanitize(&source.version),
            &suffix[..8]
        );
        let target = self.backup_dir(&backup_id);
        let temp = self.root.join(format!(".{backup_id}.tmp"));

        info!(backup_id = %backup_id, version = %source.version, "Creating backup of {}", install_dir.display());

        let src = install_dir.to_path_buf();
        let (temp_copy, target_copy) = (temp.clone(), target.clone());
        let copied = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            copy_dir(&src, &temp_copy)?;
            std::fs::rename(&temp_copy, &target_copy)?;
            Ok(list_files(&target_copy)?.len())
        })
        .await
        .map_err(|e| UpdateError::Backup { reason: e.to_string() })?;

        let files = match copied {
            Ok(files) => files,
            Err(e) => {
                let _ = remove_dir_if_exists(&temp);
                let _ = remove_dir_if_exists(&target);
                return Err(UpdateError::Backup {
                    reason: format!("copying {}: {e}", install_dir.display()),
                });
            }
        };

        let record = BackupRecord {
            backup_id: backup_id.clone(),
            created_at,
            source_version: source.version.clone(),
            source_build: source.build_number,
            files,
            size_bytes: crate::utils::fs::dir_size(&target).unwrap_or(0),
        };

        let mut index = self.load_index().await.map_err(|e| UpdateError::Backup {
            reason: e.to_string(),
        })?;
        index.backups.push(record.clone());
        if let Err(e) = self.save_index(&index).await {
            let _ = remove_dir_if_exists(&target);
            return Err(UpdateError::Backup { reason: e.to_string() });
        }

        info!(backup_id = %backup_id, files, "Backup created successfully");
        Ok(record)
    }

    /// Remove one backup and its index entry.
    pub async fn delete(&self, backup_id: &str) -> Result<(), UpdateError> {
        let mut index = self.load_index().await?;
        let before = index.backups.len();
        index.backups.retain(|b| b.backup_id != backup_id);
        if index.backups.len() == before {
            return Err(UpdateError::BackupNotFound {
                backup_id: backup_id.to_string(),
            });
        }

        let dir = self.backup_dir(backup_id);
        remove_dir_if_exists(&dir).map_err(|e| UpdateError::io("removing", &dir, e))?;
        self.save_index(&index).await?;
        debug!(backup_id, "Deleted backup");
        Ok(())
    }

    /// Keep the `keep` newest backups and delete the rest.
    ///
    /// Returns the ids that were removed.
    pub async fn prune(&self, keep: usize) -> Result<Vec<String>, UpdateError> {
        let backups = self.list().await?;
        let mut removed = Vec::new();
        for record in backups.into_iter().skip(keep) {
            match self.delete(&record.backup_id).await {
                Ok(()) => removed.push(record.backup_id),
                Err(e) => warn!("Failed to prune backup {}: {}", record.backup_id, e),
            }
        }
        if !removed.is_empty() {
            info!("Pruned {} old backup(s)", removed.len());
        }
        Ok(removed)
    }
}

fn sanitize(version: &str) -> String {
    version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn install_tree(root: &Path) -> PathBuf {
        let install = root.join("app");
        fs::create_dir_all(install.join("data")).unwrap();
        fs::write(install.join("app.exe"), b"v1 binary").unwrap();
        fs::write(install.join("data/config.json"), b"{}").unwrap();
        install
    }

    #[tokio::test]
    async fn test_create_backup() {
        let temp = TempDir::new().unwrap();
        let install = install_tree(temp.path());
        let manager = BackupManager::new(temp.path().join("backups"));

        let record =
            manager.create(&install, &LocalVersion::new("1.0.0").with_build(10000)).await.unwrap();

        assert_eq!(record.source_version, "1.0.0");
        assert_eq!(record.source_build, Some(10000));
        assert_eq!(record.files, 2);
        let dir = manager.backup_dir(&record.backup_id);
        assert_eq!(fs::read(dir.join("app.exe")).unwrap(), b"v1 binary");
        assert_eq!(manager.get(&record.backup_id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_missing_install_dir_is_backup_error() {
        let temp = TempDir::new().unwrap();
        let manager = BackupManager::new(temp.path().join("backups"));

        let err = manager
            .create(&temp.path().join("missing"), &LocalVersion::new("1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Backup { .. }));
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_backup_not_found() {
        let temp = TempDir::new().unwrap();
        let manager = BackupManager::new(temp.path().join("backups"));
        let err = manager.get("nope").await.unwrap_err();
        assert!(matches!(err, UpdateError::BackupNotFound { .. }));
        let err = manager.delete("nope").await.unwrap_err();
        assert!(matches!(err, UpdateError::BackupNotFound { .. }));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let install = install_tree(temp.path());
        let manager = BackupManager::new(temp.path().join("backups"));

        let mut ids = Vec::new();
        for version in ["1.0.0", "1.0.1", "1.0.2"] {
            ids.push(manager.create(&install, &LocalVersion::new(version)).await.unwrap().backup_id);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let removed = manager.prune(2).await.unwrap();
        assert_eq!(removed, vec![ids[0].clone()]);

        let remaining: Vec<_> =
            manager.list().await.unwrap().into_iter().map(|b| b.backup_id).collect();
        assert_eq!(remaining, vec![ids[2].clone(), ids[1].clone()]);
        assert!(!manager.backup_dir(&ids[0]).exists());
        assert_eq!(manager.latest().await.unwrap().unwrap().backup_id, ids[2]);
    }
}
