//! Configuration and on-disk state layout.
//!
//! # Data Directory
//!
//! All persisted state lives under one directory, `$PFUPDATE_HOME` when set
//! and the platform's local data directory (`pfupdate/`) otherwise:
//!
//! ```text
//! <data dir>/
//! ├── settings.toml        # update policy (see [`UpdateSettings`])
//! ├── version_cache.json   # last manifest per channel
//! ├── update.lock          # install/rollback lock
//! ├── downloads/           # artifacts and resumable .part files
//! └── backups/             # install snapshots + backups.json
//! ```

pub mod settings;

pub use settings::{Deferral, SettingsStore, UpdateSettings};

use std::path::{Path, PathBuf};

use crate::core::UpdateError;

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "PFUPDATE_HOME";

/// Paths of everything persisted by the update engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the data directory: explicit override, then `$PFUPDATE_HOME`,
    /// then the platform default.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self, UpdateError> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Ok(root) = std::env::var(HOME_ENV)
            && !root.trim().is_empty()
        {
            return Ok(Self::new(root));
        }
        let base = dirs::data_local_dir().ok_or_else(|| UpdateError::Config {
            message: format!("Unable to determine local data directory; set {HOME_ENV}"),
        })?;
        Ok(Self::new(base.join("pfupdate")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn version_cache_path(&self) -> PathBuf {
        self.root.join("version_cache.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("update.lock")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }
}

/// Directory of the running executable, the default install directory.
pub fn default_install_dir() -> Result<PathBuf, UpdateError> {
    let exe = std::env::current_exe()
        .map_err(|e| UpdateError::io("locating", "current executable", e))?;
    exe.parent().map(Path::to_path_buf).ok_or_else(|| UpdateError::Config {
        message: format!("executable {} has no parent directory", exe.display()),
    })
}
