//! pfupdate - self-update engine for the Personal Finance Dashboard
//!
//! Keeps an installed desktop application current on a release channel
//! (`stable`, `beta`, `dev`): it discovers newer versions from per-channel
//! manifests, downloads artifacts with resume and checksum verification,
//! installs them by staging and swapping the install directory, and rolls
//! back automatically from a backup when anything goes wrong.
//!
//! # Modules
//!
//! - [`update`] - Manifest client, failover, downloader, installer and the
//!   [`UpdateManager`](update::UpdateManager) session state machine
//! - [`config`] - Data directory layout and persisted update settings
//! - [`core`] - Error taxonomy and release channels
//! - [`cli`] - The `pfupdate` command-line interface
//! - [`utils`] - Atomic file operations and progress bars
//!
//! # Example
//!
//! ```rust,no_run
//! use pfupdate::config::{DataDir, SettingsStore};
//! use pfupdate::update::{CheckTrigger, HttpTransport, InstallRequest, SessionState, UpdateManager};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let settings = SettingsStore::load(data_dir.settings_path()).await?;
//! let transport = Arc::new(HttpTransport::new()?);
//! let manager = Arc::new(UpdateManager::new(&data_dir, settings, "/opt/pfd", transport));
//!
//! let session = manager.check(CheckTrigger::Manual).await?;
//! if session.state == SessionState::UpdateAvailable {
//!     let session = manager.download().await?;
//!     if session.state == SessionState::Verifying {
//!         manager.install(InstallRequest::default()).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod update;
pub mod utils;

// test_utils module is available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
