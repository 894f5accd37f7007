//! The self-update engine.
//!
//! # Components
//!
//! - [`client`]: fetches and validates per-channel version manifests
//! - [`failover`]: picks a healthy update endpoint and fails over between them
//! - [`downloader`]: resumable artifact downloads with checksum verification
//! - [`installer`]: backup, stage-then-swap install and automatic rollback
//! - [`manager`]: the update session state machine tying them together
//!
//! # Flow
//!
//! ```text
//! Idle ─check─▶ Checking ─▶ UpdateAvailable ─download─▶ Downloading ─▶ Verifying
//!                  │                │                                    │
//!                  ▼                ▼                                 install
//!                Failed            Idle                                   ▼
//!                  │                                                 Installing
//!                  ▼                                                  │      │
//!              RolledBack ◀─────────── automatic rollback ────────────┘      ▼
//!                                                                       Succeeded
//! ```
//!
//! Network access goes through the [`transport::Transport`] trait and all
//! on-disk state lives under a [`crate::config::DataDir`].

pub mod backup;
pub mod client;
pub mod downloader;
pub mod failover;
pub mod installer;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod session;
pub mod transport;
pub mod verification;
pub mod version_check;

pub use backup::{BackupManager, BackupRecord};
pub use client::ManifestClient;
pub use downloader::{CancelFlag, Downloader, VerifiedArtifact};
pub use failover::{
    DownloadSource, Endpoint, EndpointHealth, EndpointSummary, FailoverEvent, FailoverPolicy,
    FailoverSelector, RequestStats,
};
pub use installer::{InstallOptions, InstallResult, Installer, Platform};
pub use manager::{InstallRequest, UpdateManager};
pub use manifest::{ChangelogEntry, Checksums, VersionManifest};
pub use session::{
    CheckTrigger, DownloadProgress, SessionError, SessionEvent, SessionState, UpdateSession,
};
pub use transport::{HttpTransport, Transport};
pub use version_check::{InstalledVersion, LocalVersion, VersionOrdering};
