//! Update session state and the notification payload sent to the UI.
//!
//! An [`UpdateSession`] records one check/download/install attempt. It is
//! owned by the [`UpdateManager`](crate::update::UpdateManager); everything
//! outside the manager sees clones of it or [`SessionEvent`]s.
//!
//! # State Machine
//!
//! ```text
//! Idle ─► Checking ─► UpdateAvailable ─► Downloading ─► Verifying ─► Installing ─► Succeeded
//!            │              │                 │             │             │
//!            └──► Idle      └──► Idle         └──► Failed   └──► Failed   └──► Failed ─► RolledBack
//! ```
//!
//! After verification the session stays in `Verifying` holding the verified
//! artifact until installation is confirmed. Cancellation returns any
//! non-destructive state to `Idle`; `Installing` cannot be cancelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::{ErrorCode, RollbackResult, UpdateError};
use crate::update::manifest::VersionManifest;
use crate::update::version_check::LocalVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Checking,
    UpdateAvailable,
    Downloading,
    Verifying,
    Installing,
    Succeeded,
    Failed,
    RolledBack,
}

impl SessionState {
    /// `Succeeded`, `Failed` and `RolledBack` end a session.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack)
    }

    /// A session in this state blocks a new check.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }

    /// Whether `self -> next` is an edge of the session state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{
            Checking, Downloading, Failed, Idle, Installing, RolledBack, Succeeded,
            UpdateAvailable, Verifying,
        };
        matches!(
            (self, next),
            (Idle | Succeeded | Failed | RolledBack, Checking)
                | (Checking, UpdateAvailable | Idle | Failed)
                | (UpdateAvailable, Downloading | Idle)
                | (Downloading, Verifying | Idle | Failed)
                | (Verifying, Installing | Idle | Failed)
                | (Installing, Succeeded | Failed)
                | (Failed, RolledBack)
                | (Succeeded | Failed | RolledBack, Idle)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpdateAvailable => "update available",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Installing => "installing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// What started a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckTrigger {
    /// User asked; always hits the network.
    Manual,
    /// Periodic timer; may be answered from the version cache.
    Scheduled,
    /// Application start with `check_on_startup`.
    Startup,
}

/// Transfer progress for the current download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Average throughput of this attempt.
    pub bytes_per_sec: u64,
    /// Estimated seconds remaining, once a rate is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

impl DownloadProgress {
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Error recorded on a session: taxonomy code plus a readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackResult>,
}

impl From<&UpdateError> for SessionError {
    fn from(error: &UpdateError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            rollback: error.rollback().cloned(),
        }
    }
}

/// One check → download → install attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSession {
    pub id: Uuid,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<CheckTrigger>,
    pub local_version: LocalVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_manifest: Option<VersionManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<DownloadProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
    /// Backup created before file replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    /// The user opted out of the pre-install backup.
    #[serde(default)]
    pub backup_skipped: bool,
    pub updated_at: DateTime<Utc>,
}

impl UpdateSession {
    /// A fresh idle session.
    pub fn idle(local_version: LocalVersion) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            trigger: None,
            local_version,
            current_manifest: None,
            progress: None,
            error: None,
            backup_id: None,
            backup_skipped: false,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, refusing edges the state machine does not have.
    pub fn transition(&mut self, next: SessionState) -> Result<(), UpdateError> {
        if !self.state.can_transition_to(next) {
            return Err(UpdateError::InvalidTransition {
                state: self.state,
                action: format!("move to {next}"),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record `error` and move to `Failed`, or `RolledBack` when the error
    /// carries a successful automatic rollback.
    pub fn fail(&mut self, error: &UpdateError) {
        self.error = Some(SessionError::from(error));
        self.state = match error.rollback() {
            Some(rollback) if rollback.success => SessionState::RolledBack,
            _ => SessionState::Failed,
        };
        self.updated_at = Utc::now();
    }

    pub fn event(&self) -> SessionEvent {
        SessionEvent {
            session_id: self.id,
            state: self.state,
            progress: self.progress,
            error: self.error.clone(),
        }
    }
}

/// Session-state-change notification consumed by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<DownloadProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
}
