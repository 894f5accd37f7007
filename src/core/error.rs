//! Error handling for the update engine
//!
//! The error system follows two principles:
//! 1. **Strongly-typed errors** so the [`UpdateManager`](crate::update::UpdateManager)
//!    can decide whether a failure is retryable, recoverable, or fatal
//! 2. **User-friendly messages** with actionable suggestions for CLI users
//!
//! # Architecture
//!
//! - [`UpdateError`] - Enumerated failure cases of the update pipeline
//! - [`ErrorCode`] - Serializable taxonomy code stored on a session and sent to the UI
//! - [`ErrorContext`] - Wrapper that adds user-friendly messages and suggestions
//!
//! # Error Categories
//!
//! - **Transient**: [`UpdateError::Network`], [`UpdateError::AllEndpointsUnhealthy`]
//! - **Malformed data**: [`UpdateError::Parse`], [`UpdateError::IncompatibleArtifact`]
//! - **Integrity**: [`UpdateError::Integrity`]
//! - **Pre-install aborts**: [`UpdateError::DiskSpace`], [`UpdateError::Backup`]
//! - **Install-time**: [`UpdateError::FileSystem`], which may carry a rollback outcome
//! - **User initiated**: [`UpdateError::Cancelled`]
//!
//! Use [`user_friendly_error`] to convert any error into a displayable
//! [`ErrorContext`].

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::update::session::SessionState;

/// Outcome of a rollback attempt, attached to install failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    /// Backup that was restored.
    pub backup_id: String,
    /// Whether the installed directory now matches the backup.
    pub success: bool,
    /// Version recorded in the backup metadata.
    pub restored_version: String,
    /// Reason the rollback failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The main error type for update operations.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Transport failure talking to an endpoint or artifact host.
    #[error("Network error for {url}: {reason}")]
    Network {
        /// URL being requested
        url: String,
        /// Underlying failure
        reason: String,
    },

    /// A manifest or persisted state file did not validate.
    #[error("Failed to parse {what}: {reason}")]
    Parse {
        /// What was being parsed (e.g. "manifest for channel 'beta'")
        what: String,
        /// Validation failure
        reason: String,
    },

    /// The endpoint answered but has no such resource.
    #[error("Resource not found: {url}")]
    NotFound {
        /// URL that returned 404
        url: String,
    },

    /// Checksum mismatch on a downloaded artifact.
    #[error("Checksum verification failed ({algorithm}): expected {expected}, got {actual}")]
    Integrity {
        /// Hash algorithm that failed
        algorithm: String,
        /// Digest declared by the manifest
        expected: String,
        /// Digest of the bytes on disk
        actual: String,
    },

    /// Not enough free space for the download.
    #[error("Insufficient disk space at {path}: need {required} bytes, {available} available")]
    DiskSpace {
        /// Directory that was checked
        path: String,
        /// Bytes needed
        required: u64,
        /// Bytes free
        available: u64,
    },

    /// The operation observed a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    /// Creating the pre-install backup failed. Nothing was modified.
    #[error("Backup failed: {reason}")]
    Backup {
        /// Failure description
        reason: String,
    },

    /// Staging or swapping files failed.
    #[error("File system error during {operation}: {reason}")]
    FileSystem {
        /// Step that failed (e.g. "staging", "swap")
        operation: String,
        /// Failure description
        reason: String,
        /// Result of the automatic rollback, when one was attempted
        rollback: Option<RollbackResult>,
    },

    /// The artifact targets a different platform or is not a usable package.
    #[error("Incompatible update artifact: {reason}")]
    IncompatibleArtifact {
        /// Why the artifact was rejected
        reason: String,
    },

    /// Rollback requested for an unknown backup.
    #[error("Backup '{backup_id}' not found")]
    BackupNotFound {
        /// Requested backup id
        backup_id: String,
    },

    /// Every configured endpoint is currently failing its health probe.
    #[error("All {attempted} update endpoints are unhealthy")]
    AllEndpointsUnhealthy {
        /// Number of endpoints considered
        attempted: usize,
    },

    /// Channel name is not one of stable, beta, dev.
    #[error("Unknown update channel '{0}' (expected stable, beta or dev)")]
    InvalidChannel(String),

    /// Requested operation is not valid in the session's current state.
    #[error("Cannot {action} while session is {state}")]
    InvalidTransition {
        /// Current state
        state: SessionState,
        /// Attempted operation
        action: String,
    },

    /// Cancellation after file replacement has started.
    #[error("Installation is in progress and cannot be cancelled")]
    CancellationRefused,

    /// Skip/defer attempted on an update marked as required.
    #[error("Version {version} is a required update and cannot be {action}")]
    RequiredUpdate {
        /// Manifest version
        version: String,
        /// "skipped", "deferred", ...
        action: String,
    },

    /// Settings are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong
        message: String,
    },

    /// Local I/O failure outside the install swap.
    #[error("I/O error while {operation} {path}: {source}")]
    Io {
        /// What was happening
        operation: String,
        /// Path involved
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Taxonomy code recorded on an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Network,
    Parse,
    NotFound,
    Integrity,
    DiskSpace,
    Cancelled,
    Backup,
    FileSystem,
    IncompatibleArtifact,
    BackupNotFound,
    AllEndpointsUnhealthy,
    Usage,
    Io,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Parse => "parse",
            Self::NotFound => "not_found",
            Self::Integrity => "integrity",
            Self::DiskSpace => "disk_space",
            Self::Cancelled => "cancelled",
            Self::Backup => "backup",
            Self::FileSystem => "file_system",
            Self::IncompatibleArtifact => "incompatible_artifact",
            Self::BackupNotFound => "backup_not_found",
            Self::AllEndpointsUnhealthy => "all_endpoints_unhealthy",
            Self::Usage => "usage",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

impl UpdateError {
    /// Shorthand for [`UpdateError::Network`].
    pub fn network(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`UpdateError::Parse`].
    pub fn parse(what: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`UpdateError::Io`].
    pub fn io(
        operation: impl Into<String>,
        path: impl AsRef<std::path::Path>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Taxonomy code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::Network,
            Self::Parse { .. } => ErrorCode::Parse,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Integrity { .. } => ErrorCode::Integrity,
            Self::DiskSpace { .. } => ErrorCode::DiskSpace,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Backup { .. } => ErrorCode::Backup,
            Self::FileSystem { .. } => ErrorCode::FileSystem,
            Self::IncompatibleArtifact { .. } => ErrorCode::IncompatibleArtifact,
            Self::BackupNotFound { .. } => ErrorCode::BackupNotFound,
            Self::AllEndpointsUnhealthy { .. } => ErrorCode::AllEndpointsUnhealthy,
            Self::InvalidChannel(_)
            | Self::InvalidTransition { .. }
            | Self::CancellationRefused
            | Self::RequiredUpdate { .. }
            | Self::Config { .. } => ErrorCode::Usage,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    /// Transient errors that should move on to the next endpoint.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Rollback outcome attached to an install failure, if any.
    #[must_use]
    pub const fn rollback(&self) -> Option<&RollbackResult> {
        match self {
            Self::FileSystem { rollback, .. } => rollback.as_ref(),
            _ => None,
        }
    }

    /// An install failure whose automatic rollback also failed.
    ///
    /// This is the only state that needs manual recovery from the backup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.rollback().is_some_and(|r| !r.success)
    }
}

/// Error wrapper with user-facing suggestion and details.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error message
    pub message: String,
    /// Taxonomy code, when the error came from the update engine
    pub code: Option<ErrorCode>,
    /// Optional hint for resolving the problem
    pub suggestion: Option<String>,
    /// Optional extra information
    pub details: Option<String>,
}

impl ErrorContext {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            suggestion: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error with colors to stderr.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.message);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

fn create_error_context(error: &UpdateError) -> ErrorContext {
    let mut ctx = ErrorContext::new(error.to_string());
    ctx.code = Some(error.code());

    match error {
        UpdateError::Network { .. } => ctx
            .with_suggestion("Check your internet connection and retry with 'pfupdate check'")
            .with_details("The update server could not be reached"),
        UpdateError::AllEndpointsUnhealthy { .. } => ctx
            .with_suggestion("Retry later; the next scheduled check will try again")
            .with_details("Every configured update endpoint failed its health probe"),
        UpdateError::Parse { .. } => ctx.with_suggestion(
            "The update server published an invalid manifest; report this to the release team",
        ),
        UpdateError::NotFound { .. } => {
            ctx.with_suggestion("No release is published for this channel yet")
        }
        UpdateError::Integrity { .. } => ctx
            .with_suggestion("Run 'pfupdate upgrade' again to download a fresh copy")
            .with_details("The downloaded file was discarded"),
        UpdateError::DiskSpace { .. } => {
            ctx.with_suggestion("Free up disk space and retry the update")
        }
        UpdateError::Backup { .. } => ctx
            .with_suggestion("Check permissions on the data directory, or pass --no-backup")
            .with_details("No application files were modified"),
        UpdateError::FileSystem {
            rollback: Some(rollback),
            ..
        } if !rollback.success => ctx
            .with_suggestion(format!(
                "Restore manually with 'pfupdate rollback {}'",
                rollback.backup_id
            ))
            .with_details(format!(
                "Automatic rollback failed: {}",
                rollback.error.as_deref().unwrap_or("unknown error")
            )),
        UpdateError::FileSystem {
            rollback: Some(rollback),
            ..
        } => ctx.with_details(format!(
            "The previous version {} was restored from backup {}",
            rollback.restored_version, rollback.backup_id
        )),
        UpdateError::IncompatibleArtifact { .. } => {
            ctx.with_suggestion("Switch to a channel that publishes builds for this platform")
        }
        UpdateError::BackupNotFound { .. } => {
            ctx.with_suggestion("List available backups with 'pfupdate backups list'")
        }
        UpdateError::InvalidChannel(_) => {
            ctx.with_suggestion("Use one of: stable, beta, dev")
        }
        _ => ctx,
    }
}

/// Convert any error into a user-friendly [`ErrorContext`].
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(update_error) = error.downcast_ref::<UpdateError>() {
        let mut ctx = create_error_context(update_error);
        // Keep the outer anyhow context, if any
        let outer = error.to_string();
        if outer != ctx.message {
            ctx.message = format!("{outer}: {update_error}");
        }
        return ctx;
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>()
        && io_error.kind() == std::io::ErrorKind::PermissionDenied
    {
        return ErrorContext::new(error.to_string())
            .with_suggestion("Check ownership of the install and data directories");
    }

    if let Some(toml_error) = error.downcast_ref::<toml::de::Error>() {
        return ErrorContext::new(format!("Invalid settings file: {toml_error}"))
            .with_suggestion("Fix the syntax in settings.toml or delete it to restore defaults");
    }

    ErrorContext::new(format!("{error:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(UpdateError::network("http://x", "timeout").code(), ErrorCode::Network);
        assert_eq!(UpdateError::Cancelled.code(), ErrorCode::Cancelled);
        assert_eq!(UpdateError::CancellationRefused.code(), ErrorCode::Usage);
        assert_eq!(ErrorCode::AllEndpointsUnhealthy.to_string(), "all_endpoints_unhealthy");
    }

    #[test]
    fn test_only_network_is_retryable() {
        assert!(UpdateError::network("http://x", "reset").is_retryable());
        assert!(!UpdateError::NotFound { url: "http://x".into() }.is_retryable());
        assert!(!UpdateError::parse("manifest", "missing version").is_retryable());
    }

    #[test]
    fn test_fatal_only_when_rollback_failed() {
        let rolled_back = UpdateError::FileSystem {
            operation: "swap".into(),
            reason: "denied".into(),
            rollback: Some(RollbackResult {
                backup_id: "b1".into(),
                success: true,
                restored_version: "1.0.0".into(),
                error: None,
            }),
        };
        assert!(!rolled_back.is_fatal());

        let stuck = UpdateError::FileSystem {
            operation: "swap".into(),
            reason: "denied".into(),
            rollback: Some(RollbackResult {
                backup_id: "b1".into(),
                success: false,
                restored_version: "1.0.0".into(),
                error: Some("disk full".into()),
            }),
        };
        assert!(stuck.is_fatal());

        let ctx = user_friendly_error(anyhow::Error::new(stuck));
        assert!(ctx.suggestion.unwrap().contains("pfupdate rollback b1"));
    }

    #[test]
    fn test_user_friendly_error_through_context() {
        let err = anyhow::Error::new(UpdateError::DiskSpace {
            path: "/tmp".into(),
            required: 10,
            available: 1,
        })
        .context("Download failed");
        let ctx = user_friendly_error(err);
        assert_eq!(ctx.code, Some(ErrorCode::DiskSpace));
        assert!(ctx.message.contains("Download failed"));
    }
}
