//! Core types shared across the update engine.
//!
//! - [`error`] - The [`UpdateError`] taxonomy and user-facing [`ErrorContext`]
//! - [`Channel`] - Release tracks with independent version histories

pub mod error;

pub use error::{ErrorCode, ErrorContext, RollbackResult, UpdateError, user_friendly_error};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A release track with its own version history and update policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Beta,
    Dev,
}

impl Channel {
    pub const ALL: [Self; 3] = [Self::Stable, Self::Beta, Self::Dev];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Dev => "dev",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "dev" => Ok(Self::Dev),
            _ => Err(UpdateError::InvalidChannel(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!("stable".parse::<Channel>().unwrap(), Channel::Stable);
        assert_eq!(" Beta ".parse::<Channel>().unwrap(), Channel::Beta);
        assert!(matches!("nightly".parse::<Channel>(), Err(UpdateError::InvalidChannel(_))));
    }

    #[test]
    fn test_channel_serde_lowercase() {
        let json = serde_json::to_string(&Channel::Dev).unwrap();
        assert_eq!(json, "\"dev\"");
        let parsed: Channel = serde_json::from_str("\"beta\"").unwrap();
        assert_eq!(parsed, Channel::Beta);
    }
}
