//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not JSON.
    #[error("settings file {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The merged document does not fit the settings shape (a string where a
    /// number belongs, and the like).
    #[error("settings do not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),

    /// One setting holds a value the runtime cannot work with.
    #[error("invalid setting {setting}: {reason}")]
    Invalid {
        /// camelCase path of the offending setting, e.g. `preview.matchChunkBytes`.
        setting: &'static str,
        reason: String,
    },
}

impl SettingsError {
    pub fn invalid(setting: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            setting,
            reason: reason.into(),
        }
    }

    /// The offending setting, for validation failures.
    pub fn setting(&self) -> Option<&'static str> {
        match self {
            Self::Invalid { setting, .. } => Some(*setting),
            _ => None,
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
