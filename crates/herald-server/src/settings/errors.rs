//! Settings error types.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use herald_broker::BrokerError;
use thiserror::Error;

/// Why settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read or decoded.
    #[error("settings file {}: {reason}", path.display())]
    File {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O or JSON failure.
        reason: String,
    },
    /// The merged settings are not runnable.
    #[error("invalid settings: {0}")]
    Invalid(String),
}

impl SettingsError {
    pub(crate) fn file(path: &Path, reason: impl Display) -> Self {
        Self::File {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

impl From<BrokerError> for SettingsError {
    fn from(err: BrokerError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
