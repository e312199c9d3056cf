//! Error types for rcforge-core

use thiserror::Error;

/// Errors raised while loading or querying the device registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Source could not be read
    #[error("registry source unreadable: {0}")]
    Unreadable(String),

    /// Source content could not be parsed
    #[error("registry source malformed: {0}")]
    Malformed(String),

    /// Two devices share a target id
    #[error("duplicate target id in registry source: {0}")]
    DuplicateTarget(String),

    /// A device failed validation
    #[error("invalid device {target}: {reason}")]
    InvalidDevice { target: String, reason: String },

    /// Lookup miss
    #[error("target not found: {0}")]
    NotFound(String),
}

impl RegistryError {
    /// Whether this error came from loading a source (as opposed to a lookup).
    pub fn is_load_error(&self) -> bool {
        !matches!(self, RegistryError::NotFound(_))
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Unreadable(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Malformed(err.to_string())
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
