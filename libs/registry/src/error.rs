//! Error types for capability registration.

use thiserror::Error;

/// Errors returned by `Registry::register`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A capability is already registered under this name and the
    /// registry rejects overwrites.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Capabilities cannot be registered under the empty name.
    #[error("name cannot be empty")]
    EmptyName,
}
