//! Error types for kd-tree construction.

use thiserror::Error;

/// Errors that can occur while building a kd-tree.
#[derive(Error, Debug)]
pub enum KdTreeError {
    /// A construction parameter is out of range, or the tree was already
    /// built.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The primitive count exceeds what the packed leaf offsets can address.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// The geometry adapter reported inconsistent data.
    #[error("geometry integrity violation: {0}")]
    Integrity(String),
}

/// Result type for kd-tree operations.
pub type Result<T> = std::result::Result<T, KdTreeError>;
