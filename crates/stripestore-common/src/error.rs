//! Error types for StripeStore
//!
//! One error enum is shared across the engine and the tools. Operation
//! callbacks surface errors as negative errno-style codes through
//! [`Error::retval`]; everything else uses `Result<T>` directly.

use crate::types::{ObjVer, ObjectId};
use thiserror::Error;

/// Common result type for StripeStore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for StripeStore.
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no free space in the data region")]
    NoSpace,

    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error("unknown object version: {0}")]
    NotFound(ObjVer),

    #[error("object version is not synced: {0}")]
    NotSynced(ObjVer),

    #[error("on-disk state is corrupt: {0}")]
    Corruption(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid-operation error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Create a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(oid: ObjectId, version: u64) -> Self {
        Self::NotFound(ObjVer::new(oid, version))
    }

    pub fn not_synced(oid: ObjectId, version: u64) -> Self {
        Self::NotSynced(ObjVer::new(oid, version))
    }

    /// Check if this error names a missing object version.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Negative errno-style completion code for operation callbacks.
    #[must_use]
    pub fn retval(&self) -> i64 {
        match self {
            Self::NoSpace => -i64::from(libc::ENOSPC),
            Self::Invalid(_) | Self::Config(_) => -i64::from(libc::EINVAL),
            Self::NotFound(_) => -i64::from(libc::ENOENT),
            Self::NotSynced(_) => -i64::from(libc::EBUSY),
            Self::Io(_) | Self::Corruption(_) => -i64::from(libc::EIO),
        }
    }
}
