//! Error types for the blockvault engine.
//!
//! Internal code propagates [`Error`] through [`Result`]; the operation
//! interface reports failures as negative errno values in `op.retval`,
//! obtained via [`Error::errno`].

use thiserror::Error;

/// Common result type for blockvault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blockvault.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("version conflict: {0}")]
    VersionExists(String),

    #[error("unknown version: {0}")]
    NoSuchVersion(String),

    #[error("journal space exhausted: {0}")]
    JournalFull(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("engine is read-only")]
    ReadOnly,

    #[error("data region is full")]
    NoSpace,

    #[error("device is not formatted: {0}")]
    Unformatted(String),

    #[error("data corruption detected: {0}")]
    Corruption(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid-argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// The negative errno this error maps to on the operation interface.
    #[must_use]
    pub fn errno(&self) -> i64 {
        let e = match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::VersionExists(_) => libc::EEXIST,
            Self::NoSuchVersion(_) => libc::ENOENT,
            Self::JournalFull(_) | Self::NoSpace => libc::ENOSPC,
            Self::Busy(_) => libc::EBUSY,
            Self::ReadOnly => libc::EROFS,
            Self::Unformatted(_) | Self::Corruption(_) | Self::Configuration(_) => libc::EIO,
        };
        -i64::from(e)
    }

    /// Whether this error invalidates the engine's durability reasoning
    /// and must abort the process when seen on a live I/O path.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Corruption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::invalid("x").errno(), -i64::from(libc::EINVAL));
        assert_eq!(
            Error::VersionExists("v".into()).errno(),
            -i64::from(libc::EEXIST)
        );
        assert_eq!(Error::NoSpace.errno(), -i64::from(libc::ENOSPC));
        assert_eq!(Error::ReadOnly.errno(), -i64::from(libc::EROFS));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::corruption("crc").is_fatal());
        assert!(!Error::invalid("len").is_fatal());
        assert!(!Error::Busy("stable".into()).is_fatal());
    }
}
