#![forbid(unsafe_code)]
//! Error types for the shallfs journal engine.
//!
//! Defines `ShallError` and a `Result<T>` alias used throughout the
//! workspace, with errno mappings for callers that surface numeric codes.

use shall_types::ParseError;
use thiserror::Error;

/// Unified error type for all journal-engine operations.
#[derive(Debug, Error)]
pub enum ShallError {
    /// Physical device read/write failure; surfaced verbatim, never retried.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural or checksum violation in a persistent artefact.
    #[error("invalid on-device data: {0}")]
    Invalid(#[from] ParseError),

    /// Caller misuse or inconsistent geometry that never reached the device.
    #[error("invalid format: {0}")]
    Format(String),

    /// A record exceeds the commit buffer under `too_big=error`.
    #[error("record too big: {required} bytes, commit buffer holds {commit_size}")]
    TooBig { required: usize, commit_size: usize },

    /// Exclusivity held by another caller (e.g. a second binary-log reader).
    #[error("device busy")]
    Busy,

    /// Journal full; only ever internal, `overflow=drop` swallows it.
    #[error("no space left in journal")]
    NoSpace,

    /// A cancellable suspension was interrupted.
    #[error("interrupted")]
    Interrupted,

    /// Admin path called against a device in an incompatible state
    /// (interrupted update, not formatted, already unmounted).
    #[error("not mounted: {0}")]
    NotMounted(String),

    /// fsck could not bring the device to a consistent state.
    #[error("repair failed: {0}")]
    RepairFailed(String),
}

impl ShallError {
    /// Convert this error into a POSIX errno for numeric surfaces.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Invalid(_) | Self::Format(_) => libc::EINVAL,
            Self::TooBig { .. } => libc::EFBIG,
            Self::Busy => libc::EBUSY,
            Self::NoSpace => libc::ENOSPC,
            Self::Interrupted => libc::EINTR,
            Self::NotMounted(_) => libc::ENODEV,
            Self::RepairFailed(_) => libc::EIO,
        }
    }
}

/// Result alias using `ShallError`.
pub type Result<T> = std::result::Result<T, ShallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_the_taxonomy() {
        assert_eq!(ShallError::Busy.to_errno(), libc::EBUSY);
        assert_eq!(ShallError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(ShallError::Interrupted.to_errno(), libc::EINTR);
        assert_eq!(
            ShallError::TooBig {
                required: 8192,
                commit_size: 4096
            }
            .to_errno(),
            libc::EFBIG
        );
        assert_eq!(
            ShallError::Invalid(ParseError::InvalidMagic { offset: 0 }).to_errno(),
            libc::EINVAL
        );
    }
}
