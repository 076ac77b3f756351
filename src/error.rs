//! # Error Types
//!
//! Every fallible operation in the crate returns [`Result`]. The error set is
//! deliberately small and flat: callers of a cache branch on the *kind* of
//! failure (miss vs. rejection vs. device fault), so each kind is a variant
//! they can match on rather than a string they would have to parse.
//!
//! ## Kinds
//!
//! - [`Error::NotFound`]: the key is not in the cache. Lookups also map
//!   checksum failures to `NotFound` after invalidating the index entry; the
//!   device-level detail is logged, not surfaced.
//! - [`Error::Rejected`]: the admission policy declined the insert.
//! - [`Error::QueueFull`]: the parcel-memory or concurrent-insert cap is
//!   exhausted. Retry later; nothing was enqueued.
//! - [`Error::BadChecksum`]: payload failed validation in a context where the
//!   caller asked for the data explicitly (metadata recovery internals).
//! - [`Error::Device`]: an I/O error with the offending offset and length.
//! - [`Error::ShuttingDown`]: the engine no longer accepts work.
//! - [`Error::InvalidArgument`]: configuration validation failure, produced
//!   only by `build()`-time checks. The engine never panics on bad config.

/// Classification of a device-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The device returned fewer bytes than requested.
    Short,
    /// The underlying I/O syscall failed.
    Io,
    /// Offset, length, or buffer alignment violated the block-size contract.
    Misaligned,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceErrorKind::Short => write!(f, "short i/o"),
            DeviceErrorKind::Io => write!(f, "i/o error"),
            DeviceErrorKind::Misaligned => write!(f, "misaligned i/o"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("insert rejected by admission policy")]
    Rejected,

    #[error("insert queue full")]
    QueueFull,

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("device {kind} at offset {offset}, length {length}")]
    Device {
        offset: u64,
        length: u64,
        kind: DeviceErrorKind,
    },

    #[error("cache is shutting down")]
    ShuttingDown,

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl Error {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn device(offset: u64, length: u64, kind: DeviceErrorKind) -> Self {
        Error::Device {
            offset,
            length,
            kind,
        }
    }

    /// True for the misses a caller treats as "not present" rather than a
    /// fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
