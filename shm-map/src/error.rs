use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong when talking to a segment.
///
/// None of these are retried internally. A `Capacity` error on `put` is returned before anything
/// in the segment was touched, the store is still consistent and usable afterwards.
#[derive(Debug, Error)]
pub enum Error {
    /// The parameters passed to `init` can not describe a segment.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Creating, opening, resizing or mapping the backing file failed.
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The backing file exists but was not written by a compatible configuration.
    #[error("incompatible segment {}: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },
    /// The slot table or the arena can not take the requested entry.
    #[error("capacity exhausted: {0}")]
    Capacity(Capacity),
    /// Acquiring or releasing the cross-process lock failed.
    #[error("segment lock failed: {0}")]
    Lock(#[source] std::io::Error),
}

/// Which of the two bounded resources ran out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capacity {
    /// All `max_entries` slots are in use.
    Entries { max_entries: u64 },
    /// No free block and not enough bump space for `requested` payload bytes.
    Bytes { requested: u64, max_bytes: u64 },
}

impl core::fmt::Display for Capacity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Capacity::Entries { max_entries } => {
                write!(f, "table is full ({max_entries} entries)")
            }
            Capacity::Bytes {
                requested,
                max_bytes,
            } => write!(
                f,
                "arena can not fit {requested} more bytes (budget {max_bytes} bytes)"
            ),
        }
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Convenience check for the capacity case, which callers commonly want to handle.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::Capacity(_))
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
