//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the tree and its overlays.
#[derive(Error, Debug)]
pub enum Error {
    /// Lookup or deletion of a key that is not in the mapping.
    #[error("key not found")]
    KeyNotFound,

    /// The key exceeds the maximum key length the file was created with.
    #[error("key length {len} exceeds the configured maximum of {max}")]
    KeyTooLong { len: usize, max: usize },

    /// A payload or tuning parameter is outside its permitted range.
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// The requested node cache capacity is out of bounds.
    #[error("cache capacity {0} not in 5..=1000000")]
    InvalidCacheSize(usize),

    /// Operation on a store that has already been closed.
    #[error("store is not open")]
    NotOpen,

    /// Mutation attempted through a read-cached view.
    #[error("tree was opened read-only")]
    ReadOnly,

    /// An on-disk record failed to decode, or a structural walk found an
    /// impossible state.
    #[error("corrupted tree structure: {detail}")]
    Corruption { detail: String },

    #[error("io error")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corruption<S: Into<String>>(detail: S) -> Self {
        Error::Corruption {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
