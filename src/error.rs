//! Crate-wide error kinds.
//!
//! One variant per error kind in the design's error taxonomy. Messages
//! carry a translation key (`key`) rather than a formatted string, mirroring
//! the source system's indirection through a separate string table; the
//! `Display` impl here just falls back to the key since no translation
//! table is part of this crate's scope.

use crate::value::ElementError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown attribute '{name}' on class '{class}'")]
    AttrNameUnknown { class: String, name: String },

    #[error("permission denied for attribute '{attr}' on {class}({toid:?}): {reason}")]
    AttrPermission {
        class: String,
        attr: String,
        toid: Option<String>,
        reason: &'static str,
    },

    #[error("invalid value for attribute '{attr}' on {class}: {source}")]
    AttrValue {
        class: String,
        attr: String,
        #[source]
        source: ElementError,
    },

    #[error("{0} attribute error(s)")]
    AttrErrorList(Vec<Error>),

    #[error("instance {0} does not exist")]
    ToiNonexistent(String),

    #[error("instance {0} has been deleted")]
    ToiDeleted(String),

    #[error("commit conflict on instance {0:?}")]
    CommitConflict(Option<String>),

    #[error("instances locked by another worker: {0:?}")]
    ToisLocked(Vec<String>),

    #[error("timeout: {0}")]
    Timeout(&'static str),

    #[error("{0}")]
    ClientError(String),

    #[error("relation has no counterpart for '{attr}' on {class}")]
    RelationError { class: String, attr: String },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, Error::CommitConflict(_))
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Error::ToisLocked(_))
    }
}
