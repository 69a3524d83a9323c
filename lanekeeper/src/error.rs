//! Error types for coordinated operations.
//!
//! `TxnError` is what the transaction handle reports to an operation body;
//! `Error<E>` is what the caller of `Coordinator::run` receives, with `E`
//! being the body's own business error.

use std::fmt;

use crate::key::ResourceKey;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Failures of `Txn` accessors inside an operation body
#[derive(Debug)]
pub enum TxnError {
    /// The key is not in the operation's declared key set
    Undeclared(ResourceKey),
    /// The transaction already committed or aborted
    Closed,
    /// Reading from the store failed
    Read(StoreError),
    /// A document did not match the requested type
    Codec(StoreError),
    /// A value could not be encoded into a document
    Encode(StoreError),
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undeclared(key) => write!(f, "Key '{key}' was not declared by the operation"),
            Self::Closed => write!(f, "Transaction is already closed"),
            Self::Read(e) => write!(f, "Store read failed: {e}"),
            Self::Codec(e) => write!(f, "Document codec failed: {e}"),
            Self::Encode(e) => write!(f, "Encoding a staged value failed: {e}"),
        }
    }
}

impl std::error::Error for TxnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read(e) | Self::Codec(e) | Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of a failed coordinated operation
///
/// Only `Caller` carries a business failure; every other variant is a
/// concurrency-layer or store failure. In all cases no document of the
/// operation was left partially written and all its lanes were released.
#[derive(Debug)]
pub enum Error<E = std::convert::Infallible> {
    /// A lane had too many pending tickets
    LaneFull { key: ResourceKey, limit: usize },
    /// A lane was not granted before the deadline
    LaneTimeout { key: ResourceKey },
    /// The body exceeded its budget while holding the lanes
    OperationTimeout,
    /// Loading a document failed, or it did not decode as the requested type
    StoreRead(StoreError),
    /// Writing a document failed; earlier writes of the commit were undone
    StoreWrite(StoreError),
    /// The body staged a value that cannot be encoded; nothing was written
    Encode(StoreError),
    /// The body touched a key it did not declare; resubmit with the full set
    UndeclaredKey(ResourceKey),
    /// The transaction handle was used after the operation ended
    Closed,
    /// The body panicked
    Panicked(String),
    /// The body's own logic failed
    Caller(E),
}

impl<E> Error<E> {
    /// True for failures that did not commit and may succeed if resubmitted
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LaneFull { .. }
                | Self::LaneTimeout { .. }
                | Self::OperationTimeout
                | Self::StoreRead(_)
                | Self::StoreWrite(_)
        )
    }

    /// The business error, if this is one
    pub fn into_caller(self) -> Option<E> {
        match self {
            Self::Caller(e) => Some(e),
            _ => None,
        }
    }

    /// Split off the business error.
    ///
    /// `Err` carries the body's own error; `Ok` carries every other failure,
    /// which no longer depends on `E`.
    pub fn into_layer(self) -> Result<Error, E> {
        Ok(match self {
            Self::Caller(e) => return Err(e),
            Self::LaneFull { key, limit } => Error::LaneFull { key, limit },
            Self::LaneTimeout { key } => Error::LaneTimeout { key },
            Self::OperationTimeout => Error::OperationTimeout,
            Self::StoreRead(e) => Error::StoreRead(e),
            Self::StoreWrite(e) => Error::StoreWrite(e),
            Self::Encode(e) => Error::Encode(e),
            Self::UndeclaredKey(key) => Error::UndeclaredKey(key),
            Self::Closed => Error::Closed,
            Self::Panicked(msg) => Error::Panicked(msg),
        })
    }
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaneFull { key, limit } => {
                write!(f, "Lane '{key}' is full ({limit} pending tickets)")
            }
            Self::LaneTimeout { key } => write!(f, "Timed out waiting for lane '{key}'"),
            Self::OperationTimeout => write!(f, "Operation exceeded its time budget"),
            Self::StoreRead(e) => write!(f, "Store read failed: {e}"),
            Self::StoreWrite(e) => write!(f, "Store write failed: {e}"),
            Self::Encode(e) => write!(f, "Encoding a staged value failed: {e}"),
            Self::UndeclaredKey(key) => {
                write!(f, "Key '{key}' was not declared by the operation")
            }
            Self::Closed => write!(f, "Transaction is already closed"),
            Self::Panicked(msg) => write!(f, "Operation panicked: {msg}"),
            Self::Caller(e) => write!(f, "{e}"),
        }
    }
}

impl<E> std::error::Error for Error<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::StoreRead(e) | Self::StoreWrite(e) | Self::Encode(e) => Some(e),
            Self::Caller(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<TxnError> for Error<E> {
    fn from(err: TxnError) -> Self {
        match err {
            TxnError::Undeclared(key) => Self::UndeclaredKey(key),
            TxnError::Closed => Self::Closed,
            TxnError::Read(e) => Self::StoreRead(e),
            TxnError::Codec(e) => Self::StoreRead(e),
            TxnError::Encode(e) => Self::Encode(e),
        }
    }
}

impl<E> From<QueueError> for Error<E> {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::LaneFull { key, limit } => Self::LaneFull { key, limit },
            QueueError::LaneTimeout { key } => Self::LaneTimeout { key },
            QueueError::OperationTimeout { .. } => Self::OperationTimeout,
        }
    }
}
