//! Errors reported by data handlers to the command layer

use std::fmt;

use lanekeeper::{Error, KeyError};

/// Why a data handler did not go through
#[derive(Debug)]
pub enum HandlerError {
    /// A user or guild id cannot be used as a key segment
    InvalidId(KeyError),
    InsufficientItems {
        user_id: String,
        item_id: String,
        have: u64,
        need: u64,
    },
    InsufficientFunds {
        user_id: String,
        have: i64,
        need: i64,
    },
    /// Nobody is selling the item
    NoSellOrder { item_id: String },
    /// Giving items to oneself
    SelfTransfer,
    /// The concurrency layer or the store failed; nothing was written
    Data(Error),
}

impl HandlerError {
    /// True if the user should be told to try again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Data(e) if e.is_retryable())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId(e) => write!(f, "Invalid id: {e}"),
            Self::InsufficientItems {
                user_id,
                item_id,
                have,
                need,
            } => write!(
                f,
                "User {user_id} has {have} of '{item_id}', needs {need}"
            ),
            Self::InsufficientFunds {
                user_id,
                have,
                need,
            } => write!(f, "User {user_id} has {have} bucks, needs {need}"),
            Self::NoSellOrder { item_id } => write!(f, "Nobody is selling '{item_id}'"),
            Self::SelfTransfer => write!(f, "Cannot transfer items to yourself"),
            Self::Data(e) if e.is_retryable() => write!(f, "Busy, try again: {e}"),
            Self::Data(e) => write!(f, "Data error: {e}"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidId(e) => Some(e),
            Self::Data(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KeyError> for HandlerError {
    fn from(err: KeyError) -> Self {
        Self::InvalidId(err)
    }
}

impl From<Error<HandlerError>> for HandlerError {
    fn from(err: Error<HandlerError>) -> Self {
        match err.into_layer() {
            Ok(layer) => Self::Data(layer),
            Err(own) => own,
        }
    }
}
