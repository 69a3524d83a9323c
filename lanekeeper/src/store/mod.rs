//! Persistent store
//!
//! Durable key → document storage with atomic single-key replace.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Coordinator (transaction layer)    │
//! │  - holds the lanes for its keys     │
//! │  - stages writes, commits on Ok     │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ load / save / remove
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  Store (durable documents)          │
//! │  - one JSON document per key        │
//! │  - save replaces atomically         │
//! └─────────────────────────────────────┘
//!      ▲          ▲            ▲
//!      │          │            │
//!   MemStore  FileStore  SqliteStore
//! ```
//!
//! Nothing outside the coordinator may write through a store that the
//! coordinator also serves: the lanes are the only concurrency guard and
//! documents carry no version.

pub mod file;
pub mod mem;
#[cfg(feature = "sqlitestore")]
pub mod sqlite;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

use crate::key::ResourceKey;

pub use file::FileStore;
pub use mem::MemStore;
#[cfg(feature = "sqlitestore")]
pub use sqlite::SqliteStore;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur in store operations
#[derive(Debug)]
pub enum StoreError {
    /// Underlying I/O failed
    Io {
        context: String,
        source: std::io::Error,
    },
    /// A document could not be encoded or decoded
    Codec { context: String, message: String },
    /// Backend-specific failure (database, worker thread)
    Backend(String),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn codec(context: impl Into<String>, err: &serde_json::Error) -> Self {
        Self::Codec {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { context, source } => write!(f, "I/O error on {context}: {source}"),
            Self::Codec { context, message } => {
                write!(f, "Malformed document {context}: {message}")
            }
            Self::Backend(msg) => write!(f, "Store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Run blocking backend work on tokio's blocking pool
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Backend(format!("blocking store task failed: {e}")))?
}

// ============================================================================
// Document
// ============================================================================

/// JSON payload stored under one key
///
/// Versionless. The default document is an empty JSON object, which is what
/// `load` returns for a key that was never saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(serde_json::Value);

impl Default for Document {
    fn default() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl Document {
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn as_value_mut(&mut self) -> &mut serde_json::Value {
        &mut self.0
    }

    #[must_use]
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// # Errors
    /// Returns `StoreError::Codec` if `value` cannot be represented as JSON.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self, StoreError> {
        serde_json::to_value(value)
            .map(Self)
            .map_err(|e| StoreError::codec("while encoding", &e))
    }

    /// # Errors
    /// Returns `StoreError::Codec` if the document does not match `T`.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        T::deserialize(&self.0).map_err(|e| StoreError::codec("while decoding", &e))
    }

    pub(crate) fn to_bytes(&self, key: &ResourceKey) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(&self.0).map_err(|e| StoreError::codec(format!("'{key}'"), &e))
    }

    pub(crate) fn from_bytes(key: &ResourceKey, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes)
            .map(Self)
            .map_err(|e| StoreError::codec(format!("'{key}'"), &e))
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Trait for document storage backends
///
/// `save` must replace the previous document atomically: after a crash or a
/// failed save the key holds either the old document or the new one, never
/// a mix. `fetch` must observe the most recent successful `save`.
pub trait Store: Send + Sync {
    /// Read the document under `key`, `None` if it was never saved.
    fn fetch(
        &self,
        key: &ResourceKey,
    ) -> impl Future<Output = Result<Option<Document>, StoreError>> + Send;

    /// Atomically replace the document under `key`.
    fn save(
        &self,
        key: &ResourceKey,
        doc: &Document,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete the document under `key`. Removing a missing key is not an error.
    fn remove(&self, key: &ResourceKey) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Keys whose leading segments equal `prefix`, sorted.
    fn list(
        &self,
        prefix: &[&str],
    ) -> impl Future<Output = Result<Vec<ResourceKey>, StoreError>> + Send;

    /// Read the document under `key`, or the empty document on first use.
    fn load(&self, key: &ResourceKey) -> impl Future<Output = Result<Document, StoreError>> + Send {
        async move { Ok(self.fetch(key).await?.unwrap_or_default()) }
    }
}
