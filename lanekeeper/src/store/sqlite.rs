//! SQLite-backed implementation of `Store`
//!
//! Documents live in one table keyed by the resource key string.
//! `INSERT OR REPLACE` is a single statement, so each save is atomic on its
//! own and a failed save leaves the previous row intact. Statements run on
//! tokio's blocking pool, one at a time.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::{blocking, Document, Store, StoreError};
use crate::key::ResourceKey;

fn backend(err: &rusqlite::Error) -> StoreError {
    StoreError::Backend(format!("sqlite: {err}"))
}

/// SQLite-backed document storage
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open the database at `db_path`, creating the table if needed.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or table creation fails.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).map_err(|e| backend(&e))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, mostly for tests
    ///
    /// # Errors
    ///
    /// Returns error if table creation fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| backend(&e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| backend(&e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl SqliteStore {
    /// Run `f` with the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        blocking(move || f(&conn.lock())).await
    }
}

impl Store for SqliteStore {
    async fn fetch(&self, key: &ResourceKey) -> Result<Option<Document>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM documents WHERE key = ?",
                    params![key.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| backend(&e))?;

            body.map(|text| Document::from_bytes(&key, text.as_bytes()))
                .transpose()
        })
        .await
    }

    async fn save(&self, key: &ResourceKey, doc: &Document) -> Result<(), StoreError> {
        let bytes = doc.to_bytes(key)?;
        let body = String::from_utf8(bytes)
            .map_err(|e| StoreError::Backend(format!("non-UTF-8 document '{key}': {e}")))?;
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO documents (key, body) VALUES (?, ?)",
                params![key.as_str(), body],
            )
            .map_err(|e| backend(&e))?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM documents WHERE key = ?", params![key.as_str()])
                .map_err(|e| backend(&e))?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<ResourceKey>, StoreError> {
        let prefix: Vec<String> = prefix.iter().map(|s| (*s).to_string()).collect();
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT key FROM documents ORDER BY key")
                    .map_err(|e| backend(&e))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|e| backend(&e))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| backend(&e))?;
                Ok(rows)
            })
            .await?;

        // Filter in Rust: `_` is a LIKE wildcard and a legal key character.
        let prefix: Vec<&str> = prefix.iter().map(String::as_str).collect();
        Ok(rows
            .iter()
            .filter_map(|raw| ResourceKey::parse(raw).ok())
            .filter(|key| key.has_prefix(&prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_roundtrip_and_replace() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = ResourceKey::guild("9").unwrap();

        assert!(store.fetch(&key).await.unwrap().is_none());
        store.save(&key, &Document::new(json!({"a": 1}))).await.unwrap();
        store.save(&key, &Document::new(json!({"a": 2}))).await.unwrap();

        let doc = store.load(&key).await.unwrap();
        assert_eq!(doc.as_value(), &json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_list_treats_underscore_literally() {
        let store = SqliteStore::open_in_memory().unwrap();
        let wipe = ResourceKey::global(crate::key::GlobalPartition::WipeUsers);
        let other = ResourceKey::parse("global:wipeXusers").unwrap();
        store.save(&wipe, &Document::default()).await.unwrap();
        store.save(&other, &Document::default()).await.unwrap();

        assert_eq!(store.list(&["global", "wipe_users"]).await.unwrap(), vec![wipe]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_coordinated_writes_from_many_tasks() {
        use crate::{Coordinator, Error, QueueConfig};

        let store = SqliteStore::open_in_memory().unwrap();
        let coord = Coordinator::new(store, QueueConfig::default());
        let key = ResourceKey::user("1").unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let coord = coord.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    coord
                        .run_one(key.clone(), |txn| async move {
                            let doc = txn.load(&key).await?;
                            let n = doc.as_value()["n"].as_i64().unwrap_or(0);
                            txn.stage(&key, Document::new(json!({ "n": n + 1 })))?;
                            Ok::<_, Error>(())
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let doc = coord.store().load(&key).await.unwrap();
        assert_eq!(doc.as_value(), &json!({ "n": 10 }));
    }
}
