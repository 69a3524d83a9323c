//! File-backed implementation of Store
//!
//! One JSON file per key. The key `a:b:c` lives at `<root>/a/b/c.json`;
//! key segments are restricted to `[A-Za-z0-9_-]`, so the mapping is
//! injective and never escapes the root.
//!
//! `save` writes a temporary file next to the target, syncs it, and renames
//! it over the target. A crash or a failed write leaves the previous
//! document in place. Blocking file I/O runs on tokio's blocking pool.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{blocking, Document, Store, StoreError};
use crate::key::ResourceKey;

const EXTENSION: &str = "json";

/// Directory of JSON documents
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::io(format!("creating {}", root.display()), e))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the document for `key`
    #[must_use]
    pub fn path_for(&self, key: &ResourceKey) -> PathBuf {
        let segments: Vec<&str> = key.segments().collect();
        let mut path = self.root.clone();
        if let Some((last, dirs)) = segments.split_last() {
            for dir in dirs {
                path.push(dir);
            }
            path.push(format!("{last}.{EXTENSION}"));
        }
        path
    }

    fn read_blocking(key: &ResourceKey, path: &Path) -> Result<Option<Document>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Document::from_bytes(key, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(format!("reading {}", path.display()), e)),
        }
    }

    fn write_blocking(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let io_err = |what: &str, e: std::io::Error| StoreError::io(format!("{what} {}", path.display()), e);
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Backend(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(dir).map_err(|e| io_err("creating directory for", e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_err("staging", e))?;
        tmp.write_all(bytes).map_err(|e| io_err("writing", e))?;
        tmp.as_file().sync_all().map_err(|e| io_err("syncing", e))?;
        tmp.persist(path).map_err(|e| io_err("replacing", e.error))?;

        // Make the rename itself durable
        #[cfg(unix)]
        fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| io_err("syncing directory of", e))?;
        Ok(())
    }

    fn remove_blocking(path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(format!("removing {}", path.display()), e)),
        }
    }

    fn list_blocking(root: &Path, prefix: &[String]) -> Result<Vec<ResourceKey>, StoreError> {
        let mut found = Vec::new();

        // The prefix itself may name a document (`global:market` next to
        // the `global/market/` directory).
        if let Some((last, dirs)) = prefix.split_last() {
            let mut exact = root.to_path_buf();
            exact.extend(dirs);
            exact.push(format!("{last}.{EXTENSION}"));
            if exact.is_file() {
                found.push(prefix.to_vec());
            }
        }

        let mut dir = root.to_path_buf();
        dir.extend(prefix);
        if dir.is_dir() {
            walk(&dir, &mut prefix.to_vec(), &mut found)?;
        }

        let mut keys: Vec<ResourceKey> = found
            .into_iter()
            .filter_map(|segments| match ResourceKey::from_segments(&segments) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("file store: skipping foreign file {:?}: {e}", segments);
                    None
                }
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Collect the segment paths of every `*.json` file below `dir`
fn walk(
    dir: &Path,
    segments: &mut Vec<String>,
    found: &mut Vec<Vec<String>>,
) -> Result<(), StoreError> {
    let entries =
        fs::read_dir(dir).map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if path.is_dir() {
            segments.push(name);
            walk(&path, segments, found)?;
            segments.pop();
        } else if let Some(stem) = name.strip_suffix(&format!(".{EXTENSION}")) {
            let mut key = segments.clone();
            key.push(stem.to_string());
            found.push(key);
        }
        // Anything else is a leftover temporary file
    }
    Ok(())
}

impl Store for FileStore {
    async fn fetch(&self, key: &ResourceKey) -> Result<Option<Document>, StoreError> {
        let path = self.path_for(key);
        let key = key.clone();
        blocking(move || Self::read_blocking(&key, &path)).await
    }

    async fn save(&self, key: &ResourceKey, doc: &Document) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let bytes = doc.to_bytes(key)?;
        debug!("file store: saving '{key}' ({} bytes)", bytes.len());
        blocking(move || Self::write_blocking(&path, &bytes)).await
    }

    async fn remove(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        debug!("file store: removing '{key}'");
        blocking(move || Self::remove_blocking(&path)).await
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<ResourceKey>, StoreError> {
        let root = self.root.clone();
        let prefix: Vec<String> = prefix.iter().map(|s| (*s).to_string()).collect();
        blocking(move || Self::list_blocking(&root, &prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_for_nests_segments() {
        let store = FileStore {
            root: PathBuf::from("/data"),
        };
        assert_eq!(
            store.path_for(&ResourceKey::user("42").unwrap()),
            PathBuf::from("/data/user/42.json")
        );
        assert_eq!(
            store.path_for(&ResourceKey::market("gift").unwrap()),
            PathBuf::from("/data/global/market/gift.json")
        );
    }
}
