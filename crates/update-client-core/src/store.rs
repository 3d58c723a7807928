//! Storage seams: local metadata persistence and remote repository access.
//!
//! The client core only ever talks to these traits. Three backends are
//! bundled: an in-memory local store, a directory-backed local store, and
//! an HTTP remote store. Anything else (databases, mirrors, test fakes)
//! can be supplied by implementing the traits.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors emitted by local metadata stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid metadata name {name:?}")]
    InvalidMetaName { name: String },
}

/// Errors emitted by remote stores.
///
/// `NotFound` is distinguished so callers can tell a missing path from a
/// transport failure.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{path} not found on remote store")]
    NotFound { path: String },
    #[error("transport error fetching {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RemoteError {
    /// Returns whether this error is the distinguished not-found case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

/// An open remote file: the byte stream and the length the remote
/// announced for it (`None` when unknown).
pub struct RemoteFile {
    /// The body stream. Dropped to release the connection.
    pub stream: Box<dyn Read + Send>,
    /// Remote-announced length, when the transport reports one.
    pub size: Option<u64>,
}

/// Local storage for downloaded top-level metadata.
///
/// Names take the form `<role>.json` for the four top-level roles.
pub trait LocalStore {
    /// Returns all stored top-level metadata blobs keyed by name.
    fn get_meta(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError>;

    /// Persists one metadata blob under the given name.
    fn set_meta(&mut self, name: &str, meta: Vec<u8>) -> Result<(), StoreError>;
}

/// Remote repository access for metadata and target files.
pub trait RemoteStore {
    /// Opens the file at `path`, relative to the repository root
    /// (e.g. `root.json` or `targets/path/to/file.txt`).
    fn get(&self, path: &str) -> Result<RemoteFile, RemoteError>;
}

/// Byte sink for a target download, with a cancellation hook.
///
/// `delete` must be idempotent; it is invoked whenever a download fails so
/// a partially written target is never left in place.
pub trait Destination: Write {
    /// Removes anything written so far.
    fn delete(&mut self) -> io::Result<()>;
}

/// A `HashMap`-backed local store, useful for tests and ephemeral clients.
#[derive(Debug, Default, Clone)]
pub struct MemoryLocalStore {
    meta: BTreeMap<String, Vec<u8>>,
}

impl MemoryLocalStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get_meta(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        Ok(self.meta.clone())
    }

    fn set_meta(&mut self, name: &str, meta: Vec<u8>) -> Result<(), StoreError> {
        self.meta.insert(name.to_string(), meta);
        Ok(())
    }
}

/// The metadata names a [`FileLocalStore`] will read and write.
const META_NAMES: [&str; 4] = ["root.json", "targets.json", "snapshot.json", "timestamp.json"];

/// A local store persisting each metadata blob as a file in a directory.
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    dir: PathBuf,
}

impl FileLocalStore {
    /// Opens (or creates) a metadata directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileLocalStore { dir })
    }

    /// Rejects names that are not one of the four top-level metadata files,
    /// which also keeps path separators out of the store directory.
    fn check_name(name: &str) -> Result<(), StoreError> {
        if META_NAMES.contains(&name) {
            Ok(())
        } else {
            Err(StoreError::InvalidMetaName {
                name: name.to_string(),
            })
        }
    }
}

impl LocalStore for FileLocalStore {
    fn get_meta(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let mut meta = BTreeMap::new();
        for name in META_NAMES {
            match fs::read(self.dir.join(name)) {
                Ok(bytes) => {
                    meta.insert(name.to_string(), bytes);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(meta)
    }

    fn set_meta(&mut self, name: &str, meta: Vec<u8>) -> Result<(), StoreError> {
        Self::check_name(name)?;
        // Write-then-rename so a crash mid-write cannot leave a truncated
        // blob under the final name.
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, &meta)?;
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }
}

/// A remote store fetching files over HTTP(S) relative to a base URL.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpRemoteStore {
    /// Builds an HTTP remote store rooted at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let base_url = base_url.into();
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("update-client-core/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            // The bounded reader's inactivity window is the only read
            // deadline; an overall request timeout would cut off large but
            // steadily flowing downloads.
            .timeout(None)
            .build()
            .map_err(|err| RemoteError::Transport {
                path: base_url.clone(),
                source: Box::new(err),
            })?;
        Ok(HttpRemoteStore { client, base_url })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl RemoteStore for HttpRemoteStore {
    fn get(&self, path: &str) -> Result<RemoteFile, RemoteError> {
        let response = self
            .client
            .get(self.url_for(path))
            .send()
            .map_err(|err| RemoteError::Transport {
                path: path.to_string(),
                source: Box::new(err),
            })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound {
                path: path.to_string(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|err| RemoteError::Transport {
                path: path.to_string(),
                source: Box::new(err),
            })?;
        let size = response.content_length();
        Ok(RemoteFile {
            stream: Box::new(response),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    /// The memory store returns exactly what was written.
    fn memory_store_roundtrip() {
        let mut store = MemoryLocalStore::new();
        store.set_meta("root.json", b"root bytes".to_vec()).unwrap();
        store
            .set_meta("timestamp.json", b"ts bytes".to_vec())
            .unwrap();
        let meta = store.get_meta().unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta["root.json"], b"root bytes");
    }

    #[test]
    /// The file store persists blobs under their metadata names.
    fn file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = FileLocalStore::open(dir.path()).unwrap();
        assert!(store.get_meta().unwrap().is_empty());
        store.set_meta("snapshot.json", b"snap".to_vec()).unwrap();
        let meta = store.get_meta().unwrap();
        assert_eq!(meta["snapshot.json"], b"snap");

        let reopened = FileLocalStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_meta().unwrap()["snapshot.json"], b"snap");
    }

    #[test]
    /// Only the four top-level metadata names are accepted on disk.
    fn file_store_rejects_foreign_names() {
        let dir = TempDir::new().unwrap();
        let mut store = FileLocalStore::open(dir.path()).unwrap();
        let err = store.set_meta("../escape.json", b"x".to_vec()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidMetaName { .. }));
    }

    #[test]
    /// Overwriting a blob replaces the previous contents.
    fn file_store_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut store = FileLocalStore::open(dir.path()).unwrap();
        store.set_meta("root.json", b"v1".to_vec()).unwrap();
        store.set_meta("root.json", b"v2".to_vec()).unwrap();
        assert_eq!(store.get_meta().unwrap()["root.json"], b"v2");
    }
}
