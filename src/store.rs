//! Flat object storage behind the file sources.
//!
//! Paths are plain strings with no directory semantics. The trait is
//! the seam to real stores; the in-memory and local-directory
//! implementations cover tests and single-machine deployments.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing objects drive the sources' polling; everything else is
    /// terminal.
    #[error("object not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn file_exists(&self, name: &str) -> Result<bool, StoreError>;

    async fn open_object(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    async fn write_object(&self, name: &str, content: Vec<u8>) -> Result<(), StoreError>;

    /// Names starting with `prefix`, at or after `start`, sorted.
    async fn walk_from(&self, prefix: &str, start: &str) -> Result<Vec<String>, StoreError>;

    /// A bounded store holds a fixed corpus: sources treat a missing
    /// object as the end of the stream instead of polling for it.
    fn is_bounded(&self) -> bool {
        false
    }
}

/// In-memory store, bounded by default. The test workhorse.
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Arc<Vec<u8>>>>,
    bounded: bool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            bounded: true,
        })
    }

    /// A store that is still being written to: readers poll for
    /// missing objects instead of treating them as the end.
    pub fn unbounded() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            bounded: false,
        })
    }

    /// Synchronous insert for test setup.
    pub fn put(&self, name: &str, content: Vec<u8>) {
        self.objects
            .lock()
            .expect("store lock")
            .insert(name.to_string(), Arc::new(content));
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn file_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.objects.lock().expect("store lock").contains_key(name))
    }

    async fn open_object(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .expect("store lock")
            .get(name)
            .map(|content| content.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn write_object(&self, name: &str, content: Vec<u8>) -> Result<(), StoreError> {
        self.put(name, content);
        Ok(())
    }

    async fn walk_from(&self, prefix: &str, start: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .expect("store lock")
            .keys()
            .filter(|name| name.starts_with(prefix) && name.as_str() >= start)
            .cloned()
            .collect())
    }

    fn is_bounded(&self) -> bool {
        self.bounded
    }
}

/// Local-directory store using the async filesystem. Objects are plain
/// files named by their flat path.
pub struct DirStore {
    base: PathBuf,
    bounded: bool,
}

impl DirStore {
    pub fn new(base: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            base: base.into(),
            bounded: false,
        })
    }

    /// A directory holding a fixed corpus, e.g. an extracted archive.
    pub fn bounded(base: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            base: base.into(),
            bounded: true,
        })
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn file_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path_of(name)).await?)
    }

    async fn open_object(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.path_of(name)).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_object(&self, name: &str, content: Vec<u8>) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base).await?;
        tokio::fs::write(self.path_of(name), content).await?;
        Ok(())
    }

    async fn walk_from(&self, prefix: &str, start: &str) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) && name.as_str() >= start {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn is_bounded(&self) -> bool {
        self.bounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip_and_walk() {
        let store = MemoryStore::new();
        store.put("0000000100", vec![1]);
        store.put("0000000200", vec![2]);
        store.put("other-0000000100", vec![3]);

        assert!(store.file_exists("0000000100").await.unwrap());
        assert_eq!(store.open_object("0000000200").await.unwrap(), vec![2]);
        assert!(matches!(
            store.open_object("0000000300").await,
            Err(StoreError::NotFound(_))
        ));

        let walked = store.walk_from("00000", "0000000150").await.unwrap();
        assert_eq!(walked, vec!["0000000200"]);
    }

    #[tokio::test]
    async fn dir_store_round_trip_and_walk() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::bounded(dir.path());

        store
            .write_object("0000000100", vec![1, 2, 3])
            .await
            .unwrap();
        store.write_object("0000000200", vec![4]).await.unwrap();

        assert!(store.file_exists("0000000100").await.unwrap());
        assert_eq!(
            store.open_object("0000000100").await.unwrap(),
            vec![1, 2, 3]
        );
        assert!(matches!(
            store.open_object("missing").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(
            store.walk_from("", "").await.unwrap(),
            vec!["0000000100", "0000000200"]
        );
        assert!(store.is_bounded());
    }
}
