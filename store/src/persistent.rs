use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::error::StoreError;

/// A flat namespace of byte blobs keyed by `/`-separated paths, serving as
/// the sole durability substrate. Writes are durable before acknowledgement; reads
/// observe the latest durable write. There are no multi-key transactions;
/// higher layers order their writes so a single sentinel key lands last.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;
    async fn set(&self, path: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn delete(&self, path: &str) -> Result<(), StoreError>;
    /// Remove the key and everything below it. Absent paths are not an error.
    async fn recursive_delete(&self, path: &str) -> Result<(), StoreError>;
    /// Names of the immediate children below `path`.
    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn normalize(path: &str) -> String {
    let mut out = String::from("/");
    out.push_str(&segments(path).join("/"));
    out
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Map-backed store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let key = normalize(path);
        self.data
            .read()
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound(key))
    }

    async fn set(&self, path: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.data.write().insert(normalize(path), value);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let key = normalize(path);
        self.data
            .write()
            .remove(&key)
            .map(|_| ())
            .ok_or(StoreError::NotFound(key))
    }

    async fn recursive_delete(&self, path: &str) -> Result<(), StoreError> {
        let key = normalize(path);
        let prefix = if key == "/" {
            "/".to_string()
        } else {
            format!("{key}/")
        };
        self.data
            .write()
            .retain(|k, _| *k != key && !k.starts_with(&prefix));
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let key = normalize(path);
        let prefix = if key == "/" {
            "/".to_string()
        } else {
            format!("{key}/")
        };
        let data = self.data.read();
        let mut children: Vec<String> = data
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| match rest.find('/') {
                Some(i) => rest[..i].to_string(),
                None => rest.to_string(),
            })
            .collect();
        children.dedup();
        Ok(children)
    }
}

// ---------------------------------------------------------------------------
// File-backed implementation
// ---------------------------------------------------------------------------

const SEGMENT_ENCODE: &AsciiSet = &CONTROLS.add(b'/').add(b'%').add(b'\\').add(b':');

const VALUE_FILE: &str = "__value";

/// Directory-per-key store. Each key maps to a directory holding a value
/// file, so a key can have both data and children the way the layout needs.
/// Writes land in a temp file, are synced, then renamed into place.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore { root: root.into() }
    }

    fn dir_for(&self, path: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for seg in segments(path) {
            dir.push(utf8_percent_encode(seg, SEGMENT_ENCODE).to_string());
        }
        dir
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let file = self.dir_for(path).join(VALUE_FILE);
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(normalize(path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, path: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let dir = self.dir_for(path);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{VALUE_FILE}.tmp"));
        let file = dir.join(VALUE_FILE);
        {
            let mut f = tokio::fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut f, &value).await?;
            f.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &file).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let file = self.dir_for(path).join(VALUE_FILE);
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(normalize(path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recursive_delete(&self, path: &str) -> Result<(), StoreError> {
        let dir = self.dir_for(path);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Deleting "/" must leave the root usable for subsequent writes.
        if segments(path).is_empty() {
            tokio::fs::create_dir_all(&self.root).await?;
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.dir_for(path);
        let mut children = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(children),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let raw = entry.file_name();
            let raw = raw.to_string_lossy();
            children.push(percent_decode_str(&raw).decode_utf8_lossy().into_owned());
        }
        children.sort();
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn PersistentStore) {
        store.set("/Tasks/a/TaskInfo", b"a-info".to_vec()).await.unwrap();
        store.set("/Tasks/a/TaskStatus", b"a-status".to_vec()).await.unwrap();
        store.set("/Tasks/b/TaskInfo", b"b-info".to_vec()).await.unwrap();
        store.set("/FrameworkID", b"fw".to_vec()).await.unwrap();

        assert_eq!(store.get("/Tasks/a/TaskInfo").await.unwrap(), b"a-info");
        assert!(store.get("/Tasks/c/TaskInfo").await.unwrap_err().is_not_found());

        let mut tasks = store.list("/Tasks").await.unwrap();
        tasks.sort();
        assert_eq!(tasks, vec!["a".to_string(), "b".to_string()]);

        // overwrite is a plain set
        store.set("/FrameworkID", b"fw2".to_vec()).await.unwrap();
        assert_eq!(store.get("/FrameworkID").await.unwrap(), b"fw2");

        store.recursive_delete("/Tasks/a").await.unwrap();
        assert!(store.get("/Tasks/a/TaskInfo").await.unwrap_err().is_not_found());
        assert_eq!(store.list("/Tasks").await.unwrap(), vec!["b".to_string()]);

        // absent path is not an error for the recursive form
        store.recursive_delete("/Tasks/zzz").await.unwrap();

        assert!(store.delete("/Tasks/zzz").await.unwrap_err().is_not_found());

        store.recursive_delete("/").await.unwrap();
        assert!(store.get("/FrameworkID").await.unwrap_err().is_not_found());
        assert!(store.list("/Tasks").await.unwrap().is_empty());

        // the store stays usable after a full wipe
        store.set("/FrameworkID", b"fw3".to_vec()).await.unwrap();
        assert_eq!(store.get("/FrameworkID").await.unwrap(), b"fw3");
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn file_store_encodes_awkward_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .set("/Tasks/p0-0/Properties/last%2Fcheck", b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.get("/Tasks/p0-0/Properties/last%2Fcheck").await.unwrap(),
            b"x"
        );
    }
}
