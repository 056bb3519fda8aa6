//! External storage for large payload bodies.
//!
//! Payloads over the inline threshold are written here and referenced from
//! the ledger by URI. Keys are `tenant/kind/digest`, so identical bodies
//! share one object.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::records::clamp_range;

/// Byte-oriented object storage addressed by URI.
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return the object's URI. Writing the
    /// same key twice replaces the object.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;

    /// Read a whole object.
    fn get(&self, uri: &str) -> Result<Vec<u8>>;

    /// Read `[offset, offset + len)`, clamped to the object size.
    fn read_range(&self, uri: &str, offset: u64, len: u64) -> Result<Vec<u8>>;

    fn exists(&self, uri: &str) -> Result<bool>;
}

/// Build the object key for a payload.
pub fn object_key(tenant: &str, kind: &str, digest: &str) -> String {
    format!("{tenant}/{kind}/{digest}")
}

fn check_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    let clean = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(())
    } else {
        Err(StoreError::Storage(format!("invalid object key: {key:?}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem
// ─────────────────────────────────────────────────────────────────────────────

const FILE_SCHEME: &str = "file://";

/// Objects as files under a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Use `root`, creating it if missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        let raw = uri
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| StoreError::Storage(format!("not a file uri: {uri}")))?;
        let path = PathBuf::from(raw);
        let inside = path.starts_with(&self.root)
            && path
                .components()
                .all(|c| !matches!(c, Component::ParentDir));
        if inside {
            Ok(path)
        } else {
            Err(StoreError::Storage(format!(
                "object {uri} is outside {}",
                self.root.display()
            )))
        }
    }

    fn open(&self, uri: &str) -> Result<File> {
        let path = self.resolve(uri)?;
        File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::not_found("object", uri),
            _ => StoreError::Storage(format!("open {}: {e}", path.display())),
        })
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        check_key(key)?;
        let path = self.root.join(key);
        let io_err = |e: std::io::Error| StoreError::Storage(format!("write {key}: {e}"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::now_v7().simple()));
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err(e)
        })?;
        debug!(key, size = bytes.len(), "object written");
        Ok(format!("{FILE_SCHEME}{}", path.display()))
    }

    fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let mut file = self.open(uri)?;
        let mut buf = Vec::new();
        let _ = file
            .read_to_end(&mut buf)
            .map_err(|e| StoreError::Storage(format!("read {uri}: {e}")))?;
        Ok(buf)
    }

    fn read_range(&self, uri: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = self.open(uri)?;
        let io_err = |e: std::io::Error| StoreError::Storage(format!("read {uri}: {e}"));
        let size = file.metadata().map_err(io_err)?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        let _ = file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        let mut buf = Vec::new();
        let _ = file.take(len).read_to_end(&mut buf).map_err(io_err)?;
        Ok(buf)
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.resolve(uri)?.is_file())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

const MEM_SCHEME: &str = "mem://";

/// Objects held in a map. Pairs with [`MemoryLedger`](crate::memory::MemoryLedger).
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_object<T>(&self, uri: &str, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        let objects = self.objects.read();
        objects
            .get(uri)
            .map(|bytes| f(bytes))
            .ok_or_else(|| StoreError::not_found("object", uri))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        check_key(key)?;
        let uri = format!("{MEM_SCHEME}{key}");
        let _ = self.objects.write().insert(uri.clone(), bytes.to_vec());
        Ok(uri)
    }

    fn get(&self, uri: &str) -> Result<Vec<u8>> {
        self.with_object(uri, <[u8]>::to_vec)
    }

    fn read_range(&self, uri: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.with_object(uri, |bytes| {
            bytes[clamp_range(bytes.len(), offset, len)].to_vec()
        })
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(uri))
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn fs_put_get_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects")).unwrap();
        let uri = store.put("t/tool_response/abc", b"0123456789").unwrap();
        assert!(uri.starts_with("file://"));
        assert!(store.exists(&uri).unwrap());
        assert_eq!(store.get(&uri).unwrap(), b"0123456789");
        assert_eq!(store.read_range(&uri, 3, 4).unwrap(), b"3456");
        assert_eq!(store.read_range(&uri, 8, 100).unwrap(), b"89");
        assert!(store.read_range(&uri, 50, 1).unwrap().is_empty());
    }

    #[test]
    fn fs_put_overwrites_without_temp_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        store.put("t/k/d", b"first").unwrap();
        let uri = store.put("t/k/d", b"second").unwrap();
        assert_eq!(store.get(&uri).unwrap(), b"second");
        let entries: Vec<_> = fs::read_dir(store.root().join("t/k")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn fs_rejects_escaping_keys_and_uris() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("root")).unwrap();
        assert_matches!(store.put("../evil", b"x"), Err(StoreError::Storage(_)));
        assert_matches!(store.put("/abs", b"x"), Err(StoreError::Storage(_)));
        assert_matches!(store.get("file:///etc/passwd"), Err(StoreError::Storage(_)));
        assert_matches!(store.get("s3://bucket/key"), Err(StoreError::Storage(_)));
    }

    #[test]
    fn fs_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        let uri = format!("file://{}", store.root().join("nope").display());
        assert_matches!(store.get(&uri), Err(StoreError::NotFound { .. }));
        assert!(!store.exists(&uri).unwrap());
    }

    #[test]
    fn memory_store_ranges() {
        let store = MemoryObjectStore::new();
        let uri = store.put(&object_key("t", "k", "d"), b"hello").unwrap();
        assert_eq!(uri, "mem://t/k/d");
        assert_eq!(store.read_range(&uri, 1, 3).unwrap(), b"ell");
        assert_matches!(store.get("mem://missing"), Err(StoreError::NotFound { .. }));
    }
}
