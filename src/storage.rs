//! Persistent key-value storage for tuned parameters and program binaries.
//!
//! The engine only talks to the [`KvStorage`] trait; the embedding application
//! injects an implementation through
//! [`RuntimeConfig`](crate::runtime::RuntimeConfig). Two are provided:
//! [`MemoryStorage`] and the single-file [`FileStorage`].
//!
//! # `.fktn` File Format
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ Header     │ Entry N                                      │
//! ├────────────┼──────────────────────────────────────────────┤
//! │ "fktn"[4]  │ u64: key len │ key (UTF-8) │ u64: value len │
//! │ u64: count │ value bytes                                  │
//! └────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Files are rewritten whole on flush, through
//! a temporary file that is renamed over the original.
//!
//! Concurrent writers to one file from several processes are not supported.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use briny::prelude::*;
use parking_lot::Mutex;

use crate::error::{Error, Result};

const FKTN_MAGIC: &[u8; 4] = b"fktn";

/// Upper bound on a single key or value, guarding against corrupt lengths.
const MAX_FIELD_LEN: u64 = 64 << 20;

/// Storage for opaque byte values keyed by strings.
pub trait KvStorage: Send + Sync {
    /// Value stored under `key`.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value. Not durable
    /// until [`KvStorage::flush`].
    fn insert(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Makes every insert durable.
    fn flush(&self) -> Result<()>;
}

/// In-process storage. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of every entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries.lock().clone()
    }
}

impl KvStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn insert(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Single-file storage, loaded whole at open and rewritten on flush.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileStorage {
    /// Opens `path`, reading its entries if the file exists.
    ///
    /// # Errors
    /// Fails if the file exists but cannot be read or is not a valid store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            read_entries(&path)?
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "opened key-value file");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStorage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn insert(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let entries = self.entries.lock();
        write_entries(&self.path, &entries)
    }
}

/// One decoded entry, checked before it is trusted.
struct PackedEntry {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Validate for PackedEntry {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.key.is_empty() || core::str::from_utf8(&self.key).is_err() {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf8 = [0u8; 8];
    reader.read_exact(&mut buf8)?;
    Ok(u64::from_le_bytes(buf8))
}

fn read_field(reader: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u64(reader)?;
    if len > MAX_FIELD_LEN {
        return Err(Error::Storage(format!("field length {len} exceeds limit")));
    }
    let mut field = vec![0u8; len as usize];
    reader.read_exact(&mut field)?;
    Ok(field)
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut file = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != FKTN_MAGIC {
        return Err(Error::Storage(format!("{}: invalid magic header", path.display())));
    }

    let count = read_u64(&mut file)?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let key = read_field(&mut file)?;
        let value = read_field(&mut file)?;
        let trusted = TrustedData::new(PackedEntry { key, value })?;
        let entry = trusted.into_inner();
        let key = String::from_utf8(entry.key)
            .map_err(|_| Error::Validation("key is not UTF-8".to_string()))?;
        entries.insert(key, entry.value);
    }
    Ok(entries)
}

fn write_entries(path: &Path, entries: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    let tmp = path.with_extension("fktn.tmp");
    {
        let mut file = BufWriter::new(File::create(&tmp)?);
        file.write_all(FKTN_MAGIC)?;
        file.write_all(&(entries.len() as u64).to_le_bytes())?;
        for (key, value) in entries {
            file.write_all(&(key.len() as u64).to_le_bytes())?;
            file.write_all(key.as_bytes())?;
            file.write_all(&(value.len() as u64).to_le_bytes())?;
            file.write_all(value)?;
        }
        file.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ferrokern-{}-{name}.fktn", std::process::id()))
    }

    #[test]
    fn file_storage_survives_reopen() {
        let path = scratch("reopen");
        {
            let store = FileStorage::open(&path).unwrap();
            store.insert("a", vec![1, 2, 3]).unwrap();
            store.insert("b", Vec::new()).unwrap();
            store.flush().unwrap();
        }
        let store = FileStorage::open(&path).unwrap();
        assert_eq!(store.load("a").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.load("b").unwrap(), Some(Vec::new()));
        assert_eq!(store.load("c").unwrap(), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn unflushed_inserts_are_not_persisted() {
        let path = scratch("unflushed");
        {
            let store = FileStorage::open(&path).unwrap();
            store.insert("a", vec![9]).unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn rejects_foreign_files() {
        let path = scratch("foreign");
        std::fs::write(&path, b"bpat\x01").unwrap();
        assert!(matches!(FileStorage::open(&path), Err(Error::Storage(_))));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn memory_storage_clones_share_entries() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.insert("k", vec![7]).unwrap();
        assert_eq!(b.load("k").unwrap(), Some(vec![7]));
        assert_eq!(b.len(), 1);
    }
}
