//! Pre-migration document backups.
//!
//! The migrator hands a document's current payload to a [`BackupWriter`]
//! before the first change is applied. Backups are best effort: the migrator
//! logs and ignores write failures.

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Backup errors.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded store error.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Entry encoding error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Destination for document backups.
pub trait BackupWriter: Send + Sync {
    /// Store a payload under `name`.
    fn write(&self, name: &str, payload: &[u8]) -> Result<(), BackupError>;
}

impl<W: BackupWriter + ?Sized> BackupWriter for Arc<W> {
    fn write(&self, name: &str, payload: &[u8]) -> Result<(), BackupError> {
        (**self).write(name, payload)
    }
}

/// Backup name for a document at the version it is migrated from.
///
/// Characters of the id that are unsafe in file names are replaced by `_`.
pub fn backup_name(type_name: &str, id: &str, from_version: i64) -> String {
    let id: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}_{}.bak", type_name, id, from_version)
}

/// Discards backups.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackupWriter;

impl BackupWriter for NullBackupWriter {
    fn write(&self, _name: &str, _payload: &[u8]) -> Result<(), BackupError> {
        Ok(())
    }
}

/// Keeps backups in memory.
#[derive(Debug, Default)]
pub struct MemoryBackupWriter {
    entries: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryBackupWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backups written so far, in write order.
    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.entries.lock().clone()
    }
}

impl BackupWriter for MemoryBackupWriter {
    fn write(&self, name: &str, payload: &[u8]) -> Result<(), BackupError> {
        self.entries.lock().push((name.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Writes one file per backup into a directory.
#[derive(Debug, Clone)]
pub struct FileBackupWriter {
    dir: PathBuf,
}

impl FileBackupWriter {
    /// Create the writer, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, BackupError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BackupWriter for FileBackupWriter {
    fn write(&self, name: &str, payload: &[u8]) -> Result<(), BackupError> {
        fs::write(self.dir.join(name), payload)?;
        Ok(())
    }
}

/// Gzip-compresses payloads before handing them to another writer.
///
/// Names get a `.gz` suffix.
#[derive(Debug, Clone)]
pub struct GzipBackupWriter<W> {
    inner: W,
    level: Compression,
}

impl<W: BackupWriter> GzipBackupWriter<W> {
    /// Wrap a writer with default compression.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            level: Compression::default(),
        }
    }

    /// Set the compression level (0-9).
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }
}

impl<W: BackupWriter> BackupWriter for GzipBackupWriter<W> {
    fn write(&self, name: &str, payload: &[u8]) -> Result<(), BackupError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;
        self.inner.write(&format!("{}.gz", name), &compressed)
    }
}

/// A backup stored in the embedded backup tree.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Backup name.
    pub name: String,
    /// Document payload.
    pub payload: Vec<u8>,
    /// When the backup was taken (microseconds since the epoch).
    pub created_at: i64,
}

impl BackupEntry {
    /// Serialize the entry.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BackupError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| BackupError::Serialization(e.to_string()))
    }

    /// Deserialize an entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BackupError> {
        // sled values carry no alignment guarantee
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| BackupError::Serialization(e.to_string()))
    }
}

/// Stores backups in a sled tree.
pub struct SledBackupWriter {
    tree: sled::Tree,
}

impl SledBackupWriter {
    /// Tree name for document backups.
    pub const TREE_NAME: &'static str = "backup:documents";

    /// Open or create the backup tree.
    pub fn open(db: &sled::Db) -> Result<Self, BackupError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Load a backup by name.
    pub fn load(&self, name: &str) -> Result<Option<BackupEntry>, BackupError> {
        match self.tree.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(BackupEntry::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Names of all stored backups, in key order.
    pub fn names(&self) -> Result<Vec<String>, BackupError> {
        let mut names = Vec::new();
        for result in self.tree.iter() {
            let (key, _) = result?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), BackupError> {
        self.tree.flush()?;
        Ok(())
    }
}

impl BackupWriter for SledBackupWriter {
    fn write(&self, name: &str, payload: &[u8]) -> Result<(), BackupError> {
        let entry = BackupEntry {
            name: name.to_string(),
            payload: payload.to_vec(),
            created_at: Utc::now().timestamp_micros(),
        };
        self.tree.insert(name.as_bytes(), entry.to_bytes()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_backup_name() {
        assert_eq!(backup_name("Entity", "e-1", 0), "Entity_e-1_0.bak");
        assert_eq!(backup_name("Entity", "a/b:c", 3), "Entity_a_b_c_3.bak");
    }

    #[test]
    fn test_file_backup_writer() {
        let dir = tempdir().unwrap();
        let writer = FileBackupWriter::new(dir.path().join("backups")).unwrap();

        writer.write("Entity_e1_0.bak", b"{\"a\":1}").unwrap();

        let written = fs::read(writer.dir().join("Entity_e1_0.bak")).unwrap();
        assert_eq!(written, b"{\"a\":1}");
    }

    #[test]
    fn test_gzip_backup_writer() {
        let memory = Arc::new(MemoryBackupWriter::new());
        let writer = GzipBackupWriter::new(Arc::clone(&memory)).with_level(9);

        writer.write("Entity_e1_0.bak", b"payload payload payload").unwrap();

        let entries = memory.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "Entity_e1_0.bak.gz");

        let mut decoded = String::new();
        GzDecoder::new(entries[0].1.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "payload payload payload");
    }

    #[test]
    fn test_sled_backup_writer() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let writer = SledBackupWriter::open(&db).unwrap();

        writer.write("Entity_e2_1.bak", b"second").unwrap();
        writer.write("Entity_e1_0.bak", b"first").unwrap();
        writer.flush().unwrap();

        let entry = writer.load("Entity_e1_0.bak").unwrap().unwrap();
        assert_eq!(entry.payload, b"first");
        assert!(entry.created_at > 0);
        assert!(writer.load("missing").unwrap().is_none());
        assert_eq!(
            writer.names().unwrap(),
            vec!["Entity_e1_0.bak".to_string(), "Entity_e2_1.bak".to_string()]
        );
    }

    #[test]
    fn test_backup_entry_roundtrip_unaligned() {
        let entry = BackupEntry {
            name: "x".to_string(),
            payload: vec![1, 2, 3],
            created_at: 42,
        };
        let mut bytes = vec![0u8];
        bytes.extend(entry.to_bytes().unwrap());

        assert_eq!(BackupEntry::from_bytes(&bytes[1..]).unwrap(), entry);
    }
}
