use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

pub const LOG_FILE: &str = "log.txt";
pub const ERROR_TRACE_FILE: &str = "error trace.json";
pub const PROBLEM_DESC_FILE: &str = "problem desc.txt";
pub const PROOF_FILE: &str = "proof.txt";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Reasons a single report event can not be applied to a job's tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestionError {
    #[error("duplicate_id: report '{0}' already exists")]
    DuplicateId(String),
    #[error("unknown_parent: '{0}' is not an open report")]
    UnknownParent(String),
    #[error("unknown_report: report '{0}' does not exist")]
    UnknownReport(String),
    #[error("already_finished: report '{0}' is already finished")]
    AlreadyFinished(String),
    #[error("not_verification: report '{0}' is not a verification report")]
    NotVerification(String),
    #[error("leaf_parent: report '{0}' is a leaf and can not have children")]
    LeafParent(String),
    #[error("attr_conflict: attribute '{name}' is already set on report '{report}'")]
    AttrConflict { report: String, name: String },
    #[error("malformed_event: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    #[error("missing_archive: '{0}' was not attached")]
    MissingArchive(String),
    #[error("authorization_error: {0}")]
    Authorization(String),
    #[error("comparison_error: {0}")]
    Comparison(String),
    #[error("state_error: {0}")]
    State(String),
    #[error("storage_error: {0}")]
    Storage(String),
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Ingestion(e) => match e {
                IngestionError::DuplicateId(_) => "duplicate_id",
                IngestionError::UnknownParent(_) => "unknown_parent",
                IngestionError::UnknownReport(_) => "unknown_report",
                IngestionError::AlreadyFinished(_) => "already_finished",
                IngestionError::NotVerification(_) => "not_verification",
                IngestionError::LeafParent(_) => "leaf_parent",
                IngestionError::AttrConflict { .. } => "attr_conflict",
                IngestionError::Malformed(_) => "malformed_event",
            },
            BridgeError::MissingArchive(_) => "missing_archive",
            BridgeError::Authorization(_) => "authorization_error",
            BridgeError::Comparison(_) => "comparison_error",
            BridgeError::State(_) => "state_error",
            BridgeError::Storage(_) => "storage_error",
        }
    }

    /// Job state and authorization failures stop the rest of a batch; every
    /// other error only rejects the event that raised it.
    pub fn aborts_batch(&self) -> bool {
        matches!(self, BridgeError::Authorization(_) | BridgeError::State(_))
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        BridgeError::Ingestion(IngestionError::Malformed(msg.into()))
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a temp file and a rename. Temp names carry a per-process
/// sequence number, so concurrent writers of one path never share a temp file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}.{}", name, pid, ts, seq));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn load_json_file(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Lookup of the binary attachments that travel with an event batch.
pub trait ArchiveResolver {
    fn resolve(&self, logical_name: &str) -> Result<Vec<u8>, BridgeError>;
}

#[derive(Debug, Clone, Default)]
pub struct Attachments {
    files: BTreeMap<String, Vec<u8>>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(name.into(), bytes);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|k| k.as_str())
    }
}

impl ArchiveResolver for Attachments {
    fn resolve(&self, logical_name: &str) -> Result<Vec<u8>, BridgeError> {
        self.files
            .get(logical_name)
            .cloned()
            .ok_or_else(|| BridgeError::MissingArchive(logical_name.to_string()))
    }
}

/// Returns the named entry when `bytes` is a ZIP archive, otherwise `bytes`
/// itself. Entries are matched by full path first, then by file name.
pub fn read_archive_entry(bytes: &[u8], entry: &str) -> Result<Vec<u8>, BridgeError> {
    if !bytes.starts_with(ZIP_MAGIC) {
        return Ok(bytes.to_vec());
    }
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| BridgeError::Storage(format!("corrupted archive: {}", e)))?;
    let mut target = None;
    for i in 0..archive.len() {
        let file = archive
            .by_index(i)
            .map_err(|e| BridgeError::Storage(format!("corrupted archive: {}", e)))?;
        let name = file.name().to_string();
        if name == entry {
            target = Some(i);
            break;
        }
        if target.is_none() && name.rsplit('/').next() == Some(entry) {
            target = Some(i);
        }
    }
    let index = target.ok_or_else(|| BridgeError::MissingArchive(entry.to_string()))?;
    let mut file = archive
        .by_index(index)
        .map_err(|e| BridgeError::Storage(format!("corrupted archive: {}", e)))?;
    let mut out = Vec::new();
    file.read_to_end(&mut out)
        .map_err(|e| BridgeError::Storage(e.to_string()))?;
    Ok(out)
}

/// Content address of a stored blob (`sha256:<hex>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(String);

impl BlobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait BlobStore: Send + Sync {
    fn store(&self, bytes: &[u8]) -> Result<BlobHandle, BridgeError>;
    fn read(&self, handle: &BlobHandle) -> Result<Vec<u8>, BridgeError>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<BlobHandle, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, bytes: &[u8]) -> Result<BlobHandle, BridgeError> {
        let handle = BlobHandle(sha256_bytes(bytes));
        self.blobs
            .write()
            .entry(handle.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(handle)
    }

    fn read(&self, handle: &BlobHandle) -> Result<Vec<u8>, BridgeError> {
        self.blobs
            .read()
            .get(handle)
            .cloned()
            .ok_or_else(|| BridgeError::Storage(format!("blob {} not found", handle)))
    }
}

/// Blobs laid out as `<root>/<first two hex chars>/<hex>`.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, handle: &BlobHandle) -> PathBuf {
        let hex = handle.hex();
        let shard = hex.get(..2).unwrap_or("00");
        self.root.join(shard).join(hex)
    }
}

impl BlobStore for DirBlobStore {
    fn store(&self, bytes: &[u8]) -> Result<BlobHandle, BridgeError> {
        let handle = BlobHandle(sha256_bytes(bytes));
        let path = self.path_for(&handle);
        if !path.exists() {
            atomic_write_bytes(&path, bytes).map_err(|e| {
                BridgeError::Storage(format!("failed to write {}: {}", path.display(), e))
            })?;
            debug!(blob = %handle, size = bytes.len(), "blob stored");
        }
        Ok(handle)
    }

    fn read(&self, handle: &BlobHandle) -> Result<Vec<u8>, BridgeError> {
        let path = self.path_for(handle);
        fs::read(&path).map_err(|e| {
            BridgeError::Storage(format!("failed to read {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .expect("start entry");
            writer.write_all(data).expect("write entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    #[test]
    fn attachments_report_missing_names() {
        let mut files = Attachments::new();
        files.insert("log.zip", b"log".to_vec());
        assert_eq!(files.resolve("log.zip").expect("present"), b"log".to_vec());
        let err = files.resolve("proof.zip").expect_err("absent");
        assert_eq!(err, BridgeError::MissingArchive("proof.zip".to_string()));
        assert_eq!(err.code(), "missing_archive");
        assert!(!err.aborts_batch());
    }

    #[test]
    fn read_archive_entry_passes_plain_bytes_through() {
        let out = read_archive_entry(b"{\"funcs\":[]}", ERROR_TRACE_FILE).expect("plain");
        assert_eq!(out, b"{\"funcs\":[]}".to_vec());
    }

    #[test]
    fn read_archive_entry_finds_nested_file_by_name() {
        let bytes = zip_with(&[
            ("other.txt", b"nope"),
            ("unsafe/error trace.json", b"{}"),
        ]);
        let out = read_archive_entry(&bytes, ERROR_TRACE_FILE).expect("entry");
        assert_eq!(out, b"{}".to_vec());
        let err = read_archive_entry(&bytes, PROOF_FILE).expect_err("missing entry");
        assert_eq!(err.code(), "missing_archive");
    }

    #[test]
    fn memory_blob_store_is_content_addressed() {
        let store = MemoryBlobStore::new();
        let a = store.store(b"same").expect("store");
        let b = store.store(b"same").expect("store");
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(store.read(&a).expect("read"), b"same".to_vec());
    }

    #[test]
    fn dir_blob_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DirBlobStore::new(dir.path().join("blobs"));
        let handle = store.store(b"payload").expect("store");
        let reopened = DirBlobStore::new(dir.path().join("blobs"));
        assert_eq!(reopened.read(&handle).expect("read"), b"payload".to_vec());
        let missing = BlobHandle(sha256_bytes(b"other"));
        assert_eq!(reopened.read(&missing).expect_err("missing").code(), "storage_error");
    }

    #[test]
    fn concurrent_writes_to_one_path_stay_whole() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("attrs.json");
        std::thread::scope(|s| {
            for n in 0..8u8 {
                let path = &path;
                s.spawn(move || {
                    for _ in 0..25 {
                        atomic_write_bytes(path, &[n; 64]).expect("write");
                    }
                });
            }
        });
        let bytes = fs::read(&path).expect("read");
        assert_eq!(bytes.len(), 64);
        assert!(bytes.iter().all(|b| *b == bytes[0]));
        assert_eq!(fs::read_dir(dir.path()).expect("list").count(), 1);
    }

    #[test]
    fn batch_abort_classification() {
        assert!(BridgeError::State("cancelled".into()).aborts_batch());
        assert!(BridgeError::Authorization("denied".into()).aborts_batch());
        let dup: BridgeError = IngestionError::DuplicateId("/a".into()).into();
        assert!(!dup.aborts_batch());
        assert_eq!(dup.to_string(), "duplicate_id: report '/a' already exists");
    }
}
