//! Durable path-keyed embedding store.
//!
//! Two files live in the data directory.
//!
//! `embeddings.bin` holds the compacted store:
//!
//! Header (13 bytes):
//! - version: u8 (2)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! followed by `entry_count` entry frames.
//!
//! `embeddings.log` holds the changes made since the last compaction, one
//! frame per change. A change is appended and fsynced before readers can see
//! it. The log is folded into `embeddings.bin` on open and on close.
//!
//! Frame:
//! - len: u32, checksum: u32 (CRC32 of payload), payload: [u8; len]
//!
//! Entry payload:
//! - path_len: u32, path: [u8; path_len] (UTF-8)
//! - model_len: u16, model: [u8; model_len] (UTF-8)
//! - created_at: u64 (epoch millis)
//! - dimensions: u32
//! - embedding: [f32; dimensions]
//!
//! Log payloads start with an op byte: 1 = put (an entry follows),
//! 2 = remove (path_len: u32 and the path follow).
//!
//! All integers and floats are little-endian. New fields bump the version.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::lock::FileLock;

/// Current file format version
const FORMAT_VERSION: u8 = 2;

/// Header size in bytes: version(1) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 13;

/// Store file name inside the data directory
pub const STORE_FILE_NAME: &str = "embeddings.bin";

/// Change log file name inside the data directory
pub const JOURNAL_FILE_NAME: &str = "embeddings.log";

const OP_PUT: u8 = 1;
const OP_REMOVE: u8 = 2;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Store at {0} is locked by another process")]
    Locked(PathBuf),
}

/// One embedded file.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub path: String,
    pub embedding: Vec<f32>,
    /// Model that produced `embedding`
    pub model: String,
    /// Epoch millis
    pub created_at: u64,
}

impl EmbeddingRecord {
    pub fn new(path: impl Into<String>, embedding: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            embedding,
            model: model.into(),
            created_at: now_millis(),
        }
    }
}

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A single logged mutation.
#[derive(Debug)]
enum Change {
    Put(EmbeddingRecord),
    Remove(String),
}

/// Immutable view of the store contents.
///
/// Records keep their first-insertion order; overwriting a path replaces the
/// record in place. Records are shared between snapshots, so deriving the
/// next snapshot copies pointers rather than vectors.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Vec<Arc<EmbeddingRecord>>,
    positions: HashMap<String, usize>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&EmbeddingRecord> {
        self.positions.get(path).map(|&idx| &*self.records[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmbeddingRecord> {
        self.records.iter().map(Arc::as_ref)
    }

    fn upsert(&mut self, record: EmbeddingRecord) {
        match self.positions.get(&record.path) {
            Some(&idx) => self.records[idx] = Arc::new(record),
            None => {
                self.positions.insert(record.path.clone(), self.records.len());
                self.records.push(Arc::new(record));
            }
        }
    }

    fn remove_all(&mut self, doomed: &HashSet<String>) {
        self.records.retain(|r| !doomed.contains(&r.path));
        self.positions = self
            .records
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.path.clone(), idx))
            .collect();
    }

    /// Apply changes in order. Runs of removals cost one pass.
    fn apply(&mut self, changes: Vec<Change>) {
        let mut doomed = HashSet::new();
        for change in changes {
            match change {
                Change::Put(record) => {
                    if !doomed.is_empty() {
                        self.remove_all(&doomed);
                        doomed.clear();
                    }
                    self.upsert(record);
                }
                Change::Remove(path) => {
                    doomed.insert(path);
                }
            }
        }
        if !doomed.is_empty() {
            self.remove_all(&doomed);
        }
    }
}

/// Handle to an opened store.
///
/// Readers get an `Arc<Snapshot>` and never block writers for longer than a
/// pointer swap. Writers log the change durably, then publish the next
/// snapshot, so a reader sees the state before or after a write, never in
/// between.
pub struct EmbeddingStore {
    path: PathBuf,
    current: RwLock<Arc<Snapshot>>,
    /// Serializes writers
    journal: Mutex<Journal>,
    _lock: FileLock,
}

impl EmbeddingStore {
    /// Open (or create) the store inside `dir`.
    ///
    /// Changes logged by a previous run are folded into the store file.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;

        let lock = FileLock::try_acquire(dir).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                StoreError::Locked(dir.to_path_buf())
            } else {
                StoreError::Io(e)
            }
        })?;

        let path = dir.join(STORE_FILE_NAME);
        let mut snapshot = if path.exists() {
            let snapshot = read_file(&path)?;
            log::info!("Loaded {} embeddings from {}", snapshot.len(), path.display());
            snapshot
        } else {
            log::info!("No existing embeddings at {}, starting fresh", path.display());
            Snapshot::default()
        };

        let mut journal = Journal::new(dir.join(JOURNAL_FILE_NAME));
        if journal.exists() {
            let replayed = journal.replay(&mut snapshot)?;
            log::info!("Replayed {} logged changes, compacting", replayed);
            write_atomic(&path, &snapshot)?;
            journal.clear()?;
        }

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(snapshot)),
            journal: Mutex::new(journal),
            _lock: lock,
        })
    }

    /// Get the storage file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_all(&self) -> Vec<EmbeddingRecord> {
        self.snapshot().iter().cloned().collect()
    }

    pub fn get(&self, path: &str) -> Option<EmbeddingRecord> {
        self.snapshot().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Insert or replace the record for `record.path`.
    pub fn put(&self, record: EmbeddingRecord) -> Result<(), StoreError> {
        self.put_batch(vec![record])
    }

    /// Upsert several records with a single durable append.
    ///
    /// Embeddings must be finite.
    pub fn put_batch(&self, records: Vec<EmbeddingRecord>) -> Result<(), StoreError> {
        let mut journal = self.lock_journal();
        self.commit(&mut journal, records.into_iter().map(Change::Put).collect())
    }

    /// Remove the record for `path`. Returns whether one existed.
    pub fn remove(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.retain(|r| r.path != path)? > 0)
    }

    /// Keep only records matching `keep`. Returns the number removed.
    pub fn retain<F>(&self, mut keep: F) -> Result<usize, StoreError>
    where
        F: FnMut(&EmbeddingRecord) -> bool,
    {
        let mut journal = self.lock_journal();
        let doomed: Vec<Change> = self
            .snapshot()
            .iter()
            .filter(|r| !keep(*r))
            .map(|r| Change::Remove(r.path.clone()))
            .collect();
        let removed = doomed.len();
        self.commit(&mut journal, doomed)?;
        Ok(removed)
    }

    /// Compact the change log into the store file and release the store.
    pub fn close(self) -> Result<(), StoreError> {
        let mut journal = self.lock_journal();
        write_atomic(&self.path, &self.snapshot())?;
        journal.clear()
    }

    fn lock_journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log `changes`, then publish the snapshot with them applied.
    ///
    /// The caller holds the journal lock.
    fn commit(&self, journal: &mut Journal, changes: Vec<Change>) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut frames = Vec::new();
        for change in &changes {
            write_frame(&mut frames, |out| encode_change(out, change))?;
        }
        journal.append(&frames)?;

        let mut next = (*self.snapshot()).clone();
        next.apply(changes);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(())
    }
}

/// Append-only change log kept next to the store file.
struct Journal {
    path: PathBuf,
    /// Opened on first append
    file: Option<File>,
}

impl Journal {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append `frames` and fsync. A failed append is cut back off the log.
    fn append(&mut self, frames: &[u8]) -> Result<(), StoreError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        };
        let len = file.metadata()?.len();

        let written = (&file).write_all(frames).and_then(|()| file.sync_data());
        if written.is_err() {
            let _ = file.set_len(len);
        }
        self.file = Some(file);
        written.map_err(StoreError::from)
    }

    /// Fold logged changes into `snapshot`. Returns how many were applied.
    ///
    /// A damaged final frame is an append cut short by a crash; it was never
    /// acknowledged and is dropped. Damage anywhere else is an error.
    fn replay(&self, snapshot: &mut Snapshot) -> Result<usize, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut changes = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let frame = split_frame(rest)
                .and_then(|(payload, tail)| Ok((decode_change(payload)?, tail)));
            match frame {
                Ok((change, tail)) => {
                    changes.push(change);
                    rest = tail;
                }
                Err(e) if is_torn_tail(rest) => {
                    log::warn!(
                        "Dropping {} trailing bytes of {}: {}",
                        rest.len(),
                        self.path.display(),
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let applied = changes.len();
        snapshot.apply(changes);
        Ok(applied)
    }

    /// Forget every logged change once the store file holds them.
    fn clear(&mut self) -> Result<(), StoreError> {
        self.file = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `rest` is the last frame of a log, or zero fill past it.
fn is_torn_tail(rest: &[u8]) -> bool {
    if rest.iter().all(|&b| b == 0) {
        return true;
    }
    let mut decoder = Decoder::new(rest);
    match decoder.array::<4>() {
        Ok(len) => 8 + u32::from_le_bytes(len) as usize >= rest.len(),
        Err(_) => true,
    }
}

/// Write to a temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let temp_path = path.with_extension("tmp");

    if let Err(e) = write_file(&temp_path, snapshot) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn write_file(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let mut header = [0u8; HEADER_SIZE];
    header[0] = FORMAT_VERSION;
    header[1..9].copy_from_slice(&(snapshot.len() as u64).to_le_bytes());
    let checksum = crc32fast::hash(&header[0..9]);
    header[9..13].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header)?;

    let mut frame = Vec::new();
    for record in snapshot.iter() {
        frame.clear();
        write_frame(&mut frame, |out| encode_entry(out, record))?;
        writer.write_all(&frame)?;
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(())
}

fn read_file(path: &Path) -> Result<Snapshot, StoreError> {
    let bytes = std::fs::read(path)?;
    let mut decoder = Decoder::new(&bytes);

    let header: [u8; HEADER_SIZE] = decoder.array()?;
    let version = header[0];
    if version != FORMAT_VERSION {
        return Err(StoreError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut fields = Decoder::new(&header[1..]);
    let entry_count = u64::from_le_bytes(fields.array()?);
    let stored_checksum = u32::from_le_bytes(fields.array()?);
    if crc32fast::hash(&header[0..9]) != stored_checksum {
        return Err(StoreError::ChecksumMismatch);
    }

    let mut snapshot = Snapshot::default();
    for _ in 0..entry_count {
        let (payload, rest) = split_frame(decoder.bytes)?;
        decoder.bytes = rest;

        let mut entry = Decoder::new(payload);
        snapshot.upsert(decode_entry(&mut entry)?);
        entry.finish()?;
    }
    decoder.finish()?;

    Ok(snapshot)
}

/// Append one frame holding whatever `encode` writes.
fn write_frame<F>(out: &mut Vec<u8>, encode: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<(), StoreError>,
{
    let start = out.len();
    out.extend_from_slice(&[0u8; 8]);
    encode(out)?;

    let payload = &out[start + 8..];
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::InvalidFormat("entry too large".to_string()))?;
    let checksum = crc32fast::hash(payload);
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
    out[start + 4..start + 8].copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

/// Split the frame at the front of `bytes` into its payload and the rest.
fn split_frame(bytes: &[u8]) -> Result<(&[u8], &[u8]), StoreError> {
    let mut decoder = Decoder::new(bytes);
    let len = u32::from_le_bytes(decoder.array()?) as usize;
    let checksum = u32::from_le_bytes(decoder.array()?);
    let payload = decoder.take(len)?;
    if crc32fast::hash(payload) != checksum {
        return Err(StoreError::ChecksumMismatch);
    }
    Ok((payload, decoder.bytes))
}

fn encode_change(out: &mut Vec<u8>, change: &Change) -> Result<(), StoreError> {
    match change {
        Change::Put(record) => {
            out.push(OP_PUT);
            encode_entry(out, record)
        }
        Change::Remove(path) => {
            out.push(OP_REMOVE);
            encode_path(out, path)
        }
    }
}

fn decode_change(payload: &[u8]) -> Result<Change, StoreError> {
    let mut decoder = Decoder::new(payload);
    let change = match decoder.array::<1>()?[0] {
        OP_PUT => Change::Put(decode_entry(&mut decoder)?),
        OP_REMOVE => {
            let len = u32::from_le_bytes(decoder.array()?) as usize;
            Change::Remove(decoder.string(len)?)
        }
        op => return Err(StoreError::InvalidFormat(format!("unknown log op {}", op))),
    };
    decoder.finish()?;
    Ok(change)
}

fn encode_path(out: &mut Vec<u8>, path: &str) -> Result<(), StoreError> {
    let len = u32::try_from(path.len())
        .map_err(|_| StoreError::InvalidFormat(format!("path too long: {}", path)))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(path.as_bytes());
    Ok(())
}

fn encode_entry(out: &mut Vec<u8>, record: &EmbeddingRecord) -> Result<(), StoreError> {
    if record.embedding.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidFormat(format!(
            "non-finite embedding for {}",
            record.path
        )));
    }
    let model = record.model.as_bytes();
    let model_len = u16::try_from(model.len())
        .map_err(|_| StoreError::InvalidFormat(format!("model name too long: {}", record.model)))?;
    let dims = u32::try_from(record.embedding.len())
        .map_err(|_| StoreError::InvalidFormat("embedding too long".to_string()))?;

    encode_path(out, &record.path)?;
    out.extend_from_slice(&model_len.to_le_bytes());
    out.extend_from_slice(model);
    out.extend_from_slice(&record.created_at.to_le_bytes());
    out.extend_from_slice(&dims.to_le_bytes());
    for &value in &record.embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }

    Ok(())
}

fn decode_entry(decoder: &mut Decoder<'_>) -> Result<EmbeddingRecord, StoreError> {
    let path_len = u32::from_le_bytes(decoder.array()?) as usize;
    let path = decoder.string(path_len)?;

    let model_len = u16::from_le_bytes(decoder.array()?) as usize;
    let model = decoder.string(model_len)?;

    let created_at = u64::from_le_bytes(decoder.array()?);

    let dims = u32::from_le_bytes(decoder.array()?) as usize;
    let raw = decoder.take(dims.saturating_mul(4))?;
    let embedding: Vec<f32> = raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidFormat(format!(
            "non-finite embedding for {}",
            path
        )));
    }

    Ok(EmbeddingRecord {
        path,
        embedding,
        model,
        created_at,
    })
}

/// Bounds-checked cursor over bytes already in memory.
struct Decoder<'a> {
    bytes: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        if self.bytes.len() < n {
            return Err(StoreError::InvalidFormat(format!(
                "need {} bytes, {} left",
                n,
                self.bytes.len()
            )));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], StoreError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn string(&mut self, len: usize) -> Result<String, StoreError> {
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|e| StoreError::InvalidFormat(format!("invalid utf-8: {}", e)))
    }

    fn finish(self) -> Result<(), StoreError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(StoreError::InvalidFormat(format!(
                "{} unexpected trailing bytes",
                self.bytes.len()
            )))
        }
    }
}
