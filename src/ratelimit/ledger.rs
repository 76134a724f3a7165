//! Durable, cross-process ledger of invocation timestamps.
//!
//! The ledger is a single JSON document holding every identifier's record.
//! Writers hold an exclusive lock on a sibling `.lock` file for the whole
//! read-modify-write and replace the document by atomic rename, so readers
//! never need the lock to see a complete document.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::clock::Timestamp;
use super::identifier::IdentifierKey;
use crate::config::StoreConfig;
use crate::error::{LimiterError, Result};

/// Version of the document envelope.
const LEDGER_FORMAT: u32 = 1;
/// Version of a single identifier record.
const RECORD_VERSION: u32 = 1;

/// What a [`FileLedger::transact`] callback wants done with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerUpdate {
    /// Leave the stored record exactly as it was
    Unchanged,
    /// Store this sequence instead; an empty sequence removes the record
    Replace(Vec<Timestamp>),
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    format: u32,
    /// Records stay undecoded until touched, so one bad record does not
    /// take the other identifiers down with it.
    #[serde(default)]
    records: BTreeMap<String, Value>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            format: LEDGER_FORMAT,
            records: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LedgerRecord {
    version: u32,
    timestamps: Vec<Timestamp>,
}

/// Exclusive hold on the lock file, released on drop.
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(error = %e, "Failed to release ledger lock");
        }
    }
}

/// File-backed ledger shared by every process that opens the same path.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    poll_interval: Duration,
    /// Serializes threads of this process before they contend for the file lock
    local: Mutex<()>,
    closed: AtomicBool,
}

impl FileLedger {
    /// Open the ledger at `config.path`, creating it if absent.
    pub fn open_or_create(config: &StoreConfig) -> Result<Self> {
        let path = config.path.clone();
        let lock_path = sibling(&path, ".lock");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| unavailable(parent, "create directory", e))?;
        }

        let existed = path.exists();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| unavailable(&path, "open", e))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)
            .map_err(|e| unavailable(&lock_path, "open", e))?;

        let ledger = Self {
            path,
            lock_path,
            lock_timeout: config.lock_timeout(),
            poll_interval: config.lock_poll_interval(),
            local: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        ledger.read_document()?;

        if existed {
            debug!(path = %ledger.path.display(), "Opened ledger store");
        } else {
            info!(path = %ledger.path.display(), "Created ledger store");
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the file whose exclusive lock guards all writes.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Run `f` against the record for `key` inside the store's critical
    /// section, persisting its update before the lock is released.
    ///
    /// An absent record is passed as an empty slice. A record that fails to
    /// decode is reported as [`LimiterError::StorageCorrupt`] and `f` is not
    /// called.
    pub fn transact<F, R>(&self, key: &IdentifierKey, f: F) -> Result<R>
    where
        F: FnOnce(&[Timestamp]) -> (R, LedgerUpdate),
    {
        self.ensure_open()?;
        let deadline = Instant::now() + self.lock_timeout;

        let _local = self
            .local
            .try_lock_until(deadline)
            .ok_or_else(|| self.lock_timed_out())?;
        let _lock = self.acquire_lock(deadline)?;

        let mut document = self.read_document()?;
        let current = match document.records.get(key.as_str()) {
            Some(value) => decode_record(key, value)?,
            None => Vec::new(),
        };

        let (result, update) = f(current.as_slice());

        if let LedgerUpdate::Replace(sequence) = update {
            if sequence.is_empty() {
                document.records.remove(key.as_str());
            } else {
                document
                    .records
                    .insert(key.as_str().to_string(), encode_record(&sequence)?);
            }
            self.write_document(&document)?;
            trace!(key = %key, "Committed ledger update");
        }

        Ok(result)
    }

    /// Snapshot of the record for `key`, without taking the lock.
    pub fn inspect(&self, key: &IdentifierKey) -> Result<Vec<Timestamp>> {
        self.ensure_open()?;
        let document = self.read_document()?;
        match document.records.get(key.as_str()) {
            Some(value) => decode_record(key, value),
            None => Ok(Vec::new()),
        }
    }

    /// Remove the record for `key`; returns whether one existed.
    ///
    /// The record is not decoded, so this also clears a corrupt record.
    pub fn delete(&self, key: &IdentifierKey) -> Result<bool> {
        self.ensure_open()?;
        let deadline = Instant::now() + self.lock_timeout;

        let _local = self
            .local
            .try_lock_until(deadline)
            .ok_or_else(|| self.lock_timed_out())?;
        let _lock = self.acquire_lock(deadline)?;

        let mut document = self.read_document()?;
        let existed = document.records.remove(key.as_str()).is_some();
        if existed {
            self.write_document(&document)?;
        }
        Ok(existed)
    }

    /// Identifiers that currently have a record.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.read_document()?.records.into_keys().collect())
    }

    /// Mark the handle closed. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(path = %self.path.display(), "Closed ledger store");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LimiterError::StoreUnavailable(format!(
                "ledger handle for {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn acquire_lock(&self, deadline: Instant) -> Result<StoreLock> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)
            .map_err(|e| unavailable(&self.lock_path, "open", e))?;

        let base = self.poll_interval.as_millis() as u64;
        let mut attempts: u32 = 0;
        loop {
            match file.try_lock() {
                Ok(()) => {
                    if attempts > 0 {
                        trace!(attempts, "Acquired ledger lock after contention");
                    }
                    return Ok(StoreLock { file });
                }
                Err(TryLockError::Error(e)) => {
                    return Err(unavailable(&self.lock_path, "lock", e));
                }
                Err(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.lock_timed_out());
            }

            attempts += 1;
            let jitter = rand::thread_rng().gen_range(0..=base / 2);
            let pause = Duration::from_millis(base.saturating_add(jitter)).min(deadline - now);
            std::thread::sleep(pause);
        }
    }

    fn lock_timed_out(&self) -> LimiterError {
        warn!(
            path = %self.lock_path.display(),
            timeout_ms = self.lock_timeout.as_millis() as u64,
            "Timed out waiting for ledger lock"
        );
        LimiterError::StoreUnavailable(format!(
            "timed out after {:?} waiting for lock on {}",
            self.lock_timeout,
            self.lock_path.display()
        ))
    }

    fn read_document(&self) -> Result<LedgerDocument> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LedgerDocument::default()),
            Err(e) => return Err(unavailable(&self.path, "read", e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(LedgerDocument::default());
        }

        // Without a format marker the file is not ours; with one, anything
        // we cannot decode is a damaged or newer ledger.
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| self.not_a_ledger(e))?;
        let format = value
            .get("format")
            .and_then(Value::as_u64)
            .ok_or_else(|| self.not_a_ledger("missing ledger format marker"))?;

        if format != u64::from(LEDGER_FORMAT) {
            warn!(path = %self.path.display(), format, "Unsupported ledger format");
            return Err(LimiterError::StorageCorrupt(format!(
                "{}: unsupported ledger format {}",
                self.path.display(),
                format
            )));
        }

        LedgerDocument::deserialize(value).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Ledger document is unreadable");
            LimiterError::StorageCorrupt(format!("{}: {}", self.path.display(), e))
        })
    }

    fn not_a_ledger(&self, reason: impl std::fmt::Display) -> LimiterError {
        LimiterError::StoreUnavailable(format!(
            "{} is not a ledger store: {}",
            self.path.display(),
            reason
        ))
    }

    fn write_document(&self, document: &LedgerDocument) -> Result<()> {
        let tmp_path = sibling(&self.path, ".tmp");
        let bytes = serde_json::to_vec(document)
            .map_err(|e| LimiterError::StoreUnavailable(format!("encode ledger: {}", e)))?;

        let mut tmp = File::create(&tmp_path).map_err(|e| unavailable(&tmp_path, "create", e))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.sync_all())
            .map_err(|e| unavailable(&tmp_path, "write", e))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|e| unavailable(&self.path, "replace", e))?;
        sync_parent(&self.path)?;
        Ok(())
    }
}

fn decode_record(key: &IdentifierKey, value: &Value) -> Result<Vec<Timestamp>> {
    let record = LedgerRecord::deserialize(value).map_err(|e| {
        warn!(key = %key, error = %e, "Ledger record is unreadable");
        LimiterError::StorageCorrupt(format!("record for {:?}: {}", key.as_str(), e))
    })?;

    if record.version != RECORD_VERSION {
        return Err(LimiterError::StorageCorrupt(format!(
            "record for {:?} has unsupported version {}",
            key.as_str(),
            record.version
        )));
    }

    let mut timestamps = record.timestamps;
    timestamps.sort_unstable();
    Ok(timestamps)
}

fn encode_record(timestamps: &[Timestamp]) -> Result<Value> {
    serde_json::to_value(LedgerRecord {
        version: RECORD_VERSION,
        timestamps: timestamps.to_vec(),
    })
    .map_err(|e| LimiterError::StoreUnavailable(format!("encode record: {}", e)))
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| unavailable(parent, "sync directory", e))
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

fn unavailable(path: &Path, action: &str, err: io::Error) -> LimiterError {
    LimiterError::StoreUnavailable(format!("{} {}: {}", action, path.display(), err))
}
