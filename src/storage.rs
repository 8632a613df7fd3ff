//! Record Storage
//!
//! Append-only storage for accepted payloads. Records are only ever created;
//! nothing in the relay updates or deletes them.
//!
//! Backends:
//! - in-memory (for testing and development)
//! - SQLite (for production)
//! - JSON file: one pretty-printed array, rewritten on every insert

use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{self, Frame, Payload, IDENTITY_FIELD, TIMESTAMP_FIELD};

/// Current time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid database url: {0}")]
    InvalidUrl(String),
}

/// A persisted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Unique record ID.
    pub id: String,
    /// Unix milliseconds; the client's value if it sent one.
    pub timestamp: u64,
    /// Originating identity, if known.
    pub identity: Option<String>,
    pub payload: Payload,
}

/// Entry returned by [`RecordStore::list_recent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub timestamp: u64,
    pub name: Option<String>,
}

impl Record {
    /// Creates a record, stamping it with the current time if `timestamp` is None.
    pub fn new(payload: Payload, timestamp: Option<u64>, identity: Option<String>) -> Self {
        Record {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: timestamp.unwrap_or_else(now_millis),
            identity,
            payload,
        }
    }

    /// Builds a record from a decoded frame.
    ///
    /// `verified_identity` is the identity the registry bound to the
    /// connection; when present it replaces whatever the client put in the frame.
    pub fn from_frame(frame: Frame, verified_identity: Option<&str>) -> Self {
        let identity = verified_identity.map(str::to_string).or(frame.identity);
        Record::new(frame.payload, frame.timestamp, identity)
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            timestamp: self.timestamp,
            name: self.payload.name().map(str::to_string),
        }
    }

    /// The stored document: payload fields plus `id`, `timestamp` and `mac`.
    pub fn to_document(&self) -> Value {
        let mut doc = self.payload.to_fields();
        doc.insert("id".to_string(), Value::String(self.id.clone()));
        doc.insert(TIMESTAMP_FIELD.to_string(), Value::from(self.timestamp));
        if let Some(identity) = &self.identity {
            doc.insert(IDENTITY_FIELD.to_string(), Value::String(identity.clone()));
        }
        Value::Object(doc)
    }

    /// Parses a stored document back into a record.
    pub fn from_document(doc: Value) -> Result<Self, StoreError> {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Corrupt("missing id".to_string()))?;
        let frame = protocol::decode_value(doc).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let timestamp = frame
            .timestamp
            .ok_or_else(|| StoreError::Corrupt(format!("record {} has no timestamp", id)))?;
        Ok(Record {
            id,
            timestamp,
            identity: frame.identity,
            payload: frame.payload,
        })
    }
}

/// Trait for record storage backends.
pub trait RecordStore: Send + Sync {
    /// Appends one record.
    fn insert(&self, record: &Record) -> Result<(), StoreError>;

    /// Newest records first, at most `limit` of them.
    fn list_recent(&self, limit: usize) -> Result<Vec<RecordSummary>, StoreError>;

    /// The first record stored with exactly this timestamp.
    fn get_by_timestamp(&self, timestamp: u64) -> Result<Option<Record>, StoreError>;

    /// Total number of stored records.
    fn record_count(&self) -> Result<usize, StoreError>;
}

/// Sorts newest first, keeping later inserts ahead on equal timestamps.
fn recent_summaries(records: &[Record], limit: usize) -> Vec<RecordSummary> {
    let mut indexed: Vec<(usize, &Record)> = records.iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
    indexed
        .into_iter()
        .take(limit)
        .map(|(_, r)| r.summary())
        .collect()
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory record storage, lost on restart.
pub struct MemoryRecordStore {
    records: RwLock<Vec<Record>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        MemoryRecordStore {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Copies of every stored record in insertion order.
    pub fn all(&self) -> Vec<Record> {
        self.records
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&self, record: &Record) -> Result<(), StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        records.push(record.clone());
        Ok(())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<RecordSummary>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(recent_summaries(&records, limit))
    }

    fn get_by_timestamp(&self, timestamp: u64) -> Result<Option<Record>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(records.iter().find(|r| r.timestamp == timestamp).cloned())
    }

    fn record_count(&self) -> Result<usize, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(records.len())
    }
}

// ============================================================================
// SQLite Storage
// ============================================================================

/// SQLite-backed persistent record storage.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp INTEGER NOT NULL,
                shape TEXT NOT NULL,
                identity TEXT,
                name TEXT,
                document TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_timestamp ON records(timestamp)",
            [],
        )?;

        Ok(SqliteRecordStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert(&self, record: &Record) -> Result<(), StoreError> {
        let timestamp = i64::try_from(record.timestamp).map_err(|_| {
            StoreError::Corrupt(format!("timestamp {} out of range", record.timestamp))
        })?;
        let document = serde_json::to_string(&record.to_document())?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO records (id, timestamp, shape, identity, name, document)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                timestamp,
                record.payload.shape().as_str(),
                record.identity,
                record.payload.name(),
                document
            ],
        )?;
        Ok(())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<RecordSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, name FROM records
             ORDER BY timestamp DESC, seq DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RecordSummary {
                timestamp: row.get::<_, i64>(0)? as u64,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_by_timestamp(&self, timestamp: u64) -> Result<Option<Record>, StoreError> {
        let Ok(timestamp) = i64::try_from(timestamp) else {
            return Ok(None);
        };
        let document: Option<String> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT document FROM records WHERE timestamp = ?1 ORDER BY seq ASC LIMIT 1",
                params![timestamp],
                |row| row.get(0),
            )
            .optional()?
        };
        match document {
            Some(text) => Ok(Some(Record::from_document(serde_json::from_str(&text)?)?)),
            None => Ok(None),
        }
    }

    fn record_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ============================================================================
// JSON File Storage
// ============================================================================

/// Stores every record in a single JSON array file.
///
/// Each insert reads the whole file, appends and rewrites it. Only suitable
/// for small data sets.
pub struct JsonFileRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileRecordStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        JsonFileRecordStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_documents(&self) -> Result<Vec<Value>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn read_records(&self) -> Result<Vec<Record>, StoreError> {
        self.read_documents()?
            .into_iter()
            .map(Record::from_document)
            .collect()
    }

    /// Sibling file the new contents are written to before replacing the original.
    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Replaces the file in one rename so a crash never leaves it truncated.
    fn write_documents(&self, documents: &[Value]) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(documents)?;
        let staging = self.staging_path();
        std::fs::write(&staging, contents)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock
            .lock()
            .map_err(|_| StoreError::Unavailable("file lock poisoned".to_string()))
    }
}

impl RecordStore for JsonFileRecordStore {
    fn insert(&self, record: &Record) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let mut documents = self.read_documents()?;
        documents.push(record.to_document());
        self.write_documents(&documents)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<RecordSummary>, StoreError> {
        let _guard = self.guard()?;
        Ok(recent_summaries(&self.read_records()?, limit))
    }

    fn get_by_timestamp(&self, timestamp: u64) -> Result<Option<Record>, StoreError> {
        let _guard = self.guard()?;
        Ok(self
            .read_records()?
            .into_iter()
            .find(|r| r.timestamp == timestamp))
    }

    fn record_count(&self) -> Result<usize, StoreError> {
        let _guard = self.guard()?;
        Ok(self.read_documents()?.len())
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Where records are stored, parsed from a database URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// `memory://`
    Memory,
    /// `sqlite://<path>`
    Sqlite(PathBuf),
    /// `json://<path>`
    JsonFile(PathBuf),
}

impl StoreLocation {
    pub fn parse(url: &str) -> Result<Self, StoreError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| StoreError::InvalidUrl(url.to_string()))?;
        match scheme.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreLocation::Memory),
            "sqlite" if !rest.is_empty() => Ok(StoreLocation::Sqlite(PathBuf::from(rest))),
            "json" if !rest.is_empty() => Ok(StoreLocation::JsonFile(PathBuf::from(rest))),
            _ => Err(StoreError::InvalidUrl(url.to_string())),
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Creates a record store for the given location.
pub fn create_record_store(location: &StoreLocation) -> Result<Box<dyn RecordStore>, StoreError> {
    match location {
        StoreLocation::Memory => Ok(Box::new(MemoryRecordStore::new())),
        StoreLocation::Sqlite(path) => {
            ensure_parent_dir(path)?;
            Ok(Box::new(SqliteRecordStore::open(path)?))
        }
        StoreLocation::JsonFile(path) => {
            ensure_parent_dir(path)?;
            Ok(Box::new(JsonFileRecordStore::new(path.clone())))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
