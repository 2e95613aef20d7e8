//! Durable sweep records.
//!
//! The in-memory registry is the runtime truth; a record store only exists so
//! a restarted controller can [`restore`](crate::SweepController::restore)
//! what it was running.

use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use sw_optimizer::SweepRecord;
use sw_types::StoreError;
use tracing::{debug, warn};

/// Result alias for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace the record for `sweep_id`.
    async fn put(&self, sweep_id: &str, record: &SweepRecord) -> StoreResult<()>;

    /// Remove a record. Returns whether one existed.
    async fn delete(&self, sweep_id: &str) -> StoreResult<bool>;

    /// Every readable record, ordered by sweep id.
    async fn list(&self) -> StoreResult<Vec<SweepRecord>>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Record store that forgets everything on drop. Used in tests and sandbox runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<String, SweepRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, sweep_id: &str) -> bool {
        self.records.contains_key(sweep_id)
    }

    pub fn get(&self, sweep_id: &str) -> Option<SweepRecord> {
        self.records.get(sweep_id).map(|r| r.value().clone())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, sweep_id: &str, record: &SweepRecord) -> StoreResult<()> {
        self.records.insert(sweep_id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, sweep_id: &str) -> StoreResult<bool> {
        Ok(self.records.remove(sweep_id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<SweepRecord>> {
        let mut records: Vec<SweepRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.sweep_id().cmp(b.sweep_id()));
        Ok(records)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

/// One pretty-printed JSON document per sweep, `<dir>/<sweep_id>.json`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct JsonFileRecordStore {
    dir: PathBuf,
}

impl JsonFileRecordStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, sweep_id: &str) -> PathBuf {
        self.dir.join(format!("{sweep_id}.json"))
    }

    async fn read_record(&self, key: &str, path: &Path) -> StoreResult<SweepRecord> {
        let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            key: key.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn put(&self, sweep_id: &str, record: &SweepRecord) -> StoreResult<()> {
        let io_err = |source: std::io::Error| StoreError::Io {
            key: sweep_id.to_string(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupt {
            key: sweep_id.to_string(),
            message: e.to_string(),
        })?;

        let path = self.record_path(sweep_id);
        let tmp = self.dir.join(format!(".{sweep_id}.json.tmp"));
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        debug!(sweep_id, path = %path.display(), "record written");
        Ok(())
    }

    async fn delete(&self, sweep_id: &str) -> StoreResult<bool> {
        match tokio::fs::remove_file(self.record_path(sweep_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                key: sweep_id.to_string(),
                source,
            }),
        }
    }

    async fn list(&self) -> StoreResult<Vec<SweepRecord>> {
        let dir_key = self.dir.display().to_string();
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|source| StoreError::Io {
            key: dir_key.clone(),
            source,
        })?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            key: dir_key.clone(),
            source,
        })? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Skips temp files, which start with a dot.
            let Some(key) = name.strip_suffix(".json").filter(|k| !k.starts_with('.')) else {
                continue;
            };
            match self.read_record(key, &path).await {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping unreadable sweep record"),
            }
        }

        records.sort_by(|a, b| a.sweep_id().cmp(b.sweep_id()));
        Ok(records)
    }

    fn name(&self) -> &str {
        "json-file"
    }
}
