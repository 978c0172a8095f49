//! Persistent case status and session records
//!
//! Each case record lives in its own JSON file under `<work_dir>/status/`.
//! Writes go to a private temp file that is renamed into place, so concurrent
//! readers in other processes see either the old record or the new one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::executor::case_dir_name;
use crate::models::{CaseId, SessionSummary, StatusRecord};

/// Durable per-case status records
pub trait StatusStore: Send + Sync {
    /// Replace the record for `record.id`
    fn put(&self, record: &StatusRecord) -> Result<()>;

    fn get(&self, id: &CaseId) -> Result<Option<StatusRecord>>;

    /// Every record, ordered by case id
    fn all(&self) -> Result<Vec<StatusRecord>>;
}

/// One JSON file per case
pub struct JsonStatusStore {
    dir: PathBuf,
    writes: AtomicU64,
}

impl JsonStatusStore {
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: work_dir.as_ref().join("status"),
            writes: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &CaseId) -> PathBuf {
        self.dir.join(format!("{}.json", case_dir_name(id)))
    }

    fn load_from_path(path: &Path) -> Result<StatusRecord> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open status record: {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse status record: {}", path.display()))
    }
}

impl StatusStore for JsonStatusStore {
    fn put(&self, record: &StatusRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;

        let path = self.record_path(&record.id);
        let tmp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            case_dir_name(&record.id),
            std::process::id(),
            self.writes.fetch_add(1, Ordering::Relaxed)
        ));

        let file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), record)
            .context("Failed to write status record")?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to publish status record: {}", path.display()))?;

        debug!(case = %record.id, status = %record.status_name, "Persisted status");
        Ok(())
    }

    fn get(&self, id: &CaseId) -> Result<Option<StatusRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_path(&path).map(Some)
    }

    fn all(&self) -> Result<Vec<StatusRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            if hidden || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match Self::load_from_path(&path) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// In-memory store, for dry runs and tests
#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<BTreeMap<CaseId, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusStore for MemoryStatusStore {
    fn put(&self, record: &StatusRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("status store lock poisoned"))?
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, id: &CaseId) -> Result<Option<StatusRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("status store lock poisoned"))?
            .get(id)
            .cloned())
    }

    fn all(&self) -> Result<Vec<StatusRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("status store lock poisoned"))?
            .values()
            .cloned()
            .collect())
    }
}

/// Environment information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os: String,
    pub arch: String,
    pub pid: u32,
    pub tool_version: String,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A finished session as saved to `<work_dir>/session.json`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub summary: SessionSummary,

    /// Batching strategy description
    pub strategy: String,

    pub workers: usize,

    pub environment: EnvironmentInfo,

    pub saved_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(summary: SessionSummary, strategy: impl Into<String>, workers: usize) -> Self {
        Self {
            summary,
            strategy: strategy.into(),
            workers,
            environment: EnvironmentInfo::default(),
            saved_at: Utc::now(),
        }
    }

    pub fn path(work_dir: &Path) -> PathBuf {
        work_dir.join("session.json")
    }

    pub fn save(&self, work_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create directory: {}", work_dir.display()))?;
        let path = Self::path(work_dir);
        let tmp = path.with_extension("json.tmp");

        let file = File::create(&tmp).context("Failed to create session file")?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .context("Failed to write session record")?;
        fs::rename(&tmp, &path).context("Failed to publish session record")?;

        info!("Saved session record to {}", path.display());
        Ok(path)
    }

    pub fn load(work_dir: &Path) -> Result<Self> {
        let path = Self::path(work_dir);
        let file = File::open(&path)
            .with_context(|| format!("Failed to open session record: {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file)).context("Failed to parse session record")
    }
}

/// Generate a unique session id
pub fn generate_session_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let random: u32 = rand::random::<u32>() % 10000;
    format!("{timestamp}_{random:04}")
}

/// Write records as CSV
pub fn export_csv(records: &[StatusRecord], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["id", "status", "code", "message", "last_transition"])?;

    for record in records {
        let last = record
            .timestamps
            .get(&record.status_name)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        writer.write_record([
            record.id.as_str(),
            &record.status_name.to_string(),
            &record.code.map(|c| c.to_string()).unwrap_or_default(),
            record.message.as_deref().unwrap_or(""),
            &last,
        ])?;
    }

    writer.flush()?;
    info!("Exported {} records to {}", records.len(), path.display());
    Ok(())
}
