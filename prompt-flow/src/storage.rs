use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::models::InsuranceRecord;

/// Append-only store of insurance records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append(&self, record: InsuranceRecord) -> Result<()>;
    /// Every record, in append order.
    async fn list_all(&self) -> Result<Vec<InsuranceRecord>>;
}

/// Progress of one multi-turn audio report. Only answered question indices are
/// kept; transcripts are returned to the caller and never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecklistSession {
    pub id: String,
    /// Indices of checklist questions answered so far.
    pub answered: BTreeSet<usize>,
}

impl ChecklistSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }

    /// Merge the questions a turn answered. Returns how many were new.
    pub fn absorb(&mut self, answered: &BTreeSet<usize>) -> usize {
        let before = self.answered.len();
        self.answered.extend(answered.iter().copied());
        self.answered.len() - before
    }
}

/// Trait for storing and retrieving checklist sessions
#[async_trait]
pub trait ChecklistSessionStore: Send + Sync {
    async fn save(&self, session: ChecklistSession) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<ChecklistSession>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// In-memory implementation of RecordStore
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<Vec<InsuranceRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn append(&self, record: InsuranceRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<InsuranceRecord>> {
        Ok(self.records.read().await.clone())
    }
}

/// Records kept as one JSON array in a file.
///
/// Reads see either the old or the new file: writes go to a sibling temp file
/// that is renamed into place. Appends within a process are serialized, so
/// concurrent saves cannot drop each other's records.
pub struct JsonFileRecordStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_records(&self) -> Result<Vec<InsuranceRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            FlowError::Storage(format!(
                "{} is not a JSON array of records: {e}",
                self.path.display()
            ))
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn append(&self, record: InsuranceRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.read_records().await?;
        records.push(record);

        let body = serde_json::to_vec_pretty(&records)
            .map_err(|e| FlowError::Storage(format!("failed to serialize records: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, body).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        info!(path = %self.path.display(), total = records.len(), "Insurance record appended");
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<InsuranceRecord>> {
        let records = self.read_records().await?;
        debug!(path = %self.path.display(), total = records.len(), "Insurance records loaded");
        Ok(records)
    }
}

/// In-memory implementation of ChecklistSessionStore
pub struct InMemoryChecklistSessionStore {
    sessions: Arc<DashMap<String, ChecklistSession>>,
}

impl InMemoryChecklistSessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryChecklistSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChecklistSessionStore for InMemoryChecklistSessionStore {
    async fn save(&self, session: ChecklistSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ChecklistSession>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }
}
