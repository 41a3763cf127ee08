use crate::errors::{ToolError, ToolErrorKind};
use crate::services::logger::Logger;
use crate::utils::fs_atomic::atomic_write_text_file;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub api_name: String,
    pub endpoint_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
    pub record_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub record_count: u64,
    pub appended: u64,
    pub last_updated: String,
    pub status: SessionStatus,
}

/// Durable, append-only record stores keyed by caller-supplied session id.
/// One JSONL records file plus one atomically-replaced meta file per
/// session; the records file is the source of truth for counts, so a
/// restart never loses or invents records. Appends to the same session
/// serialize on a per-id mutex; different sessions share nothing.
pub struct SessionStore {
    logger: Logger,
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    corrupt: DashMap<String, String>,
}

impl SessionStore {
    pub fn new(logger: Logger, root: PathBuf) -> Result<Self, ToolError> {
        std::fs::create_dir_all(&root).map_err(|err| {
            storage_io(format!(
                "Failed to create session storage directory: {}",
                err
            ))
        })?;
        Ok(Self {
            logger: logger.child("sessions"),
            root,
            locks: DashMap::new(),
            corrupt: DashMap::new(),
        })
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", session_id))
    }

    fn records_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", session_id))
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn create(
        &self,
        session_id: &str,
        api_name: &str,
        endpoint_name: &str,
        description: Option<String>,
    ) -> Result<SessionMeta, ToolError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        if self.meta_path(session_id).exists() {
            return Err(ToolError::new(
                ToolErrorKind::Conflict,
                "DUPLICATE_SESSION",
                format!("Storage session already exists: {}", session_id),
            ));
        }
        let now = chrono::Utc::now().to_rfc3339();
        let meta = SessionMeta {
            session_id: session_id.to_string(),
            api_name: api_name.to_string(),
            endpoint_name: endpoint_name.to_string(),
            description,
            status: SessionStatus::Active,
            created_at: now.clone(),
            updated_at: now,
            record_count: 0,
        };
        self.write_meta(&meta)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.records_path(session_id))
            .map_err(|err| storage_io(format!("Failed to create session log: {}", err)))?;
        self.logger.info(
            "Session created",
            Some(&serde_json::json!({ "session_id": session_id })),
        );
        Ok(meta)
    }

    /// Append-only: records are written as JSONL in call order and never
    /// rewritten. The meta update follows the data write, so a crash in
    /// between under-counts and the next open recounts from the log.
    pub async fn append(
        &self,
        session_id: &str,
        records: &[Value],
    ) -> Result<SessionSummary, ToolError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut meta = self.read_meta(session_id)?;
        if meta.status == SessionStatus::Closed {
            return Err(ToolError::new(
                ToolErrorKind::Conflict,
                "SESSION_CLOSED",
                format!("Storage session is closed: {}", session_id),
            ));
        }
        let scan = self.scan_log(session_id)?;
        self.truncate_torn_tail(session_id, &scan)?;
        let existing = scan.records;

        let mut buffer = String::new();
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|err| storage_io(format!("Record is not serializable: {}", err)))?;
            buffer.push_str(&line);
            buffer.push('\n');
        }
        if !buffer.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.records_path(session_id))
                .map_err(|err| storage_io(format!("Failed to open session log: {}", err)))?;
            file.write_all(buffer.as_bytes())
                .map_err(|err| storage_io(format!("Failed to append records: {}", err)))?;
            file.sync_all()
                .map_err(|err| storage_io(format!("Failed to sync session log: {}", err)))?;
        }

        meta.record_count = (existing.len() + records.len()) as u64;
        meta.updated_at = chrono::Utc::now().to_rfc3339();
        self.write_meta(&meta)?;

        Ok(SessionSummary {
            session_id: session_id.to_string(),
            record_count: meta.record_count,
            appended: records.len() as u64,
            last_updated: meta.updated_at,
            status: meta.status,
        })
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionMeta, ToolError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        let mut meta = self.read_meta(session_id)?;
        meta.record_count = self.scan_log(session_id)?.records.len() as u64;
        Ok(meta)
    }

    pub async fn export(
        &self,
        session_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<(Vec<Value>, u64), ToolError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        self.read_meta(session_id)?;
        let records = self.scan_log(session_id)?.records;
        let total = records.len() as u64;
        let page: Vec<Value> = records
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok((page, total))
    }

    pub fn list(&self) -> Result<Vec<SessionMeta>, ToolError> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|err| storage_io(format!("Failed to list sessions: {}", err)))?;
        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<SessionMeta>(&raw).ok())
            {
                Some(meta) => sessions.push(meta),
                None => self.logger.warn(
                    "Skipping unreadable session meta",
                    Some(&serde_json::json!({ "path": path.display().to_string() })),
                ),
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    pub async fn close(&self, session_id: &str) -> Result<SessionMeta, ToolError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        let mut meta = self.read_meta(session_id)?;
        meta.status = SessionStatus::Closed;
        meta.updated_at = chrono::Utc::now().to_rfc3339();
        self.write_meta(&meta)?;
        Ok(meta)
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), ToolError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        self.read_meta(session_id)?;
        for path in [self.meta_path(session_id), self.records_path(session_id)] {
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|err| storage_io(format!("Failed to delete session: {}", err)))?;
            }
        }
        drop(_guard);
        self.locks.remove(session_id);
        self.corrupt.remove(session_id);
        Ok(())
    }

    fn read_meta(&self, session_id: &str) -> Result<SessionMeta, ToolError> {
        let path = self.meta_path(session_id);
        if !path.exists() {
            return Err(ToolError::new(
                ToolErrorKind::NotFound,
                "UNKNOWN_SESSION",
                format!("Storage session does not exist: {}", session_id),
            ));
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| storage_io(format!("Failed to read session meta: {}", err)))?;
        serde_json::from_str(&raw)
            .map_err(|err| storage_io(format!("Failed to parse session meta: {}", err)))
    }

    fn write_meta(&self, meta: &SessionMeta) -> Result<(), ToolError> {
        let data = serde_json::to_string_pretty(meta)
            .map_err(|err| storage_io(format!("Failed to serialize session meta: {}", err)))?;
        atomic_write_text_file(self.meta_path(&meta.session_id), &format!("{}\n", data), 0o600)
            .map_err(|err| storage_io(format!("Failed to save session meta: {}", err)))
    }

    /// Reads the full record log. A non-terminated final segment is a torn
    /// write from a crash: it is excluded from the valid prefix and dropped.
    /// A complete but malformed line marks the session corrupt without
    /// taking the process down.
    fn scan_log(&self, session_id: &str) -> Result<LogScan, ToolError> {
        if let Some(reason) = self.corrupt.get(session_id) {
            return Err(session_corrupt(session_id, reason.value()));
        }
        let path = self.records_path(session_id);
        if !path.exists() {
            return Ok(LogScan::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| storage_io(format!("Failed to read session log: {}", err)))?;

        let mut scan = LogScan {
            file_len: raw.len() as u64,
            ..Default::default()
        };
        let mut index = 0usize;
        for segment in raw.split_inclusive('\n') {
            let Some(line) = segment.strip_suffix('\n') else {
                // Unterminated tail: the write never completed.
                self.logger.warn(
                    "Dropping torn trailing record",
                    Some(&serde_json::json!({ "session_id": session_id })),
                );
                break;
            };
            if line.is_empty() {
                scan.valid_len += segment.len() as u64;
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => {
                    scan.records.push(value);
                    scan.valid_len += segment.len() as u64;
                    index += 1;
                }
                Err(err) => {
                    let reason = format!("Record {} is unreadable: {}", index, err);
                    self.corrupt.insert(session_id.to_string(), reason.clone());
                    self.logger.error(
                        "Session log is corrupt",
                        Some(&serde_json::json!({ "session_id": session_id })),
                    );
                    return Err(session_corrupt(session_id, &reason));
                }
            }
        }
        Ok(scan)
    }

    /// Cuts a torn tail off before appending, so the next record starts on
    /// its own line.
    fn truncate_torn_tail(&self, session_id: &str, scan: &LogScan) -> Result<(), ToolError> {
        if scan.file_len <= scan.valid_len {
            return Ok(());
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.records_path(session_id))
            .map_err(|err| storage_io(format!("Failed to open session log: {}", err)))?;
        file.set_len(scan.valid_len)
            .map_err(|err| storage_io(format!("Failed to trim torn session log: {}", err)))?;
        file.sync_all()
            .map_err(|err| storage_io(format!("Failed to sync session log: {}", err)))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LogScan {
    records: Vec<Value>,
    valid_len: u64,
    file_len: u64,
}

fn storage_io(message: String) -> ToolError {
    ToolError::new(ToolErrorKind::Internal, "STORAGE_IO", message)
}

fn session_corrupt(session_id: &str, reason: &str) -> ToolError {
    ToolError::new(
        ToolErrorKind::Internal,
        "SESSION_CORRUPT",
        format!("Storage session {} is unusable: {}", session_id, reason),
    )
    .with_hint("Export is unavailable; delete the session to recover the id.")
}
