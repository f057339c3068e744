use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::BosunError;

/// Atomic counter for unique output identifiers (same pattern as the
/// execution id mint).
static OUTPUT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Kind of captured output a stored file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Stdout,
    Stderr,
    Combined,
    Log,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Combined => "combined",
            Self::Log => "log",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Log => "log",
            _ => "out",
        }
    }
}

/// Snapshot of one stored capture file. Handed out by value; callers never
/// hold references into the index.
#[derive(Debug, Clone, Serialize)]
pub struct OutputFileInfo {
    pub output_id: String,
    pub output_type: OutputType,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub execution_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputReadResult {
    pub output_id: String,
    pub content: String,
    pub size: usize,
    pub total_size: u64,
    pub is_truncated: bool,
    pub encoding: String,
}

#[derive(Debug, Default, Clone)]
pub struct OutputListFilter {
    pub output_type: Option<OutputType>,
    pub execution_id: Option<String>,
    pub name_pattern: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

#[derive(Debug, Serialize)]
pub struct DeleteFailure {
    pub output_id: String,
    pub reason: String,
}

/// Content-addressed store for command output captures. Files live under
/// `<base>/output`, `<base>/log`, `<base>/temp`; the in-memory index is the
/// authority for lookups and is capped at `max_files` with oldest-first
/// eviction.
pub struct OutputStore {
    base_dir: PathBuf,
    max_files: usize,
    index: Mutex<HashMap<String, OutputFileInfo>>,
}

impl OutputStore {
    pub fn new(base_dir: PathBuf, max_files: usize) -> std::io::Result<Self> {
        for sub in ["output", "log", "temp"] {
            std::fs::create_dir_all(base_dir.join(sub))?;
        }
        Ok(Self {
            base_dir,
            max_files: max_files.max(1),
            index: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("log")
    }

    fn mint_id() -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = OUTPUT_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("out_{ts:x}_{seq}")
    }

    /// Write `content` atomically (temp + rename) and register the result.
    pub async fn create(
        &self,
        content: &[u8],
        output_type: OutputType,
        execution_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<String, BosunError> {
        let output_id = Self::mint_id();
        let subdir = match output_type {
            OutputType::Log => "log",
            _ => "output",
        };
        let filename = format!("{}_{}.{}", output_type.as_str(), output_id, output_type.extension());
        let path = self.base_dir.join(subdir).join(&filename);

        // Atomic write: temp file + rename prevents partial reads.
        let tmp_path = self.base_dir.join("temp").join(format!("{filename}.tmp"));
        tokio::fs::write(&tmp_path, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        self.register_info(OutputFileInfo {
            output_id: output_id.clone(),
            output_type,
            path,
            size_bytes: content.len() as u64,
            created_at: Utc::now(),
            execution_id: execution_id.map(str::to_string),
            name: name.map(str::to_string),
        })
        .await;

        Ok(output_id)
    }

    /// Register an already-written file (e.g. a saved terminal history).
    pub async fn register(
        &self,
        path: PathBuf,
        output_type: OutputType,
        execution_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<String, BosunError> {
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        let output_id = Self::mint_id();
        self.register_info(OutputFileInfo {
            output_id: output_id.clone(),
            output_type,
            path,
            size_bytes,
            created_at: Utc::now(),
            execution_id: execution_id.map(str::to_string),
            name: name.map(str::to_string),
        })
        .await;
        Ok(output_id)
    }

    async fn register_info(&self, info: OutputFileInfo) {
        let evicted: Vec<OutputFileInfo> = {
            let mut index = self.index.lock().expect("output index poisoned");
            let mut evicted = Vec::new();
            if index.len() >= self.max_files {
                let excess = index.len() + 1 - self.max_files;
                let mut by_age: Vec<(String, DateTime<Utc>)> = index
                    .iter()
                    .map(|(id, i)| (id.clone(), i.created_at))
                    .collect();
                by_age.sort_by_key(|(_, created)| *created);
                for (id, _) in by_age.into_iter().take(excess) {
                    if let Some(old) = index.remove(&id) {
                        evicted.push(old);
                    }
                }
            }
            index.insert(info.output_id.clone(), info);
            evicted
        };

        // Best-effort file removal outside the lock; failures are logged and
        // non-fatal to the caller.
        for old in evicted {
            tracing::info!(output_id = %old.output_id, "evicting oldest output file");
            if let Err(e) = tokio::fs::remove_file(&old.path).await {
                tracing::warn!(output_id = %old.output_id, "eviction unlink failed: {e}");
            }
        }
    }

    pub fn get(&self, output_id: &str) -> Result<OutputFileInfo, BosunError> {
        self.index
            .lock()
            .expect("output index poisoned")
            .get(output_id)
            .cloned()
            .ok_or_else(|| BosunError::NotFound {
                kind: "output",
                id: output_id.to_string(),
            })
    }

    /// Random-access read of a stored capture. `is_truncated` is true when
    /// `offset + size` leaves bytes unread.
    pub async fn read(
        &self,
        output_id: &str,
        offset: u64,
        size: usize,
        encoding: &str,
    ) -> Result<OutputReadResult, BosunError> {
        let info = self.get(output_id)?;
        let bytes = tokio::fs::read(&info.path).await?;
        let total_size = bytes.len() as u64;
        let start = (offset.min(total_size)) as usize;
        let end = start.saturating_add(size).min(bytes.len());
        let slice = &bytes[start..end];

        let content = match encoding.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => String::from_utf8_lossy(slice).to_string(),
            "hex" => slice.iter().map(|b| format!("{b:02x}")).collect(),
            other => {
                return Err(BosunError::InvalidArgument(format!(
                    "unsupported encoding: {other} (expected utf-8 or hex)"
                )));
            }
        };

        Ok(OutputReadResult {
            output_id: output_id.to_string(),
            content,
            size: slice.len(),
            total_size,
            is_truncated: offset + (size as u64) < total_size,
            encoding: encoding.to_string(),
        })
    }

    /// List stored files newest-first, with optional filters.
    pub fn list(&self, filter: &OutputListFilter) -> (Vec<OutputFileInfo>, usize) {
        let index = self.index.lock().expect("output index poisoned");
        let mut files: Vec<OutputFileInfo> = index
            .values()
            .filter(|info| {
                filter
                    .output_type
                    .is_none_or(|t| info.output_type == t)
            })
            .filter(|info| {
                filter
                    .execution_id
                    .as_deref()
                    .is_none_or(|eid| info.execution_id.as_deref() == Some(eid))
            })
            .filter(|info| {
                filter.name_pattern.as_deref().is_none_or(|pat| {
                    info.name
                        .as_deref()
                        .unwrap_or(&info.output_id)
                        .contains(pat)
                })
            })
            .cloned()
            .collect();
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total_count = files.len();
        if let Some(limit) = filter.limit {
            files.truncate(limit);
        }
        (files, total_count)
    }

    /// Delete stored captures. Requires the explicit confirm flag; without it
    /// nothing is removed.
    pub async fn delete(
        &self,
        output_ids: &[String],
        confirm: bool,
    ) -> Result<DeleteOutcome, BosunError> {
        if !confirm {
            return Err(BosunError::InvalidArgument(
                "delete requires confirm=true".to_string(),
            ));
        }

        let mut outcome = DeleteOutcome {
            deleted: Vec::new(),
            failed: Vec::new(),
        };
        for id in output_ids {
            let removed = {
                let mut index = self.index.lock().expect("output index poisoned");
                index.remove(id)
            };
            match removed {
                Some(info) => {
                    if let Err(e) = tokio::fs::remove_file(&info.path).await {
                        // Index entry is already gone; report the unlink error.
                        tracing::warn!(output_id = %id, "delete unlink failed: {e}");
                        outcome.failed.push(DeleteFailure {
                            output_id: id.clone(),
                            reason: "file removal failed".to_string(),
                        });
                    } else {
                        outcome.deleted.push(id.clone());
                    }
                }
                None => outcome.failed.push(DeleteFailure {
                    output_id: id.clone(),
                    reason: "not found".to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    pub fn len(&self) -> usize {
        self.index.lock().expect("output index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
