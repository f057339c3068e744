use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One appended record of a command decision and outcome. Synthetic entries
/// (user confirmations) carry a marker in `command` and `executed = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub execution_id: String,
    pub command: String,
    pub working_directory: String,
    pub timestamp: DateTime<Utc>,
    pub executed: bool,
    /// Matched pattern tags and/or evaluator classification.
    pub classification: Option<String>,
    /// Final admission decision ("allow", "deny", ...).
    pub decision: Option<String>,
    pub output_summary: Option<String>,
}

/// Append-only command history. The in-memory tail is authoritative for
/// evaluator context; the jsonl mirror is best-effort and never surfaces
/// failures to the caller.
pub struct HistoryLog {
    entries: Mutex<VecDeque<HistoryEntry>>,
    cap: usize,
    mirror_path: Option<PathBuf>,
}

impl HistoryLog {
    pub fn new(cap: usize, mirror_path: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(cap.min(64))),
            cap: cap.max(1),
            mirror_path,
        }
    }

    pub fn append(&self, entry: HistoryEntry) {
        {
            let mut entries = self.entries.lock().expect("history lock poisoned");
            if entries.len() == self.cap {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        if let Some(path) = self.mirror_path.clone() {
            // Fire-and-forget mirror append; the in-memory tail stays
            // authoritative when the disk write fails.
            tokio::spawn(async move {
                if let Err(e) = append_jsonl(&path, &entry).await {
                    tracing::warn!("history mirror append failed: {e}");
                }
            });
        }
    }

    /// Newest-first query with optional keyword and time filters.
    pub fn search(
        &self,
        limit: usize,
        keywords: Option<&[String]>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().expect("history lock poisoned");
        entries
            .iter()
            .rev()
            .filter(|e| since.is_none_or(|t| e.timestamp >= t))
            .filter(|e| {
                keywords.is_none_or(|kws| {
                    kws.is_empty()
                        || kws.iter().any(|kw| {
                            let kw = kw.to_lowercase();
                            e.command.to_lowercase().contains(&kw)
                                || e.output_summary
                                    .as_deref()
                                    .is_some_and(|s| s.to_lowercase().contains(&kw))
                        })
                })
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries most similar to `command`, scored by shared-token overlap.
    pub fn find_similar(&self, command: &str, limit: usize) -> Vec<HistoryEntry> {
        let target: Vec<String> = tokenize(command);
        if target.is_empty() {
            return Vec::new();
        }
        let entries = self.entries.lock().expect("history lock poisoned");
        let mut scored: Vec<(usize, HistoryEntry)> = entries
            .iter()
            .rev()
            .filter_map(|e| {
                let tokens = tokenize(&e.command);
                let overlap = target.iter().filter(|t| tokens.contains(t)).count();
                (overlap > 0).then(|| (overlap, e.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, e)| e).collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        self.search(limit, None, None)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tokenize(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

async fn append_jsonl(path: &PathBuf, entry: &HistoryEntry) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}
