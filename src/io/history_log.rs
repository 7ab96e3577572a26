//! Door history log - appends saved events and sent alerts to a file
//!
//! Lines are written in JSONL format (one JSON object per line) to the file
//! specified in config, tagged with `kind`. On startup the log is replayed
//! into the store, and retention prunes it by `savedAtSeconds`.

use crate::services::store::{EventRecord, MemoryStore, NotificationRecord};
use anyhow::Context;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum HistoryLine<'a> {
    Event {
        id: String,
        #[serde(rename = "savedAtSeconds")]
        saved_at_seconds: i64,
        #[serde(flatten)]
        record: &'a EventRecord,
    },
    Notification {
        id: String,
        #[serde(rename = "savedAtSeconds")]
        saved_at_seconds: i64,
        #[serde(flatten)]
        record: &'a NotificationRecord,
    },
}

/// Fields every line carries, read without knowing the record type
#[derive(Deserialize)]
struct LineMeta {
    kind: String,
    #[serde(rename = "buildTimestamp", default)]
    build_timestamp: String,
    #[serde(rename = "savedAtSeconds")]
    saved_at_seconds: i64,
}

#[derive(Deserialize)]
struct StoredLine<T> {
    #[serde(rename = "savedAtSeconds")]
    saved_at_seconds: i64,
    #[serde(flatten)]
    record: T,
}

/// Time-ordered id, so lines sort by write time
fn line_id() -> String {
    Uuid::now_v7().to_string()
}

/// JSONL writer. Clones share one file lock, so pruning never races an append.
#[derive(Clone)]
pub struct HistoryLog {
    file_path: String,
    lock: Arc<Mutex<()>>,
}

impl HistoryLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "history_log_initialized");
        Self { file_path: file_path.to_string(), lock: Arc::new(Mutex::new(())) }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Returns true if the line was written
    pub fn write_event(&self, record: &EventRecord, saved_at_seconds: i64) -> bool {
        let line = HistoryLine::Event { id: line_id(), saved_at_seconds, record };
        self.write_line(&line, record.build_timestamp.as_str())
    }

    pub fn write_notification(&self, record: &NotificationRecord, saved_at_seconds: i64) -> bool {
        let line = HistoryLine::Notification { id: line_id(), saved_at_seconds, record };
        self.write_line(&line, record.build_timestamp.as_str())
    }

    fn write_line(&self, line: &HistoryLine<'_>, build_timestamp: &str) -> bool {
        let result = serde_json::to_string(line)
            .map_err(std::io::Error::from)
            .and_then(|json| self.append_line(&json));
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(build_timestamp = %build_timestamp, error = %e, "history_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "history_written");

        Ok(())
    }

    /// Read the file; a missing file is an empty log
    fn read_all(&self) -> std::io::Result<String> {
        match fs::read_to_string(&self.file_path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Replay every line into `store` in write order, so the current record
    /// per device is the one that was current at shutdown. Unreadable lines
    /// are skipped. Returns the number of rows restored.
    pub fn restore_into(&self, store: &MemoryStore) -> anyhow::Result<usize> {
        let content = {
            let _guard = self.lock.lock();
            self.read_all()
                .with_context(|| format!("Failed to read history log {}", self.file_path))?
        };

        let mut restored = 0;
        let mut skipped = 0;
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            let Ok(meta) = serde_json::from_str::<LineMeta>(line) else {
                skipped += 1;
                continue;
            };
            let ok = match meta.kind.as_str() {
                "event" => serde_json::from_str::<StoredLine<EventRecord>>(line)
                    .map(|stored| store.restore_event(stored.record, stored.saved_at_seconds))
                    .is_ok(),
                "notification" => serde_json::from_str::<StoredLine<NotificationRecord>>(line)
                    .map(|stored| store.restore_notification(stored.record, stored.saved_at_seconds))
                    .is_ok(),
                _ => false,
            };
            if ok {
                restored += 1;
            } else {
                skipped += 1;
            }
        }

        if skipped > 0 {
            warn!(file = %self.file_path, skipped = %skipped, "history_lines_skipped");
        }
        info!(file = %self.file_path, rows = %restored, "history_restored");
        Ok(restored)
    }

    /// Drop lines saved before `cutoff_seconds`, count only on dry run.
    ///
    /// The newest line of each kind per device is always kept so a restart
    /// still restores the current record and the last alert.
    pub fn delete_before(&self, cutoff_seconds: i64, dry_run: bool) -> anyhow::Result<usize> {
        let _guard = self.lock.lock();
        let content = self
            .read_all()
            .with_context(|| format!("Failed to read history log {}", self.file_path))?;
        let lines: Vec<&str> = content.lines().filter(|line| !line.trim().is_empty()).collect();
        let metas: Vec<Option<LineMeta>> =
            lines.iter().map(|line| serde_json::from_str(line).ok()).collect();

        let mut newest: FxHashMap<(&str, &str), usize> = FxHashMap::default();
        for (index, meta) in metas.iter().enumerate() {
            if let Some(meta) = meta {
                newest.insert((meta.kind.as_str(), meta.build_timestamp.as_str()), index);
            }
        }

        let kept: Vec<&str> = lines
            .iter()
            .zip(&metas)
            .enumerate()
            .filter(|(index, (_, meta))| match meta {
                // Lines we cannot date are never dropped
                None => true,
                Some(meta) => {
                    meta.saved_at_seconds >= cutoff_seconds
                        || newest.get(&(meta.kind.as_str(), meta.build_timestamp.as_str()))
                            == Some(index)
                }
            })
            .map(|(_, (line, _))| *line)
            .collect();

        let deleted = lines.len() - kept.len();
        if dry_run || deleted == 0 {
            return Ok(deleted);
        }

        let tmp_path = format!("{}.tmp", self.file_path);
        let mut body = kept.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs::write(&tmp_path, body)
            .with_context(|| format!("Failed to write {tmp_path}"))?;
        fs::rename(&tmp_path, &self.file_path)
            .with_context(|| format!("Failed to replace history log {}", self.file_path))?;

        info!(file = %self.file_path, deleted = %deleted, kept = %kept.len(), "history_log_pruned");
        Ok(deleted)
    }
}
