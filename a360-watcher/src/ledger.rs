//! Append-only JSONL ledgers
//!
//! Two best-effort audit trails sit beside the live event channel: a watcher
//! event log (debugging, auditing) and an ML-ready dataset index with one
//! record per stored image. Ledger failures are logged and never fail
//! ingestion; the filesystem and registry remain the durable state.

use a360_common::events::WatcherEvent;
use a360_common::subject::{AgeLabel, SubjectId, SubjectRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Labels denormalized into dataset-index records
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLabels {
    pub sex: String,
    pub ethnicity_group: String,
    pub fitzpatrick_tone: String,
}

impl From<&SubjectRecord> for SubjectLabels {
    fn from(record: &SubjectRecord) -> Self {
        Self {
            sex: record.sex.clone(),
            ethnicity_group: record.ethnicity_group.clone(),
            fitzpatrick_tone: record.fitzpatrick_tone.clone(),
        }
    }
}

/// One dataset-index line, emitted per stored timeline image
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetIndexRecord {
    pub schema: &'static str,
    pub utc: DateTime<Utc>,
    pub subject_id: SubjectId,
    pub timeline: String,
    pub age: u8,
    pub src_path: String,
    pub dest_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_rel: Option<String>,
    pub filename: String,
    pub image_id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub labels: SubjectLabels,
}

impl DatasetIndexRecord {
    pub const SCHEMA: &'static str = "a360.dataset_index.v1";
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventLogLine<'a> {
    utc: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    event: &'a WatcherEvent,
}

/// Best-effort JSONL writers
pub struct Ledger {
    event_log: Option<PathBuf>,
    dataset_index: Option<PathBuf>,
}

impl Ledger {
    pub fn new(event_log: Option<PathBuf>, dataset_index: Option<PathBuf>) -> Self {
        Self {
            event_log,
            dataset_index,
        }
    }

    /// Ledger that writes nothing (tests, disabled configs).
    pub fn disabled() -> Self {
        Self {
            event_log: None,
            dataset_index: None,
        }
    }

    pub fn log_event(&self, event: &WatcherEvent) {
        let Some(path) = &self.event_log else {
            return;
        };
        let line = EventLogLine {
            utc: Utc::now(),
            kind: "WATCHER_EVENT",
            event,
        };
        append_jsonl(path, &line);
    }

    pub fn record_stored(&self, record: &DatasetIndexRecord) {
        let Some(path) = &self.dataset_index else {
            return;
        };
        append_jsonl(path, record);
    }
}

/// Append one JSON line, creating parent directories as needed. Failures are
/// warnings only.
fn append_jsonl<T: Serialize>(path: &Path, record: &T) {
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{json}")
    })();

    if let Err(e) = result {
        warn!("failed to append jsonl to {}: {e}", path.display());
    }
}
