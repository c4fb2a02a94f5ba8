//! Per-(subject, age) slot tracking
//!
//! The ingestion state machine is keyed by [`SlotKey`] and held in one
//! owned, lock-protected table. Admission through [`SlotTable::begin_detection`]
//! serializes work per slot (at most one in-flight operation per key) while
//! independent slots proceed in parallel. Slots advance monotonically; the
//! only backward transition is ERROR → re-detection when a source file is
//! replaced.

use a360_common::events::SlotStatus;
use a360_common::subject::{AgeLabel, SubjectId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

/// Unit of ingestion tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub subject_id: SubjectId,
    pub age: AgeLabel,
}

impl SlotKey {
    pub fn new(subject_id: SubjectId, age: AgeLabel) -> Self {
        Self { subject_id, age }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.age)
    }
}

/// Mutable state of one slot
#[derive(Debug, Clone)]
pub struct SlotState {
    pub status: SlotStatus,
    /// Last raw path observed for this slot (may be superseded)
    pub source_path: Option<PathBuf>,
    /// Final path after the move; present only once STORED
    pub canonical_path: Option<PathBuf>,
    pub last_event_timestamp: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    /// False when the file move succeeded but the registry upsert did not
    pub registry_synced: bool,
    in_flight: bool,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            status: SlotStatus::Waiting,
            source_path: None,
            canonical_path: None,
            last_event_timestamp: None,
            error_reason: None,
            registry_synced: true,
            in_flight: false,
        }
    }
}

/// Outcome of asking to start work on a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Slot claimed; caller owns the transition until complete/fail
    Admitted,
    /// Another operation is already running for this slot
    InFlight,
    /// Slot already holds its canonical file; re-detection is a no-op
    AlreadyStored,
}

/// Read-only slot view for observers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotView {
    pub age: u8,
    pub image: String,
    pub status: SlotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub registry_synced: bool,
}

/// Owned table of all slot state machines
#[derive(Default)]
pub struct SlotTable {
    inner: Mutex<HashMap<SlotKey, SlotState>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim a slot for a new detection.
    ///
    /// A STORED slot stays stored (idempotent re-detection); an in-flight
    /// slot rejects concurrent work; WAITING and ERROR slots are claimed and
    /// moved to DETECTED. ERROR → DETECTED is the retry path for replaced
    /// source files.
    pub async fn begin_detection(&self, key: &SlotKey, source: PathBuf) -> Admission {
        let mut table = self.inner.lock().await;
        let slot = table.entry(key.clone()).or_default();

        if slot.status == SlotStatus::Stored {
            return Admission::AlreadyStored;
        }
        if slot.in_flight {
            return Admission::InFlight;
        }

        slot.status = SlotStatus::Detected;
        slot.source_path = Some(source);
        slot.error_reason = None;
        slot.registry_synced = true;
        slot.last_event_timestamp = Some(Utc::now());
        slot.in_flight = true;
        Admission::Admitted
    }

    /// Advance an in-flight slot forward (VALIDATED, INGESTING).
    ///
    /// Backward moves are rejected: observers must only ever see monotonic
    /// progression within a slot.
    pub async fn advance(&self, key: &SlotKey, status: SlotStatus) {
        let mut table = self.inner.lock().await;
        let slot = table.entry(key.clone()).or_default();
        if status.rank() <= slot.status.rank() {
            debug!(slot = %key, from = %slot.status, to = %status, "ignoring non-forward transition");
            return;
        }
        slot.status = status;
        slot.last_event_timestamp = Some(Utc::now());
    }

    /// Terminal success: record the canonical path and release the slot.
    pub async fn complete(&self, key: &SlotKey, canonical_path: PathBuf) {
        let mut table = self.inner.lock().await;
        let slot = table.entry(key.clone()).or_default();
        slot.status = SlotStatus::Stored;
        slot.canonical_path = Some(canonical_path);
        slot.error_reason = None;
        slot.last_event_timestamp = Some(Utc::now());
        slot.in_flight = false;
    }

    /// Terminal failure: record the reason and release the slot.
    pub async fn fail(&self, key: &SlotKey, reason: impl Into<String>) {
        let mut table = self.inner.lock().await;
        let slot = table.entry(key.clone()).or_default();
        slot.status = SlotStatus::Error;
        slot.error_reason = Some(reason.into());
        slot.last_event_timestamp = Some(Utc::now());
        slot.in_flight = false;
    }

    /// Mark the registry-sync outcome for a stored slot.
    pub async fn set_registry_synced(&self, key: &SlotKey, synced: bool) {
        let mut table = self.inner.lock().await;
        if let Some(slot) = table.get_mut(key) {
            slot.registry_synced = synced;
        }
    }

    pub async fn get(&self, key: &SlotKey) -> Option<SlotState> {
        self.inner.lock().await.get(key).cloned()
    }

    /// Count of STORED slots for a subject (in-memory view; completion
    /// decisions additionally consult the filesystem).
    pub async fn stored_count(&self, subject_id: &SubjectId) -> usize {
        let table = self.inner.lock().await;
        AgeLabel::all()
            .filter(|age| {
                table
                    .get(&SlotKey::new(subject_id.clone(), *age))
                    .map(|s| s.status == SlotStatus::Stored)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Snapshot of all eleven slots for a subject. Slots with no recorded
    /// state yet are WAITING — they exist implicitly as soon as the subject
    /// does.
    pub async fn subject_snapshot(&self, subject_id: &SubjectId) -> Vec<SlotView> {
        let table = self.inner.lock().await;
        AgeLabel::all()
            .map(|age| {
                let state = table
                    .get(&SlotKey::new(subject_id.clone(), age))
                    .cloned()
                    .unwrap_or_default();
                SlotView {
                    age: age.value(),
                    image: age.image_key(),
                    status: state.status,
                    source_path: state.source_path.map(|p| p.display().to_string()),
                    canonical_path: state.canonical_path.map(|p| p.display().to_string()),
                    last_event_timestamp: state.last_event_timestamp,
                    error_reason: state.error_reason,
                    registry_synced: state.registry_synced,
                }
            })
            .collect()
    }
}
