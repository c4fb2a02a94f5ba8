//! Watcher event types and the A360 event system
//!
//! Every slot transition in the ingestion state machine produces exactly one
//! [`WatcherEvent`]. Events are broadcast via [`EventBus`] and serialized as
//! JSON for SSE transmission to live observers.

use crate::subject::{AgeLabel, SubjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Class of artifact an event refers to.
///
/// All three stages share the same transition semantics; the watcher itself
/// only produces `COMFY_OUTPUT` events (aging-timeline files written by the
/// external generator), the other stages are emitted by the UI when it saves
/// prompt outputs and anchor images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStage {
    PromptOutput,
    Anchor,
    ComfyOutput,
}

impl std::fmt::Display for ArtifactStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactStage::PromptOutput => write!(f, "PROMPT_OUTPUT"),
            ArtifactStage::Anchor => write!(f, "ANCHOR"),
            ArtifactStage::ComfyOutput => write!(f, "COMFY_OUTPUT"),
        }
    }
}

/// Lifecycle state of a (subject, age) slot.
///
/// Slots advance monotonically WAITING → DETECTED → VALIDATED → INGESTING →
/// STORED; ERROR is reachable from DETECTED, VALIDATED and INGESTING. The
/// only backward transition is ERROR → WAITING when a source file is
/// replaced and re-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Waiting,
    Detected,
    Validated,
    Ingesting,
    Stored,
    Error,
}

impl SlotStatus {
    /// Position in the forward progression, used to reject backward moves.
    /// ERROR sits outside the ordering.
    pub fn rank(self) -> u8 {
        match self {
            SlotStatus::Waiting => 0,
            SlotStatus::Detected => 1,
            SlotStatus::Validated => 2,
            SlotStatus::Ingesting => 3,
            SlotStatus::Stored => 4,
            SlotStatus::Error => 0,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SlotStatus::Stored | SlotStatus::Error)
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Waiting => write!(f, "WAITING"),
            SlotStatus::Detected => write!(f, "DETECTED"),
            SlotStatus::Validated => write!(f, "VALIDATED"),
            SlotStatus::Ingesting => write!(f, "INGESTING"),
            SlotStatus::Stored => write!(f, "STORED"),
            SlotStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Immutable notification record for one slot transition.
///
/// Wire schema (JSON, camelCase):
/// `{subjectId, stage, image, status, path?, timestamp, reason?, bytes?, sha256?}`
///
/// Loosely-typed payloads from earlier tooling (arbitrary key aliases for
/// subject/path) are normalized into this single schema at the system
/// boundary; internal code never branches on alternate field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherEvent {
    pub subject_id: SubjectId,
    pub stage: ArtifactStage,
    /// Image key within the stage (`A45`)
    pub image: String,
    pub status: SlotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Human-readable reason, present on ERROR events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Stored file size, present on STORED events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Stored file SHA-256, present on STORED events when hashing is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl WatcherEvent {
    /// Build a transition event stamped with the current time.
    pub fn transition(
        subject_id: SubjectId,
        stage: ArtifactStage,
        age: AgeLabel,
        status: SlotStatus,
        path: Option<String>,
    ) -> Self {
        WatcherEvent {
            subject_id,
            stage,
            image: age.image_key(),
            status,
            path,
            timestamp: Utc::now(),
            reason: None,
            bytes: None,
            sha256: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_digest(mut self, bytes: u64, sha256: Option<String>) -> Self {
        self.bytes = Some(bytes);
        self.sha256 = sha256;
        self
    }
}

/// Central event distribution bus for watcher events
///
/// Backed by `tokio::sync::broadcast`, which gives the fan-out semantics the
/// live channel needs:
/// - non-blocking publish: a slow or disconnected observer never blocks the
///   state machine or other observers
/// - bounded per-observer buffering: a lagging receiver drops its own oldest
///   events (at-most-once delivery, no unbounded queuing)
/// - no backlog for new subscribers: observers that reconnect re-derive
///   current state from the slot-status endpoint instead
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WatcherEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events. Events emitted before subscription
    /// are not delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers, returning the subscriber count.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: WatcherEvent,
    ) -> Result<usize, broadcast::error::SendError<WatcherEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case. Slot transitions are
    /// still durable through the ledger and the filesystem, so delivery to
    /// zero observers is not an error.
    pub fn emit_lossy(&self, event: WatcherEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
