//! Ingestion state machine
//!
//! Drives each (subject, age) slot from detection through validation, the
//! canonical move, the registry commit and the completion check. Slots fail
//! independently: a corrupt file or a conflict marks its own slot ERROR and
//! the rest of the pipeline keeps running.
//!
//! Transition rules:
//! - DETECTED → VALIDATED: the source re-reads as a nonzero raster image
//!   (magic-byte check; transient read errors retried with backoff).
//! - VALIDATED → INGESTING → STORED: temp-copy + rename into the canonical
//!   path; the source is removed only after the destination is confirmed
//!   complete. A byte-identical existing destination is success without
//!   rewrite; a differing one is a terminal "destination conflict" and the
//!   existing canonical file is preserved.
//! - STORED → registry upsert: best-effort. A registry failure emits an
//!   ERROR event but the slot stays STORED — file state is the primary
//!   record, the registry is reconciled secondary state.
//!
//! Every transition emits exactly one WatcherEvent, strictly ordered within
//! a slot.

use crate::fsutil::{safe_relpath, sha256_file, temp_sibling};
use crate::ledger::{DatasetIndexRecord, Ledger, SubjectLabels};
use crate::manifest::{timeline_complete, ManifestAssembler};
use crate::registry::{ImageRecord, Registry, SubjectCache};
use crate::resolver;
use crate::slots::{Admission, SlotKey, SlotTable};
use crate::watchloop::RawDetection;
use a360_common::config::AppConfig;
use a360_common::events::{ArtifactStage, EventBus, SlotStatus, WatcherEvent};
use a360_common::subject::{canonical_filename, SubjectId, SubjectRecord};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

const VALIDATE_ATTEMPTS: u32 = 3;
const VALIDATE_BASE_DELAY: Duration = Duration::from_millis(200);

/// Ingestion pipeline driver
pub struct IngestEngine {
    config: Arc<AppConfig>,
    registry: Arc<dyn Registry>,
    slots: Arc<SlotTable>,
    bus: EventBus,
    ledger: Arc<Ledger>,
    subjects: Arc<SubjectCache>,
    assembler: Arc<ManifestAssembler>,
    /// Subjects whose completed timeline has already triggered assembly in
    /// this process (assembly stays re-runnable on demand)
    assembled: Mutex<HashSet<SubjectId>>,
    tracker: TaskTracker,
}

impl IngestEngine {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<dyn Registry>,
        slots: Arc<SlotTable>,
        bus: EventBus,
        ledger: Arc<Ledger>,
        subjects: Arc<SubjectCache>,
        assembler: Arc<ManifestAssembler>,
    ) -> Self {
        Self {
            config,
            registry,
            slots,
            bus,
            ledger,
            subjects,
            assembler,
            assembled: Mutex::new(HashSet::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Consume raw detections until cancelled, spawning one task per
    /// admitted detection so independent slots proceed in parallel. On
    /// shutdown the engine stops accepting new detections immediately;
    /// already-spawned slot work runs to completion (awaited by the caller
    /// through [`Self::shutdown`]).
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RawDetection>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ingest engine stopping");
                    return;
                }
                detection = rx.recv() => {
                    match detection {
                        Some(det) => {
                            let engine = Arc::clone(&self);
                            self.tracker.spawn(async move {
                                engine.process_detection(det).await;
                            });
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Wait for all in-flight slot ingestions to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Classify a detection and, when its slot admits work, run the slot
    /// pipeline to completion. The admission gate keeps work strictly
    /// sequential within one slot; concurrent callers for different slots
    /// do not coordinate at all.
    pub async fn process_detection(&self, detection: RawDetection) {
        let Some(classification) = resolver::classify(&detection.path) else {
            debug!("ignoring unclassifiable file {}", detection.path.display());
            return;
        };
        let key = SlotKey::new(classification.subject_id, classification.age);

        match self
            .slots
            .begin_detection(&key, detection.path.clone())
            .await
        {
            Admission::Admitted => {
                self.emit(&key, SlotStatus::Detected, Some(&detection.path));
                self.process_slot(key, detection).await;
            }
            Admission::InFlight => {
                debug!(slot = %key, "detection dropped: slot already in flight");
            }
            Admission::AlreadyStored => {
                debug!(slot = %key, "re-detection of stored slot is a no-op");
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-slot pipeline
    // ------------------------------------------------------------------

    async fn process_slot(&self, key: SlotKey, detection: RawDetection) {
        let source = detection.path.clone();

        // Subject lookup; one cache refresh covers subjects created by the
        // UI after the watcher started.
        let record = match self.lookup_subject(&key.subject_id).await {
            Some(record) => record,
            None => {
                self.fail_slot(
                    &key,
                    &source,
                    format!("no base path registered for subject {}", key.subject_id),
                )
                .await;
                return;
            }
        };
        if record.base_path.is_empty() {
            self.fail_slot(
                &key,
                &source,
                format!("no base path registered for subject {}", key.subject_id),
            )
            .await;
            return;
        }

        // DETECTED → VALIDATED
        let source_size = match self.validate_source(&source).await {
            Ok(size) => size,
            Err(reason) => {
                self.fail_slot(&key, &source, reason).await;
                return;
            }
        };
        self.slots.advance(&key, SlotStatus::Validated).await;
        self.emit(&key, SlotStatus::Validated, Some(&source));

        // VALIDATED → INGESTING
        self.slots.advance(&key, SlotStatus::Ingesting).await;
        self.emit(&key, SlotStatus::Ingesting, Some(&source));

        let timeline_dir = self.config.timeline_dir(&record.base_path);
        let dest = resolver::canonical_destination(&timeline_dir, &key.subject_id, key.age);

        if let Err(reason) = self.move_into_place(&source, &dest, source_size, &timeline_dir) {
            self.fail_slot(&key, &source, reason).await;
            return;
        }

        // INGESTING → STORED
        let bytes = std::fs::metadata(&dest).map(|m| m.len()).ok();
        let sha256 = if self.config.hash_images {
            match sha256_file(&dest) {
                Ok(digest) => Some(digest),
                Err(e) => {
                    warn!("could not hash {}: {e}", dest.display());
                    None
                }
            }
        } else {
            None
        };

        self.slots.complete(&key, dest.clone()).await;
        let stored = WatcherEvent::transition(
            key.subject_id.clone(),
            ArtifactStage::ComfyOutput,
            key.age,
            SlotStatus::Stored,
            Some(dest.display().to_string()),
        )
        .with_digest(bytes.unwrap_or(source_size), sha256.clone());
        self.publish(stored);
        info!(slot = %key, "stored {}", dest.display());

        // Registry commit: best-effort, never rolls back the move.
        let image_id = format!("{}_{}", key.subject_id, key.age.image_key());
        let run_id = Uuid::new_v4().to_string();
        let image_record = ImageRecord {
            subject_id: key.subject_id.clone(),
            timeline: self.config.timeline_code.clone(),
            age: key.age,
            folder_path: folder_path_rel(&record.base_path, &self.config.timeline_folder_name),
            filename: canonical_filename(&key.subject_id, key.age),
            image_id: image_id.clone(),
            generation_stage: "AgeTimeline".to_string(),
            source_model_tool: self.config.source_model_tool.clone(),
            run_id: run_id.clone(),
            stored_utc: Utc::now(),
        };
        match self.registry.upsert_image_record(&image_record).await {
            Ok(()) => {
                self.slots.set_registry_synced(&key, true).await;
            }
            Err(e) => {
                // The slot is still logically STORED for file purposes.
                self.slots.set_registry_synced(&key, false).await;
                warn!(slot = %key, "registry sync failed: {e}");
                let event = WatcherEvent::transition(
                    key.subject_id.clone(),
                    ArtifactStage::ComfyOutput,
                    key.age,
                    SlotStatus::Error,
                    Some(dest.display().to_string()),
                )
                .with_reason(format!("registry sync failed: {e}"));
                self.publish(event);
            }
        }

        // ML dataset index (best effort)
        if self.config.write_dataset_index {
            let dataset_record = DatasetIndexRecord {
                schema: DatasetIndexRecord::SCHEMA,
                utc: Utc::now(),
                subject_id: key.subject_id.clone(),
                timeline: self.config.timeline_code.clone(),
                age: key.age.value(),
                src_path: source.display().to_string(),
                dest_path: dest.display().to_string(),
                dest_rel: safe_relpath(&dest, &self.config.project_root),
                filename: canonical_filename(&key.subject_id, key.age),
                image_id,
                run_id,
                bytes,
                sha256,
                labels: SubjectLabels::from(&record),
            };
            self.ledger.record_stored(&dataset_record);
        }

        self.maybe_assemble(&key.subject_id, &timeline_dir, &record)
            .await;
    }

    async fn lookup_subject(&self, subject_id: &SubjectId) -> Option<SubjectRecord> {
        if let Some(record) = self.subjects.get(subject_id).await {
            return Some(record);
        }
        match self.subjects.refresh(self.registry.as_ref()).await {
            Ok(count) => debug!("subject cache refreshed ({count} subjects)"),
            Err(e) => warn!("subject cache refresh failed: {e}"),
        }
        self.subjects.get(subject_id).await
    }

    /// Re-read the source and confirm it is a decodable, nonzero raster
    /// image. Transient read errors are retried with bounded backoff; a
    /// readable file with bad content is immediately corrupt.
    async fn validate_source(&self, source: &Path) -> std::result::Result<u64, String> {
        let mut delay = VALIDATE_BASE_DELAY;
        let mut last_error = String::new();

        for attempt in 1..=VALIDATE_ATTEMPTS {
            match read_header(source) {
                Ok((size, header)) => {
                    return if size > 0 && is_raster_image(&header) {
                        Ok(size)
                    } else {
                        Err("corrupt or unreadable source file".to_string())
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < VALIDATE_ATTEMPTS {
                        debug!(
                            "read of {} failed (attempt {attempt}): {last_error}; retrying",
                            source.display()
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(format!("corrupt or unreadable source file: {last_error}"))
    }

    /// Move the validated source to the canonical destination.
    ///
    /// The copy lands at a temp sibling first and is renamed into place
    /// after its size is confirmed, so no reader ever sees a short canonical
    /// file. The source is removed last.
    fn move_into_place(
        &self,
        source: &Path,
        dest: &Path,
        source_size: u64,
        timeline_dir: &Path,
    ) -> std::result::Result<(), String> {
        std::fs::create_dir_all(timeline_dir)
            .map_err(|e| format!("cannot create timeline directory: {e}"))?;

        if dest.exists() {
            return match byte_identical(source, dest) {
                Ok(true) => {
                    // A rescan of an interrupted move: the canonical file is
                    // already correct, just finish by clearing the source.
                    debug!("destination already identical: {}", dest.display());
                    if let Err(e) = std::fs::remove_file(source) {
                        warn!("could not remove ingested source {}: {e}", source.display());
                    }
                    Ok(())
                }
                Ok(false) => Err(
                    "destination conflict: canonical file exists with different content"
                        .to_string(),
                ),
                Err(e) => Err(format!("cannot compare with existing destination: {e}")),
            };
        }

        let tmp = temp_sibling(dest);
        let copy = (|| -> std::io::Result<()> {
            std::fs::copy(source, &tmp)?;
            let written = std::fs::metadata(&tmp)?.len();
            if written != source_size {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short copy: {written} of {source_size} bytes"),
                ));
            }
            std::fs::rename(&tmp, dest)
        })();

        if let Err(e) = copy {
            let _ = std::fs::remove_file(&tmp);
            return Err(format!("copy to canonical path failed: {e}"));
        }

        if let Err(e) = std::fs::remove_file(source) {
            // Destination is confirmed; a leftover source re-detects as the
            // identical-destination case and is cleared then.
            warn!("could not remove ingested source {}: {e}", source.display());
        }
        Ok(())
    }

    async fn maybe_assemble(
        &self,
        subject_id: &SubjectId,
        timeline_dir: &Path,
        record: &SubjectRecord,
    ) {
        if !timeline_complete(timeline_dir, subject_id) {
            return;
        }
        {
            let mut assembled = self.assembled.lock().await;
            if !assembled.insert(subject_id.clone()) {
                return;
            }
        }

        info!(subject = %subject_id, "timeline complete; assembling manifest and export bundle");
        match self
            .assembler
            .export_zip(subject_id, timeline_dir, Some(record))
        {
            Ok(result) => info!(
                subject = %subject_id,
                "export complete: {}",
                result.zip_path.unwrap_or(result.manifest_path)
            ),
            Err(e) => {
                // Re-runnable on demand; does not affect slot state.
                warn!(subject = %subject_id, "manifest assembly failed: {e}");
                self.assembled.lock().await.remove(subject_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Event plumbing
    // ------------------------------------------------------------------

    async fn fail_slot(&self, key: &SlotKey, source: &Path, reason: String) {
        warn!(slot = %key, "{reason}");
        self.slots.fail(key, reason.clone()).await;
        let event = WatcherEvent::transition(
            key.subject_id.clone(),
            ArtifactStage::ComfyOutput,
            key.age,
            SlotStatus::Error,
            Some(source.display().to_string()),
        )
        .with_reason(reason);
        self.publish(event);
    }

    fn emit(&self, key: &SlotKey, status: SlotStatus, path: Option<&Path>) {
        let event = WatcherEvent::transition(
            key.subject_id.clone(),
            ArtifactStage::ComfyOutput,
            key.age,
            status,
            path.map(|p| p.display().to_string()),
        );
        self.publish(event);
    }

    fn publish(&self, event: WatcherEvent) {
        self.ledger.log_event(&event);
        self.bus.emit_lossy(event);
    }
}

fn folder_path_rel(base_path: &str, timeline_folder_name: &str) -> String {
    let trimmed = base_path.replace('\\', "/");
    let trimmed = trimmed.trim_matches('/');
    format!("{trimmed}/{timeline_folder_name}")
}

fn read_header(path: &Path) -> std::io::Result<(u64, [u8; 12])> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    let mut header = [0u8; 12];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok((size, header))
}

/// Magic-byte check for the allowed raster formats (png/jpeg/webp).
fn is_raster_image(header: &[u8; 12]) -> bool {
    match header {
        // PNG
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => true,
        // JPEG
        [0xFF, 0xD8, 0xFF, ..] => true,
        // WebP (RIFF container)
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P'] => true,
        _ => false,
    }
}

fn byte_identical(a: &Path, b: &Path) -> a360_common::Result<bool> {
    let size_a = std::fs::metadata(a)?.len();
    let size_b = std::fs::metadata(b)?.len();
    if size_a != size_b {
        return Ok(false);
    }
    Ok(sha256_file(a)? == sha256_file(b)?)
}
