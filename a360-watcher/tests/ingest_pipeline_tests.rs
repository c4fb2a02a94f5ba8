//! Ingestion pipeline integration tests
//!
//! Drives detections through the full state machine against a tempdir
//! layout: watch directory, dataset root and sheet-backed registry.

use a360_common::config::AppConfig;
use a360_common::events::{EventBus, SlotStatus, WatcherEvent};
use a360_common::subject::{SubjectId, SubjectRecord, TIMELINE_AGES};
use a360_watcher::ingest::IngestEngine;
use a360_watcher::ledger::Ledger;
use a360_watcher::manifest::ManifestAssembler;
use a360_watcher::registry::{Registry, RetryPolicy, SheetRegistry, SubjectCache};
use a360_watcher::slots::SlotTable;
use a360_watcher::watchloop::{RawDetection, WatchLoop};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

const PNG_HEADER: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

fn png_bytes(len: usize) -> Vec<u8> {
    let mut bytes = PNG_HEADER.to_vec();
    bytes.resize(len.max(PNG_HEADER.len()), 0xAB);
    bytes
}

struct Harness {
    _tmp: TempDir,
    config: Arc<AppConfig>,
    registry: Arc<dyn Registry>,
    bus: EventBus,
    slots: Arc<SlotTable>,
    engine: Arc<IngestEngine>,
    watch_dir: PathBuf,
}

impl Harness {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let watch_dir = tmp.path().join("comfy_out");
        let registry_dir = tmp.path().join("registry");
        let project_root = tmp.path().join("dataset");
        std::fs::create_dir_all(&watch_dir).unwrap();
        std::fs::create_dir_all(&registry_dir).unwrap();
        std::fs::create_dir_all(&project_root).unwrap();

        let config = Arc::new(AppConfig {
            project_root,
            registry_dir: registry_dir.clone(),
            watch_dir: watch_dir.clone(),
            event_host: "127.0.0.1".to_string(),
            event_port: 0,
            timeline_code: "A".to_string(),
            timeline_folder_name: "TimelineA".to_string(),
            poll_interval_ms: 20,
            stability_cycles: 2,
            source_model_tool: "ComfyUI".to_string(),
            hash_images: true,
            write_dataset_index: true,
            dataset_index_path: None,
            write_event_log: false,
            event_log_path: None,
        });

        let registry: Arc<dyn Registry> = Arc::new(SheetRegistry::with_policy(
            registry_dir,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
        ));

        let bus = EventBus::new(256);
        let slots = Arc::new(SlotTable::new());
        let engine = Self::build_engine(&config, &registry, &bus, &slots);

        Harness {
            _tmp: tmp,
            config,
            registry,
            bus,
            slots,
            engine,
            watch_dir,
        }
    }

    fn build_engine(
        config: &Arc<AppConfig>,
        registry: &Arc<dyn Registry>,
        bus: &EventBus,
        slots: &Arc<SlotTable>,
    ) -> Arc<IngestEngine> {
        let ledger = Arc::new(Ledger::new(None, Some(config.dataset_index_path())));
        let assembler = Arc::new(ManifestAssembler::new(&config.project_root, config.hash_images));
        Arc::new(IngestEngine::new(
            Arc::clone(config),
            Arc::clone(registry),
            Arc::clone(slots),
            bus.clone(),
            ledger,
            Arc::new(SubjectCache::new()),
            assembler,
        ))
    }

    /// Fresh engine + slot table over the same filesystem and registry,
    /// simulating a process restart.
    fn restart(&self) -> (Arc<IngestEngine>, Arc<SlotTable>) {
        let slots = Arc::new(SlotTable::new());
        let engine = Self::build_engine(&self.config, &self.registry, &self.bus, &slots);
        (engine, slots)
    }

    async fn seed_subject(&self, id: &str) -> SubjectId {
        let sid = SubjectId::parse(id).unwrap();
        let record = SubjectRecord {
            subject_id: Some(sid.clone()),
            sex: "F".to_string(),
            ethnicity_group: "White".to_string(),
            fitzpatrick_tone: "II".to_string(),
            base_path: format!("Subjects/{sid}"),
            ..Default::default()
        };
        self.registry.upsert_subject(&record).await.unwrap();
        sid
    }

    fn write_source(&self, name: &str, content: &[u8]) -> RawDetection {
        let path = self.watch_dir.join(name);
        std::fs::write(&path, content).unwrap();
        RawDetection {
            path,
            size: content.len() as u64,
            mtime: SystemTime::now(),
        }
    }

    fn timeline_dir(&self, sid: &SubjectId) -> PathBuf {
        self.config.timeline_dir(&format!("Subjects/{sid}"))
    }

    fn canonical(&self, sid: &SubjectId, age: u8) -> PathBuf {
        self.timeline_dir(sid).join(format!("{sid}_A{age}.png"))
    }
}

fn drain(rx: &mut broadcast::Receiver<WatcherEvent>) -> Vec<WatcherEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn statuses(events: &[WatcherEvent]) -> Vec<SlotStatus> {
    events.iter().map(|e| e.status).collect()
}

// ============================================================================
// End-to-end scenario
// ============================================================================

#[tokio::test]
async fn stable_file_is_ingested_end_to_end() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S010").await;
    let mut rx = h.bus.subscribe();

    // File appears in the watch directory and survives two observation
    // cycles unchanged.
    let (tx, mut detections) = mpsc::channel(8);
    let mut watch = WatchLoop::new(h.watch_dir.clone(), Duration::from_millis(10), 2, tx);
    std::fs::write(h.watch_dir.join("S010_A20.png"), png_bytes(1024)).unwrap();
    watch.scan_once().await;
    watch.scan_once().await;

    let detection = detections.try_recv().expect("stable file surfaces");
    assert_eq!(detection.size, 1024);
    h.engine.process_detection(detection).await;

    // Events: strict per-slot progression
    let events = drain(&mut rx);
    assert_eq!(
        statuses(&events),
        vec![
            SlotStatus::Detected,
            SlotStatus::Validated,
            SlotStatus::Ingesting,
            SlotStatus::Stored,
        ]
    );
    for event in &events {
        assert_eq!(event.subject_id.as_str(), "S010");
        assert_eq!(event.image, "A20");
    }

    // Canonical file in place, source moved out of the watch directory
    let canonical = h.canonical(&sid, 20);
    assert!(canonical.ends_with("Subjects/S010/TimelineA/S010_A20.png"));
    assert!(canonical.exists());
    assert_eq!(std::fs::metadata(&canonical).unwrap().len(), 1024);
    assert!(!h.watch_dir.join("S010_A20.png").exists());

    let stored = events.last().unwrap();
    assert_eq!(stored.bytes, Some(1024));
    assert!(stored.sha256.is_some());
    assert_eq!(stored.path.as_deref(), Some(canonical.to_str().unwrap()));

    // Registry row recorded for (S010, A20, canonical path)
    let images = std::fs::read_to_string(h.config.registry_dir.join("Images.csv")).unwrap();
    assert!(images.contains("S010"));
    assert!(images.contains("20"));
    assert!(images.contains("S010_A20.png"));
    assert!(images.contains("Subjects/S010/TimelineA"));

    // Dataset index line appended
    let index = std::fs::read_to_string(h.config.dataset_index_path()).unwrap();
    let line: serde_json::Value = serde_json::from_str(index.lines().next().unwrap()).unwrap();
    assert_eq!(line["schema"], "a360.dataset_index.v1");
    assert_eq!(line["subjectId"], "S010");
    assert_eq!(line["labels"]["sex"], "F");
}

// ============================================================================
// Classification and error paths
// ============================================================================

#[tokio::test]
async fn unclassifiable_files_are_silently_ignored() {
    let h = Harness::new().await;
    h.seed_subject("S001").await;
    let mut rx = h.bus.subscribe();

    for name in ["random.txt", "S001_A21.png", "S001_A20.gif"] {
        let det = h.write_source(name, b"whatever");
        h.engine.process_detection(det).await;
    }

    assert!(drain(&mut rx).is_empty(), "no events for unrelated files");
}

#[tokio::test]
async fn corrupt_source_fails_and_is_retryable_after_rewrite() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S002").await;
    let mut rx = h.bus.subscribe();

    // Right name, not an image
    let det = h.write_source("S002_A30.png", b"this is not a png at all");
    h.engine.process_detection(det).await;

    let events = drain(&mut rx);
    assert_eq!(
        statuses(&events),
        vec![SlotStatus::Detected, SlotStatus::Error]
    );
    let error = events.last().unwrap();
    assert!(error
        .reason
        .as_deref()
        .unwrap()
        .contains("corrupt or unreadable source file"));
    assert!(!h.canonical(&sid, 30).exists());

    // A human replaces the file; the slot is eligible again and succeeds
    let det = h.write_source("S002_A30.png", &png_bytes(512));
    h.engine.process_detection(det).await;

    let events = drain(&mut rx);
    assert_eq!(*statuses(&events).last().unwrap(), SlotStatus::Stored);
    assert!(h.canonical(&sid, 30).exists());
}

#[tokio::test]
async fn unknown_subject_surfaces_an_error_event() {
    let h = Harness::new().await;
    let mut rx = h.bus.subscribe();

    let det = h.write_source("S099_A20.png", &png_bytes(64));
    h.engine.process_detection(det).await;

    let events = drain(&mut rx);
    assert_eq!(
        statuses(&events),
        vec![SlotStatus::Detected, SlotStatus::Error]
    );
    assert!(events
        .last()
        .unwrap()
        .reason
        .as_deref()
        .unwrap()
        .contains("no base path"));
    // Source is left untouched for later retry
    assert!(h.watch_dir.join("S099_A20.png").exists());
}

// ============================================================================
// Conflict preservation
// ============================================================================

#[tokio::test]
async fn differing_destination_is_never_overwritten() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S003").await;
    let mut rx = h.bus.subscribe();

    // Canonical path already holds content X
    let canonical = h.canonical(&sid, 40);
    std::fs::create_dir_all(canonical.parent().unwrap()).unwrap();
    let mut existing = png_bytes(256);
    existing[100] = 0x01;
    std::fs::write(&canonical, &existing).unwrap();

    // New source with different content Y, same size, targets the same path
    let mut incoming = png_bytes(256);
    incoming[100] = 0x02;
    let det = h.write_source("S003_A40.png", &incoming);
    h.engine.process_detection(det).await;

    let events = drain(&mut rx);
    assert_eq!(*statuses(&events).last().unwrap(), SlotStatus::Error);
    assert!(events
        .last()
        .unwrap()
        .reason
        .as_deref()
        .unwrap()
        .contains("destination conflict"));

    // First writer wins: canonical still holds X, source preserved for a human
    assert_eq!(std::fs::read(&canonical).unwrap(), existing);
    assert!(h.watch_dir.join("S003_A40.png").exists());
}

// ============================================================================
// Idempotent ingestion
// ============================================================================

#[tokio::test]
async fn redetection_of_a_stored_slot_is_a_noop() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S004").await;
    let mut rx = h.bus.subscribe();

    let det = h.write_source("S004_A45.png", &png_bytes(300));
    h.engine.process_detection(det).await;
    assert!(h.canonical(&sid, 45).exists());
    let first_run = drain(&mut rx);
    assert_eq!(*statuses(&first_run).last().unwrap(), SlotStatus::Stored);

    // Same-named source reappears while the slot is stored: no re-ingest
    let det = h.write_source("S004_A45.png", &png_bytes(300));
    h.engine.process_detection(det).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn rescan_after_restart_yields_exactly_one_canonical_file() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S005").await;

    let content = png_bytes(700);
    let det = h.write_source("S005_A50.png", &content);
    h.engine.process_detection(det).await;

    let canonical = h.canonical(&sid, 50);
    let stored_once = std::fs::read(&canonical).unwrap();

    // Restart: fresh slot table, fresh engine, full rescan re-detects an
    // identical leftover source (e.g. crash between copy and source removal)
    let (engine, _slots) = h.restart();
    let mut rx = h.bus.subscribe();
    let det = h.write_source("S005_A50.png", &content);
    engine.process_detection(det).await;

    let events = drain(&mut rx);
    assert_eq!(*statuses(&events).last().unwrap(), SlotStatus::Stored);

    // Still exactly one canonical file with unchanged content; the leftover
    // source was cleared to complete the move
    assert_eq!(std::fs::read(&canonical).unwrap(), stored_once);
    assert!(!h.watch_dir.join("S005_A50.png").exists());

    let timeline_entries: Vec<_> = std::fs::read_dir(h.timeline_dir(&sid))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("A50"))
        .collect();
    assert_eq!(timeline_entries.len(), 1);
}

// ============================================================================
// Registry failure asymmetry
// ============================================================================

#[tokio::test]
async fn registry_failure_does_not_roll_back_the_move() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S006").await;
    let mut rx = h.bus.subscribe();

    // Operator has the Images sheet open in a spreadsheet application
    std::fs::write(h.config.registry_dir.join("~$Images.csv"), b"").unwrap();

    let det = h.write_source("S006_A55.png", &png_bytes(400));
    h.engine.process_detection(det).await;

    let events = drain(&mut rx);
    let seq = statuses(&events);
    // STORED is emitted, then the registry sync failure surfaces as ERROR
    assert!(seq.contains(&SlotStatus::Stored));
    assert_eq!(*seq.last().unwrap(), SlotStatus::Error);
    assert!(events
        .last()
        .unwrap()
        .reason
        .as_deref()
        .unwrap()
        .contains("registry sync failed"));

    // File ingestion is the primary record: canonical file exists and the
    // slot is still logically STORED
    assert!(h.canonical(&sid, 55).exists());
    let snapshot = h.slots.subject_snapshot(&sid).await;
    let slot = snapshot.iter().find(|v| v.age == 55).unwrap();
    assert_eq!(slot.status, SlotStatus::Stored);
    assert!(!slot.registry_synced);
}

// ============================================================================
// Completion trigger
// ============================================================================

#[tokio::test]
async fn completing_the_final_age_triggers_manifest_assembly() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S020").await;

    // Ten of eleven ages already stored (from an earlier session)
    let timeline = h.timeline_dir(&sid);
    std::fs::create_dir_all(&timeline).unwrap();
    for &age in TIMELINE_AGES.iter().filter(|&&a| a != 70) {
        std::fs::write(
            timeline.join(format!("{sid}_A{age}.png")),
            png_bytes(128),
        )
        .unwrap();
    }
    assert!(!timeline.join("subject_manifest.json").exists());

    // The eleventh arrives through the pipeline
    let det = h.write_source("S020_A70.png", &png_bytes(128));
    h.engine.process_detection(det).await;

    let manifest_path = timeline.join("subject_manifest.json");
    assert!(manifest_path.exists());
    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["timelineComplete"], true);
    assert_eq!(manifest["subjectId"], "S020");

    let zip_path = h
        .config
        .project_root
        .join("Subjects/S020/S020_export.zip");
    assert!(zip_path.exists());
}

#[tokio::test]
async fn incomplete_timeline_does_not_assemble() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S021").await;

    let det = h.write_source("S021_A20.png", &png_bytes(128));
    h.engine.process_detection(det).await;

    assert!(h.canonical(&sid, 20).exists());
    assert!(!h
        .timeline_dir(&sid)
        .join("subject_manifest.json")
        .exists());
}

// ============================================================================
// Cross-slot independence
// ============================================================================

#[tokio::test]
async fn slots_progress_independently() {
    let h = Harness::new().await;
    let sid = h.seed_subject("S030").await;
    let mut rx = h.bus.subscribe();

    // One good file, one corrupt file for a different age
    let good = h.write_source("S030_A20.png", &png_bytes(200));
    let bad = h.write_source("S030_A25.png", b"garbage");
    h.engine.process_detection(good).await;
    h.engine.process_detection(bad).await;

    let events = drain(&mut rx);
    let a20: Vec<SlotStatus> = events
        .iter()
        .filter(|e| e.image == "A20")
        .map(|e| e.status)
        .collect();
    let a25: Vec<SlotStatus> = events
        .iter()
        .filter(|e| e.image == "A25")
        .map(|e| e.status)
        .collect();

    assert_eq!(*a20.last().unwrap(), SlotStatus::Stored);
    assert_eq!(*a25.last().unwrap(), SlotStatus::Error);
    assert!(h.canonical(&sid, 20).exists());
    assert!(!h.canonical(&sid, 25).exists());
}
