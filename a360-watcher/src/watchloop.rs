//! Filesystem watch loop
//!
//! Polls the flat output directory written by the external generator and
//! surfaces complete files as [`RawDetection`]s. A file only counts as
//! complete once its (size, mtime) signature has been observed unchanged for
//! the configured number of consecutive cycles — the generator writes
//! incrementally and slow writers must never be ingested mid-write.
//!
//! Each stable file is surfaced at most once per signature: a path that is
//! deleted and rewritten (or rewritten in place) gets a fresh signature and
//! is surfaced again, which is what makes manual retry of a corrupt source
//! work. On restart the loop rescans the directory from scratch; downstream
//! idempotency is the safety net, not watch-loop memory.
//!
//! The loop never deletes or mutates anything under the watch directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transient detection record handed to the resolver/state machine.
/// Not persisted; discarded after classification.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
}

/// (size, mtime) signature used for stability and dedup tracking
type Signature = (u64, SystemTime);

#[derive(Debug, Clone)]
struct Observation {
    signature: Signature,
    /// Consecutive cycles this signature has been seen, including the first
    stable_cycles: u32,
}

/// Polling watch loop over a single flat directory
pub struct WatchLoop {
    dir: PathBuf,
    poll_interval: Duration,
    stability_cycles: u32,
    tx: mpsc::Sender<RawDetection>,
    observations: HashMap<PathBuf, Observation>,
    surfaced: HashMap<PathBuf, Signature>,
}

impl WatchLoop {
    pub fn new(
        dir: PathBuf,
        poll_interval: Duration,
        stability_cycles: u32,
        tx: mpsc::Sender<RawDetection>,
    ) -> Self {
        Self {
            dir,
            poll_interval,
            // Two observations minimum: a single sighting proves nothing
            stability_cycles: stability_cycles.max(2),
            tx,
            observations: HashMap::new(),
            surfaced: HashMap::new(),
        }
    }

    /// Run until cancelled. The loop stops accepting new work immediately on
    /// shutdown; in-flight ingestion downstream is unaffected.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("watching {}", self.dir.display());
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("watch loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
            }
        }
    }

    /// One observation cycle. Public so tests can drive cycles without
    /// depending on wall-clock timing.
    pub async fn scan_once(&mut self) {
        let mut current: HashMap<PathBuf, Signature> = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                // Transient: the directory existed at startup (validated),
                // so keep polling rather than dying mid-session.
                warn!("cannot read watch directory {}: {e}", self.dir.display());
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("error reading watch directory entry: {e}");
                    continue;
                }
            };
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("metadata failed for {}: {e}", entry.path().display());
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            current.insert(entry.path(), (meta.len(), mtime));
        }

        // Paths that vanished are forgotten entirely; if the generator (or a
        // human) writes the same name again it is tracked as a new file.
        self.observations.retain(|path, _| current.contains_key(path));
        self.surfaced.retain(|path, _| current.contains_key(path));

        for (path, signature) in current {
            let observation = self
                .observations
                .entry(path.clone())
                .and_modify(|obs| {
                    if obs.signature == signature {
                        obs.stable_cycles += 1;
                    } else {
                        obs.signature = signature;
                        obs.stable_cycles = 1;
                    }
                })
                .or_insert(Observation {
                    signature,
                    stable_cycles: 1,
                });

            if observation.stable_cycles < self.stability_cycles {
                continue;
            }
            if signature.0 == 0 {
                // Zero-byte files are never complete
                continue;
            }
            if self.surfaced.get(&path) == Some(&signature) {
                continue;
            }

            debug!(
                "surfacing stable file {} ({} bytes)",
                path.display(),
                signature.0
            );
            self.surfaced.insert(path.clone(), signature);
            let detection = RawDetection {
                path,
                size: signature.0,
                mtime: signature.1,
            };
            if self.tx.send(detection).await.is_err() {
                // Receiver gone: the service is shutting down
                return;
            }
        }
    }
}
