//! Manifest and export assembly
//!
//! Once a subject's timeline is complete (or on demand), a descriptive
//! manifest is written into the timeline folder and the canonical images are
//! bundled into a zip adjacent to it. Completeness is always computed from
//! canonical-file existence on disk, never from in-memory slot state, so
//! assembly is safe to invoke after a process restart and idempotent to
//! re-run. All outputs are written to a temp name and renamed into place so
//! a failure never leaves a partial manifest or archive behind.

use crate::fsutil::{safe_relpath, sha256_file, temp_sibling};
use a360_common::subject::{canonical_filename, AgeLabel, SubjectId, SubjectRecord, TIMELINE_AGES};
use a360_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MANIFEST_FILENAME: &str = "subject_manifest.json";
pub const MANIFEST_SCHEMA: &str = "a360.subject_manifest.v1";

/// Per-age record inside a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestImage {
    pub age: u8,
    pub filename: String,
    pub exists: bool,
    pub abs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime_utc: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Structured description of a subject's artifact set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectManifest {
    pub schema: String,
    pub generated_utc: DateTime<Utc>,
    pub subject_id: SubjectId,
    pub timeline_folder_abs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline_folder_rel: Option<String>,
    pub expected_ages: Vec<u8>,
    pub timeline_complete: bool,
    pub missing: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    #[serde(default)]
    pub notes_meta: serde_json::Value,
    pub images: BTreeMap<String, ManifestImage>,
}

/// Result of a manifest + export run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResult {
    pub subject_id: SubjectId,
    pub timeline_complete: bool,
    pub manifest_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_path: Option<String>,
}

/// True when every canonical timeline file for the subject exists on disk.
pub fn timeline_complete(timeline_dir: &Path, subject_id: &SubjectId) -> bool {
    AgeLabel::all().all(|age| timeline_dir.join(canonical_filename(subject_id, age)).exists())
}

/// Builds manifests and export bundles
pub struct ManifestAssembler {
    project_root: PathBuf,
    hash_images: bool,
}

impl ManifestAssembler {
    pub fn new(project_root: impl Into<PathBuf>, hash_images: bool) -> Self {
        Self {
            project_root: project_root.into(),
            hash_images,
        }
    }

    /// Assemble the manifest for a subject from disk truth.
    ///
    /// `subject` supplies notes/metadata passthrough when available; slot
    /// records themselves come from canonical-file inspection only.
    pub fn assemble(
        &self,
        subject_id: &SubjectId,
        timeline_dir: &Path,
        subject: Option<&SubjectRecord>,
    ) -> SubjectManifest {
        let mut images = BTreeMap::new();
        let mut missing = Vec::new();

        for age in AgeLabel::all() {
            let filename = canonical_filename(subject_id, age);
            let path = timeline_dir.join(&filename);
            let mut record = ManifestImage {
                age: age.value(),
                filename,
                exists: path.exists(),
                abs: path.display().to_string(),
                rel: safe_relpath(&path, &self.project_root),
                bytes: None,
                mtime_utc: None,
                sha256: None,
            };

            if record.exists {
                match std::fs::metadata(&path) {
                    Ok(meta) => {
                        record.bytes = Some(meta.len());
                        record.mtime_utc = meta
                            .modified()
                            .ok()
                            .map(DateTime::<Utc>::from);
                    }
                    Err(e) => warn!("manifest stat failed for {}: {e}", path.display()),
                }
                if self.hash_images {
                    match sha256_file(&path) {
                        Ok(digest) => record.sha256 = Some(digest),
                        Err(e) => warn!("manifest hash failed for {}: {e}", path.display()),
                    }
                }
            } else {
                missing.push(age.image_key());
            }

            images.insert(age.image_key(), record);
        }

        SubjectManifest {
            schema: MANIFEST_SCHEMA.to_string(),
            generated_utc: Utc::now(),
            subject_id: subject_id.clone(),
            timeline_folder_abs: timeline_dir.display().to_string(),
            timeline_folder_rel: safe_relpath(timeline_dir, &self.project_root),
            expected_ages: TIMELINE_AGES.to_vec(),
            timeline_complete: missing.is_empty(),
            missing,
            notes: subject
                .map(|s| s.notes.clone())
                .filter(|n| !n.is_empty()),
            notes_meta: subject
                .map(|s| s.meta.clone())
                .unwrap_or(serde_json::Value::Null),
            images,
        }
    }

    /// Assemble and write `subject_manifest.json` into the timeline folder.
    /// Re-running with unchanged inputs reproduces the same content and may
    /// overwrite freely.
    pub fn write_manifest(
        &self,
        subject_id: &SubjectId,
        timeline_dir: &Path,
        subject: Option<&SubjectRecord>,
    ) -> Result<(SubjectManifest, PathBuf)> {
        let manifest = self.assemble(subject_id, timeline_dir, subject);
        let path = timeline_dir.join(MANIFEST_FILENAME);
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Internal(format!("serialize manifest: {e}")))?;
        crate::fsutil::atomic_write(&path, &json)?;
        info!(subject = %subject_id, "manifest written: {}", path.display());
        Ok((manifest, path))
    }

    /// Bundle the manifest and all existing canonical images into
    /// `{SubjectId}_export.zip` next to the timeline folder.
    ///
    /// The archive is built at a temp path and renamed into place on
    /// success; a failed run leaves no partial archive.
    pub fn export_zip(
        &self,
        subject_id: &SubjectId,
        timeline_dir: &Path,
        subject: Option<&SubjectRecord>,
    ) -> Result<ManifestResult> {
        let (manifest, manifest_path) = self.write_manifest(subject_id, timeline_dir, subject)?;

        let out_dir = timeline_dir.parent().unwrap_or(timeline_dir);
        let zip_path = out_dir.join(format!("{subject_id}_export.zip"));
        let tmp_path = temp_sibling(&zip_path);

        let build = (|| -> Result<()> {
            let file = File::create(&tmp_path)?;
            let mut zip = ZipWriter::new(BufWriter::new(file));
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

            zip.start_file(MANIFEST_FILENAME, options)
                .map_err(|e| Error::Internal(format!("zip manifest entry: {e}")))?;
            let mut reader = BufReader::new(File::open(&manifest_path)?);
            std::io::copy(&mut reader, &mut zip)?;

            for record in manifest.images.values().filter(|r| r.exists) {
                let src = Path::new(&record.abs);
                zip.start_file(record.filename.as_str(), options)
                    .map_err(|e| Error::Internal(format!("zip image entry: {e}")))?;
                let mut reader = BufReader::new(File::open(src)?);
                std::io::copy(&mut reader, &mut zip)?;
            }

            zip.finish()
                .map_err(|e| Error::Internal(format!("finish zip: {e}")))?;
            Ok(())
        })();

        match build {
            Ok(()) => {
                std::fs::rename(&tmp_path, &zip_path)?;
                info!(subject = %subject_id, "export bundle written: {}", zip_path.display());
                Ok(ManifestResult {
                    subject_id: subject_id.clone(),
                    timeline_complete: manifest.timeline_complete,
                    manifest_path: manifest_path.display().to_string(),
                    zip_path: Some(zip_path.display().to_string()),
                })
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}
