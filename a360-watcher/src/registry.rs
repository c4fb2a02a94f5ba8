//! Registry adapter
//!
//! The registry is an external durable store the operator also opens in a
//! spreadsheet application. The watcher only depends on the [`Registry`]
//! trait; the shipped [`SheetRegistry`] keeps one CSV sheet file per
//! workbook sheet (`Subjects.csv`, `Images.csv`) inside the configured
//! registry directory.
//!
//! Because the store may be exclusively locked by that other application at
//! any moment, every operation treats "file currently open elsewhere" as a
//! transient condition and retries with bounded exponential backoff. Writes
//! are serialized process-wide and land via temp-then-rename.

use a360_common::subject::{AgeLabel, SubjectId, SubjectRecord};
use a360_common::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const SUBJECTS_SHEET: &str = "Subjects.csv";
const IMAGES_SHEET: &str = "Images.csv";

const SUBJECT_COLUMNS: [&str; 10] = [
    "SubjectID",
    "Sex",
    "Ethnicity_Group",
    "Fitzpatrick_Tone",
    "Notes",
    "Folder_Name",
    "Base_Path",
    "Image_Set_Status",
    "Meta",
    "Last_Updated_Utc",
];

const IMAGE_COLUMNS: [&str; 10] = [
    "SubjectID",
    "Timeline",
    "TargetAge",
    "FolderPath",
    "Filename",
    "ImageID",
    "GenerationStage",
    "SourceModelTool",
    "RunID",
    "Stored_Utc",
];

/// One row of the Images sheet
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub subject_id: SubjectId,
    pub timeline: String,
    pub age: AgeLabel,
    /// Folder path relative to the project root, forward slashes
    pub folder_path: String,
    pub filename: String,
    pub image_id: String,
    pub generation_stage: String,
    pub source_model_tool: String,
    pub run_id: String,
    pub stored_utc: DateTime<Utc>,
}

/// Durable subject/image metadata store
#[async_trait]
pub trait Registry: Send + Sync {
    /// Insert or update a subject; allocates the next sequential id when the
    /// record carries none. Returns the canonical id.
    async fn upsert_subject(&self, record: &SubjectRecord) -> Result<SubjectId>;

    /// Insert or update the image row keyed by (subject, timeline, age).
    async fn upsert_image_record(&self, record: &ImageRecord) -> Result<()>;

    async fn read_subject(&self, subject_id: &SubjectId) -> Result<Option<SubjectRecord>>;

    async fn list_subjects(&self) -> Result<Vec<SubjectRecord>>;
}

/// Backoff parameters for the locked-store condition
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

/// Sheet-file-backed registry
pub struct SheetRegistry {
    dir: PathBuf,
    policy: RetryPolicy,
    /// Serializes read-modify-write cycles within this process; cross-process
    /// writers are handled by the lock-detection + retry path.
    write_lock: Mutex<()>,
}

impl SheetRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            policy: RetryPolicy::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_policy(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            write_lock: Mutex::new(()),
        }
    }

    fn subjects_path(&self) -> PathBuf {
        self.dir.join(SUBJECTS_SHEET)
    }

    fn images_path(&self) -> PathBuf {
        self.dir.join(IMAGES_SHEET)
    }

    /// Run `op`, retrying while the store reports itself locked.
    async fn retry_locked<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = self.policy.base_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Err(Error::RegistryLocked(msg)) if attempt < self.policy.max_attempts => {
                    warn!(
                        attempt,
                        "registry locked ({msg}); retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.policy.max_delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn load_subject_rows(&self) -> Result<Vec<SubjectRecord>> {
        let rows = read_sheet(&self.subjects_path())?;
        let mut out = Vec::new();
        for row in rows {
            let raw_id = row.get("SubjectID");
            let subject_id = match SubjectId::parse(&raw_id) {
                Ok(id) => id,
                Err(_) => {
                    if !raw_id.trim().is_empty() {
                        warn!("skipping subject row with bad id: {raw_id:?}");
                    }
                    continue;
                }
            };
            out.push(SubjectRecord {
                subject_id: Some(subject_id),
                sex: row.get("Sex"),
                ethnicity_group: row.get("Ethnicity_Group"),
                fitzpatrick_tone: row.get("Fitzpatrick_Tone"),
                notes: row.get("Notes"),
                folder_name: row.get("Folder_Name"),
                base_path: row.get("Base_Path"),
                status: row.get("Image_Set_Status"),
                meta: serde_json::from_str(&row.get("Meta"))
                    .unwrap_or(serde_json::Value::Null),
                last_updated_utc: parse_utc(&row.get("Last_Updated_Utc")),
            });
        }
        Ok(out)
    }

    fn save_subject_rows(&self, rows: &[SubjectRecord]) -> Result<()> {
        let mut sheet = Vec::with_capacity(rows.len());
        for r in rows {
            let id = r
                .subject_id
                .as_ref()
                .ok_or_else(|| Error::Registry("subject row without id".to_string()))?;
            let meta = if r.meta.is_null() {
                String::new()
            } else {
                serde_json::to_string(&r.meta)
                    .map_err(|e| Error::Registry(format!("serialize meta: {e}")))?
            };
            sheet.push(vec![
                id.as_str().to_string(),
                r.sex.clone(),
                r.ethnicity_group.clone(),
                r.fitzpatrick_tone.clone(),
                r.notes.clone(),
                r.folder_name.clone(),
                r.base_path.clone(),
                r.status.clone(),
                meta,
                r.last_updated_utc.map(format_utc).unwrap_or_default(),
            ]);
        }
        write_sheet(&self.subjects_path(), &SUBJECT_COLUMNS, &sheet)
    }

    fn load_image_rows(&self) -> Result<Vec<ImageRecord>> {
        let rows = read_sheet(&self.images_path())?;
        let mut out = Vec::new();
        for row in rows {
            let subject_id = match SubjectId::parse(&row.get("SubjectID")) {
                Ok(id) => id,
                Err(_) => continue,
            };
            let age = match row
                .get("TargetAge")
                .parse::<u8>()
                .ok()
                .and_then(|a| AgeLabel::new(a).ok())
            {
                Some(age) => age,
                None => {
                    warn!(
                        "skipping image row with bad age for {}: {:?}",
                        subject_id,
                        row.get("TargetAge")
                    );
                    continue;
                }
            };
            let stored_utc = match parse_utc(&row.get("Stored_Utc")) {
                Some(ts) => ts,
                None => {
                    warn!("skipping image row with bad timestamp for {subject_id}");
                    continue;
                }
            };
            out.push(ImageRecord {
                subject_id,
                timeline: row.get("Timeline"),
                age,
                folder_path: row.get("FolderPath"),
                filename: row.get("Filename"),
                image_id: row.get("ImageID"),
                generation_stage: row.get("GenerationStage"),
                source_model_tool: row.get("SourceModelTool"),
                run_id: row.get("RunID"),
                stored_utc,
            });
        }
        Ok(out)
    }

    fn save_image_rows(&self, rows: &[ImageRecord]) -> Result<()> {
        let sheet: Vec<Vec<String>> = rows
            .iter()
            .map(|r| {
                vec![
                    r.subject_id.as_str().to_string(),
                    r.timeline.clone(),
                    r.age.value().to_string(),
                    r.folder_path.clone(),
                    r.filename.clone(),
                    r.image_id.clone(),
                    r.generation_stage.clone(),
                    r.source_model_tool.clone(),
                    r.run_id.clone(),
                    format_utc(r.stored_utc),
                ]
            })
            .collect();
        write_sheet(&self.images_path(), &IMAGE_COLUMNS, &sheet)
    }
}

#[async_trait]
impl Registry for SheetRegistry {
    async fn upsert_subject(&self, record: &SubjectRecord) -> Result<SubjectId> {
        let _guard = self.write_lock.lock().await;
        self.retry_locked(|| {
            ensure_unlocked(&self.subjects_path())?;
            let mut rows = self.load_subject_rows()?;

            let id = match &record.subject_id {
                Some(id) => id.clone(),
                None => {
                    let next = rows
                        .iter()
                        .filter_map(|r| r.subject_id.as_ref().map(|i| i.sequence()))
                        .max()
                        .unwrap_or(0)
                        + 1;
                    SubjectId::from_sequence(next)
                }
            };

            let mut updated = record.clone();
            updated.subject_id = Some(id.clone());
            updated.last_updated_utc = Some(Utc::now());
            if updated.folder_name.is_empty() {
                updated.folder_name = id.as_str().to_string();
            }

            match rows
                .iter()
                .position(|r| r.subject_id.as_ref() == Some(&id))
            {
                Some(i) => rows[i] = updated,
                None => rows.push(updated),
            }
            rows.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));

            self.save_subject_rows(&rows)?;
            debug!(subject = %id, "subject row upserted");
            Ok(id)
        })
        .await
    }

    async fn upsert_image_record(&self, record: &ImageRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.retry_locked(|| {
            ensure_unlocked(&self.images_path())?;
            let mut rows = self.load_image_rows()?;

            let slot_of = |r: &ImageRecord| {
                (
                    r.subject_id.clone(),
                    r.timeline.clone(),
                    r.age,
                )
            };
            let key = slot_of(record);
            match rows.iter().position(|r| slot_of(r) == key) {
                Some(i) => rows[i] = record.clone(),
                None => rows.push(record.clone()),
            }
            rows.sort_by(|a, b| slot_of(a).cmp(&slot_of(b)));

            self.save_image_rows(&rows)?;
            debug!(subject = %record.subject_id, image = %record.image_id, "image row upserted");
            Ok(())
        })
        .await
    }

    async fn read_subject(&self, subject_id: &SubjectId) -> Result<Option<SubjectRecord>> {
        self.retry_locked(|| {
            ensure_unlocked(&self.subjects_path())?;
            let rows = self.load_subject_rows()?;
            Ok(rows
                .into_iter()
                .find(|r| r.subject_id.as_ref() == Some(subject_id)))
        })
        .await
    }

    async fn list_subjects(&self) -> Result<Vec<SubjectRecord>> {
        self.retry_locked(|| {
            ensure_unlocked(&self.subjects_path())?;
            self.load_subject_rows()
        })
        .await
    }
}

/// In-memory subject lookup, refreshed from the registry when an unknown
/// subject shows up mid-run (new subjects are created by the UI while the
/// watcher is running).
#[derive(Default)]
pub struct SubjectCache {
    inner: RwLock<HashMap<SubjectId, SubjectRecord>>,
}

impl SubjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh(&self, registry: &dyn Registry) -> Result<usize> {
        let subjects = registry.list_subjects().await?;
        let mut map = HashMap::with_capacity(subjects.len());
        for record in subjects {
            if let Some(id) = record.subject_id.clone() {
                map.insert(id, record);
            }
        }
        let count = map.len();
        *self.inner.write().await = map;
        Ok(count)
    }

    pub async fn get(&self, subject_id: &SubjectId) -> Option<SubjectRecord> {
        self.inner.read().await.get(subject_id).cloned()
    }
}

// ============================================================================
// Sheet-file plumbing
// ============================================================================

/// Detect the "store open elsewhere" condition.
///
/// Spreadsheet applications leave a `~$`-prefixed owner-lock marker next to
/// the sheet while it is open, and on Windows hold the file itself with a
/// sharing mode that surfaces as permission-denied.
fn ensure_unlocked(path: &Path) -> Result<()> {
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        let marker = parent.join(format!("~${}", name.to_string_lossy()));
        if marker.exists() {
            return Err(Error::RegistryLocked(format!(
                "lock marker present: {}",
                marker.display()
            )));
        }
    }

    if path.exists() {
        match OpenOptions::new().append(true).open(path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(Error::RegistryLocked(
                format!("{} is open in another application", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    } else {
        Ok(())
    }
}

fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn format_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// One parsed sheet row addressed by column name
struct SheetRow {
    columns: std::sync::Arc<HashMap<String, usize>>,
    cells: Vec<String>,
}

impl SheetRow {
    fn get(&self, column: &str) -> String {
        self.columns
            .get(column)
            .and_then(|&i| self.cells.get(i))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}

/// Read a sheet file. A missing file is an empty sheet, not an error: the
/// adapter creates sheets on first write.
fn read_sheet(path: &Path) -> Result<Vec<SheetRow>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(Error::RegistryLocked(format!(
                "{} is open in another application",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };

    let mut records = parse_csv(&content);
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let header = records.remove(0);
    let columns = std::sync::Arc::new(
        header
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect::<HashMap<_, _>>(),
    );

    Ok(records
        .into_iter()
        .map(|cells| SheetRow {
            columns: columns.clone(),
            cells,
        })
        .collect())
}

fn write_sheet(path: &Path, columns: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut out = String::new();
    out.push_str(&encode_csv_row(
        &columns.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
    ));
    for row in rows {
        out.push_str(&encode_csv_row(row));
    }
    crate::fsutil::atomic_write(path, out.as_bytes())
}

fn encode_csv_row(cells: &[String]) -> String {
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        if cell.contains([',', '"', '\n', '\r']) {
            line.push('"');
            line.push_str(&cell.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(cell);
        }
    }
    line.push('\n');
    line
}

/// RFC 4180 parser (quoted fields, doubled quotes, embedded newlines).
fn parse_csv(content: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => row.push(std::mem::take(&mut field)),
                '\r' => {}
                '\n' => {
                    row.push(std::mem::take(&mut field));
                    if !(row.len() == 1 && row[0].is_empty()) {
                        rows.push(std::mem::take(&mut row));
                    } else {
                        row.clear();
                    }
                }
                _ => field.push(c),
            }
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trips_awkward_cells() {
        let cells = vec![
            "plain".to_string(),
            "with,comma".to_string(),
            "with \"quotes\"".to_string(),
            "multi\nline".to_string(),
        ];
        let encoded = encode_csv_row(&cells);
        let parsed = parse_csv(&encoded);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], cells);
    }

    #[test]
    fn parse_skips_blank_lines() {
        let parsed = parse_csv("a,b\n\nc,d\n");
        assert_eq!(parsed, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn lock_marker_is_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let sheet = dir.path().join("Subjects.csv");
        std::fs::write(&sheet, "SubjectID\n").unwrap();
        assert!(ensure_unlocked(&sheet).is_ok());

        std::fs::write(dir.path().join("~$Subjects.csv"), "").unwrap();
        match ensure_unlocked(&sheet) {
            Err(Error::RegistryLocked(_)) => {}
            other => panic!("expected RegistryLocked, got {other:?}"),
        }
    }

    #[test]
    fn missing_sheet_reads_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let rows = read_sheet(&dir.path().join("Images.csv")).unwrap();
        assert!(rows.is_empty());
    }
}
