//! Path/name resolver
//!
//! Pure, stateless classification of raw generator output filenames into
//! (subject, age) pairs, plus canonical destination computation. Two naming
//! conventions are accepted:
//!
//! - preferred: `S004_A45_00001_.png` (`{SubjectId}_A{age}[_suffix].{ext}`)
//! - legacy:    `subject004_age045_00001_.png`
//!
//! Anything else — wrong pattern, non-timeline age, disallowed extension —
//! is unclassifiable and silently ignored by callers; the output directory
//! may contain unrelated files.

use a360_common::subject::{canonical_filename, AgeLabel, SubjectId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static PREFERRED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^S(\d{3})_A(\d{1,3})(?:_.*)?$").expect("valid pattern"));

static LEGACY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^subject(\d{3})_age(\d{3})(?:_.*)?$").expect("valid pattern"));

/// Raster image extensions accepted from the generator.
const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Successful classification of a raw output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub subject_id: SubjectId,
    pub age: AgeLabel,
}

/// Classify a raw path written by the external generator.
///
/// Returns None for anything that does not belong to a timeline slot.
/// Identical input always yields identical output; no I/O is performed.
pub fn classify(raw_path: &Path) -> Option<Classification> {
    let ext = raw_path.extension()?.to_str()?.to_ascii_lowercase();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }

    let stem = raw_path.file_stem()?.to_str()?;

    let (digits, age_raw) = if let Some(caps) = PREFERRED.captures(stem) {
        (caps[1].to_string(), caps[2].to_string())
    } else if let Some(caps) = LEGACY.captures(stem) {
        (caps[1].to_string(), caps[2].to_string())
    } else {
        return None;
    };

    let age_num: u16 = age_raw.parse().ok()?;
    let age = u8::try_from(age_num).ok().and_then(|a| AgeLabel::new(a).ok())?;
    let subject_id = SubjectId::parse(&digits).ok()?;

    Some(Classification { subject_id, age })
}

/// Canonical destination for a classified file.
///
/// Always `{timeline_dir}/{SubjectId}_A{age}.png` regardless of the source
/// extension: downstream consumers rely on a single naming scheme and
/// extension.
pub fn canonical_destination(
    timeline_dir: &Path,
    subject_id: &SubjectId,
    age: AgeLabel,
) -> PathBuf {
    timeline_dir.join(canonical_filename(subject_id, age))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_name(name: &str) -> Option<Classification> {
        classify(Path::new(name))
    }

    #[test]
    fn preferred_pattern_classifies() {
        let c = classify_name("S004_A45_00001_.png").unwrap();
        assert_eq!(c.subject_id.as_str(), "S004");
        assert_eq!(c.age.value(), 45);
    }

    #[test]
    fn preferred_pattern_without_suffix() {
        let c = classify_name("S010_A20.png").unwrap();
        assert_eq!(c.subject_id.as_str(), "S010");
        assert_eq!(c.age.value(), 20);
    }

    #[test]
    fn legacy_pattern_normalizes_subject() {
        let c = classify_name("subject004_age045_00008_.png").unwrap();
        assert_eq!(c.subject_id.as_str(), "S004");
        assert_eq!(c.age.value(), 45);
    }

    #[test]
    fn case_is_insensitive() {
        assert!(classify_name("s004_a45.PNG").is_some());
        assert!(classify_name("SUBJECT004_AGE070.jpg").is_some());
    }

    #[test]
    fn unrelated_files_are_unclassifiable() {
        assert!(classify_name("random.txt").is_none());
        assert!(classify_name("notes.png").is_none());
        assert!(classify_name("S004_A45.gif").is_none());
        assert!(classify_name("S004_A45").is_none()); // no extension
    }

    #[test]
    fn out_of_range_ages_are_unclassifiable() {
        assert!(classify_name("S004_A21.png").is_none());
        assert!(classify_name("S004_A75.png").is_none());
        assert!(classify_name("S004_A200.png").is_none());
        assert!(classify_name("subject004_age019_.png").is_none());
    }

    #[test]
    fn all_allowed_extensions_classify() {
        for ext in ["png", "jpg", "jpeg", "webp"] {
            assert!(
                classify_name(&format!("S001_A30.{ext}")).is_some(),
                "extension {ext} should classify"
            );
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify_name("S004_A45_00001_.png");
        let b = classify_name("S004_A45_00001_.png");
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_destination_is_normalized_png() {
        let c = classify_name("S010_A20_00001_.webp").unwrap();
        let dest = canonical_destination(Path::new("/data/S010/TimelineA"), &c.subject_id, c.age);
        assert_eq!(dest, Path::new("/data/S010/TimelineA/S010_A20.png"));
    }
}
