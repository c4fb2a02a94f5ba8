//! Subject and age-label identifiers
//!
//! Canonical subject codes are an uppercase `S` followed by a zero-padded
//! three-digit sequence number (`S004`). Age labels come from the fixed
//! timeline set (20..=70 in 5-year steps); anything else is rejected at the
//! type boundary so downstream code never sees an out-of-range age.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed, ordered set of timeline ages. One image slot exists per
/// (subject, age) pair for every age in this list.
pub const TIMELINE_AGES: [u8; 11] = [20, 25, 30, 35, 40, 45, 50, 55, 60, 65, 70];

/// Canonical subject identifier (`S` + 3-digit sequence, e.g. `S004`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Parse and normalize a subject identifier.
    ///
    /// Accepts `S004`, `s004`, `004` or `4`; always stores the canonical
    /// uppercase zero-padded form.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix('S')
            .or_else(|| trimmed.strip_prefix('s'))
            .unwrap_or(trimmed);

        if digits.is_empty() || digits.len() > 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidInput(format!(
                "invalid subject id: {raw:?}"
            )));
        }

        let seq: u16 = digits
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid subject id: {raw:?}")))?;
        Ok(Self::from_sequence(seq))
    }

    /// Build a canonical identifier from a sequence number.
    pub fn from_sequence(seq: u16) -> Self {
        SubjectId(format!("S{seq:03}"))
    }

    /// The numeric sequence component (`S004` -> 4).
    pub fn sequence(&self) -> u16 {
        self.0[1..].parse().unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the fixed timeline ages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgeLabel(u8);

impl AgeLabel {
    /// Validate membership in the timeline age set.
    pub fn new(age: u8) -> Result<Self> {
        if TIMELINE_AGES.contains(&age) {
            Ok(AgeLabel(age))
        } else {
            Err(Error::InvalidInput(format!("age {age} is not a timeline age")))
        }
    }

    /// Membership check without constructing.
    pub fn is_timeline_age(age: u8) -> bool {
        TIMELINE_AGES.contains(&age)
    }

    /// All timeline ages in ascending order.
    pub fn all() -> impl Iterator<Item = AgeLabel> {
        TIMELINE_AGES.iter().map(|&a| AgeLabel(a))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Image key used in events and filenames (`A45`).
    pub fn image_key(self) -> String {
        format!("A{}", self.0)
    }
}

// Display matches the image key so log lines and filenames agree.
impl fmt::Display for AgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// Canonical filename for a stored timeline image (`S004_A45.png`).
///
/// Output is always normalized to `.png` regardless of the source extension.
pub fn canonical_filename(subject: &SubjectId, age: AgeLabel) -> String {
    format!("{}_{}.png", subject, age.image_key())
}

/// Subject metadata as held by the registry.
///
/// Created once via explicit user action, mutated by metadata saves, never
/// deleted by the watcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRecord {
    /// None when the record has not yet been assigned a sequential id
    pub subject_id: Option<SubjectId>,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub ethnicity_group: String,
    #[serde(default)]
    pub fitzpatrick_tone: String,
    #[serde(default)]
    pub notes: String,
    /// Folder name under the subjects root (usually the subject id)
    #[serde(default)]
    pub folder_name: String,
    /// Path of the subject folder relative to the project root, forward slashes
    #[serde(default)]
    pub base_path: String,
    /// Free-form progress status (e.g. "In Progress", "TimelineA complete")
    #[serde(default)]
    pub status: String,
    /// Structured metadata payload (opaque to the watcher)
    #[serde(default)]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub last_updated_utc: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_id_normalizes_to_canonical_form() {
        assert_eq!(SubjectId::parse("S004").unwrap().as_str(), "S004");
        assert_eq!(SubjectId::parse("s004").unwrap().as_str(), "S004");
        assert_eq!(SubjectId::parse("004").unwrap().as_str(), "S004");
        assert_eq!(SubjectId::parse("4").unwrap().as_str(), "S004");
        assert_eq!(SubjectId::parse("S123").unwrap().sequence(), 123);
    }

    #[test]
    fn subject_id_rejects_garbage() {
        assert!(SubjectId::parse("").is_err());
        assert!(SubjectId::parse("S12a").is_err());
        assert!(SubjectId::parse("subject004").is_err());
        assert!(SubjectId::parse("1234").is_err());
    }

    #[test]
    fn age_label_enforces_timeline_membership() {
        assert!(AgeLabel::new(20).is_ok());
        assert!(AgeLabel::new(70).is_ok());
        assert!(AgeLabel::new(21).is_err());
        assert!(AgeLabel::new(75).is_err());
        assert!(AgeLabel::new(0).is_err());
    }

    #[test]
    fn age_labels_are_ordered() {
        let ages: Vec<u8> = AgeLabel::all().map(|a| a.value()).collect();
        assert_eq!(ages.len(), 11);
        assert!(ages.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn canonical_filename_is_normalized_png() {
        let sid = SubjectId::parse("S010").unwrap();
        let age = AgeLabel::new(45).unwrap();
        assert_eq!(canonical_filename(&sid, age), "S010_A45.png");
    }

    #[test]
    fn subject_id_serializes_as_plain_string() {
        let sid = SubjectId::parse("S007").unwrap();
        assert_eq!(serde_json::to_string(&sid).unwrap(), "\"S007\"");
    }
}
