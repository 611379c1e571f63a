//! Attendance sheet model and the bucket-consistency rules every write path
//! goes through.

use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Present,
    Absent,
    Late,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Present, Bucket::Absent, Bucket::Late];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "late" => Some(Self::Late),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
        }
    }

    /// Request/response field holding this bucket's student ids.
    pub fn field(self) -> &'static str {
        match self {
            Self::Present => "presentStudents",
            Self::Absent => "absentStudents",
            Self::Late => "lateStudents",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub present: Vec<String>,
    pub absent: Vec<String>,
    pub late: Vec<String>,
    /// Declared head count; when present it must reconcile with the buckets.
    pub total_students: Option<usize>,
}

impl Sheet {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Bucket)>,
    {
        let mut sheet = Self::default();
        for (student_id, bucket) in entries {
            sheet.bucket_mut(bucket).push(student_id);
        }
        sheet
    }

    pub fn bucket(&self, bucket: Bucket) -> &[String] {
        match bucket {
            Bucket::Present => &self.present,
            Bucket::Absent => &self.absent,
            Bucket::Late => &self.late,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<String> {
        match bucket {
            Bucket::Present => &mut self.present,
            Bucket::Absent => &mut self.absent,
            Bucket::Late => &mut self.late,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, Bucket)> {
        Bucket::ALL
            .into_iter()
            .flat_map(move |b| self.bucket(b).iter().map(move |id| (id.as_str(), b)))
    }

    pub fn status_of(&self, student_id: &str) -> Option<Bucket> {
        Bucket::ALL
            .into_iter()
            .find(|b| self.bucket(*b).iter().any(|id| id == student_id))
    }

    /// Moves a student to `bucket`, or drops them from the sheet with `None`.
    /// A declared total no longer applies once membership changes.
    pub fn set_status(&mut self, student_id: &str, bucket: Option<Bucket>) {
        for b in Bucket::ALL {
            self.bucket_mut(b).retain(|id| id != student_id);
        }
        if let Some(b) = bucket {
            self.bucket_mut(b).push(student_id.to_string());
        }
        self.total_students = None;
    }

    pub fn remove_student(&mut self, student_id: &str) -> bool {
        let before = self.len();
        self.set_status(student_id, None);
        self.len() != before
    }

    pub fn len(&self) -> usize {
        self.present.len() + self.absent.len() + self.late.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub total: usize,
}

impl Counts {
    pub fn attended(&self, late_counts_as_present: bool) -> usize {
        if late_counts_as_present {
            self.present + self.late
        } else {
            self.present
        }
    }
}

/// Class membership used to check the ids on a sheet.
pub struct Roster<'a> {
    pub enrolled: &'a HashSet<String>,
    pub active: &'a HashSet<String>,
    pub require_complete: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SheetError {
    #[error("attendance sheet lists no students")]
    Empty,
    #[error("students listed more than once: {}", .0.join(", "))]
    DuplicateStudents(Vec<String>),
    #[error("totalStudents is {declared} but the buckets hold {counted}")]
    CountMismatch { declared: usize, counted: usize },
    #[error("students not enrolled in this class: {}", .0.join(", "))]
    UnknownStudents(Vec<String>),
    #[error("active students missing from the sheet: {}", .0.join(", "))]
    MissingStudents(Vec<String>),
}

impl SheetError {
    pub fn details(&self) -> Value {
        match self {
            Self::Empty => json!({ "rule": "non_empty" }),
            Self::DuplicateStudents(ids) => json!({ "rule": "single_bucket", "studentIds": ids }),
            Self::CountMismatch { declared, counted } => json!({
                "rule": "total_reconciles",
                "totalStudents": declared,
                "counted": counted
            }),
            Self::UnknownStudents(ids) => json!({ "rule": "enrolled", "studentIds": ids }),
            Self::MissingStudents(ids) => json!({ "rule": "complete_roster", "studentIds": ids }),
        }
    }
}

pub fn validate(sheet: &Sheet, roster: Option<&Roster<'_>>) -> Result<Counts, SheetError> {
    if sheet.is_empty() {
        return Err(SheetError::Empty);
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (id, _) in sheet.entries() {
        *seen.entry(id).or_insert(0) += 1;
    }
    let duplicates: BTreeSet<&str> = seen
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(id, _)| *id)
        .collect();
    if !duplicates.is_empty() {
        return Err(SheetError::DuplicateStudents(
            duplicates.into_iter().map(str::to_string).collect(),
        ));
    }

    let counts = Counts {
        present: sheet.present.len(),
        absent: sheet.absent.len(),
        late: sheet.late.len(),
        total: sheet.len(),
    };
    if let Some(declared) = sheet.total_students {
        if declared != counts.total {
            return Err(SheetError::CountMismatch {
                declared,
                counted: counts.total,
            });
        }
    }

    if let Some(roster) = roster {
        let unknown: BTreeSet<&str> = seen
            .keys()
            .filter(|id| !roster.enrolled.contains(**id))
            .copied()
            .collect();
        if !unknown.is_empty() {
            return Err(SheetError::UnknownStudents(
                unknown.into_iter().map(str::to_string).collect(),
            ));
        }
        if roster.require_complete {
            let missing: BTreeSet<&str> = roster
                .active
                .iter()
                .map(String::as_str)
                .filter(|id| !seen.contains_key(id))
                .collect();
            if !missing.is_empty() {
                return Err(SheetError::MissingStudents(
                    missing.into_iter().map(str::to_string).collect(),
                ));
            }
        }
    }

    Ok(counts)
}

/// Percentage of recorded days attended, or `None` with no recorded days.
pub fn attendance_percent(counts: &Counts, late_counts_as_present: bool) -> Option<f64> {
    if counts.total == 0 {
        return None;
    }
    let pct = 100.0 * counts.attended(late_counts_as_present) as f64 / counts.total as f64;
    Some((pct * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn set(v: &[&str]) -> HashSet<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn consistent_sheet_counts_each_bucket() {
        let sheet = Sheet {
            present: ids(&["a", "b"]),
            absent: ids(&["c"]),
            late: ids(&["d"]),
            total_students: Some(4),
        };
        let c = validate(&sheet, None).expect("valid");
        assert_eq!((c.present, c.absent, c.late, c.total), (2, 1, 1, 4));
    }

    #[test]
    fn student_in_two_buckets_is_rejected() {
        let sheet = Sheet {
            present: ids(&["a", "b"]),
            absent: ids(&["b"]),
            late: ids(&["a"]),
            total_students: None,
        };
        assert_eq!(
            validate(&sheet, None),
            Err(SheetError::DuplicateStudents(ids(&["a", "b"])))
        );
    }

    #[test]
    fn repeat_within_one_bucket_is_rejected() {
        let sheet = Sheet {
            present: ids(&["a", "a"]),
            ..Sheet::default()
        };
        assert_eq!(
            validate(&sheet, None),
            Err(SheetError::DuplicateStudents(ids(&["a"])))
        );
    }

    #[test]
    fn declared_total_must_reconcile() {
        let sheet = Sheet {
            present: ids(&["a"]),
            absent: ids(&["b"]),
            late: vec![],
            total_students: Some(3),
        };
        assert_eq!(
            validate(&sheet, None),
            Err(SheetError::CountMismatch {
                declared: 3,
                counted: 2
            })
        );
    }

    #[test]
    fn empty_sheet_is_rejected() {
        assert_eq!(validate(&Sheet::default(), None), Err(SheetError::Empty));
    }

    #[test]
    fn roster_rejects_strangers_and_optionally_missing_students() {
        let enrolled = set(&["a", "b", "c"]);
        let active = set(&["a", "b", "c"]);
        let sheet = Sheet {
            present: ids(&["a", "x"]),
            ..Sheet::default()
        };
        let roster = Roster {
            enrolled: &enrolled,
            active: &active,
            require_complete: false,
        };
        assert_eq!(
            validate(&sheet, Some(&roster)),
            Err(SheetError::UnknownStudents(ids(&["x"])))
        );

        let sheet = Sheet {
            present: ids(&["a"]),
            ..Sheet::default()
        };
        assert!(validate(&sheet, Some(&roster)).is_ok());
        let strict = Roster {
            require_complete: true,
            ..roster
        };
        assert_eq!(
            validate(&sheet, Some(&strict)),
            Err(SheetError::MissingStudents(ids(&["b", "c"])))
        );
    }

    #[test]
    fn set_status_moves_between_buckets() {
        let mut sheet = Sheet {
            present: ids(&["a", "b"]),
            absent: ids(&["c"]),
            late: vec![],
            total_students: Some(3),
        };
        sheet.set_status("b", Some(Bucket::Late));
        assert_eq!(sheet.status_of("b"), Some(Bucket::Late));
        assert_eq!(sheet.present, ids(&["a"]));
        assert_eq!(sheet.total_students, None);
        assert!(sheet.remove_student("c"));
        assert!(!sheet.remove_student("c"));
        let c = validate(&sheet, None).expect("still valid");
        assert_eq!((c.present, c.absent, c.late), (1, 0, 1));
    }

    #[test]
    fn percent_honours_late_policy() {
        let c = Counts {
            present: 6,
            absent: 2,
            late: 2,
            total: 10,
        };
        assert_eq!(attendance_percent(&c, true), Some(80.0));
        assert_eq!(attendance_percent(&c, false), Some(60.0));
        assert_eq!(attendance_percent(&Counts::default(), true), None);
    }
}
