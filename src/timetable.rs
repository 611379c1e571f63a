//! Timetable slot times and conflict detection.

use chrono::Weekday;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("time must be HH:MM (24h): {0}")]
    BadTime(String),
    #[error("unknown day: {0}")]
    BadDay(String),
    #[error("startTime must be before endTime")]
    EmptyInterval,
}

pub fn parse_day(s: &str) -> Result<Weekday, SlotError> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| SlotError::BadDay(s.to_string()))
}

pub fn day_index(day: Weekday) -> i64 {
    day.num_days_from_monday() as i64
}

pub fn day_from_index(idx: i64) -> Option<Weekday> {
    match idx {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Minutes since midnight for `HH:MM`; `24:00` is accepted as an end time.
pub fn parse_hhmm(s: &str) -> Result<i64, SlotError> {
    let t = s.trim();
    let bad = || SlotError::BadTime(s.to_string());
    let (h, m) = t.split_once(':').ok_or_else(bad)?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return Err(bad());
    }
    let h: i64 = h.parse().map_err(|_| bad())?;
    let m: i64 = m.parse().map_err(|_| bad())?;
    if m > 59 || h > 24 || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

pub fn format_hhmm(minutes: i64) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Half-open intervals `[start, end)`: back-to-back periods do not overlap.
pub fn overlaps(a_start: i64, a_end: i64, b_start: i64, b_end: i64) -> bool {
    a_start < b_end && b_start < a_end
}

#[derive(Debug, Clone)]
pub struct SlotRecord {
    pub id: Option<String>,
    pub class_id: String,
    pub day: Weekday,
    pub start: i64,
    pub end: i64,
    pub teacher_name: Option<String>,
    pub room: Option<String>,
}

impl SlotRecord {
    pub fn check_interval(&self) -> Result<(), SlotError> {
        if self.start >= self.end {
            return Err(SlotError::EmptyInterval);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictReason {
    Class,
    Teacher,
    Room,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub slot_id: String,
    pub class_id: String,
    pub day: String,
    pub start_time: String,
    pub end_time: String,
    pub reasons: Vec<ConflictReason>,
}

fn same_key(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.map(str::trim), b.map(str::trim)) {
        (Some(x), Some(y)) if !x.is_empty() && !y.is_empty() => x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

/// Existing slots that clash with `candidate`. The candidate's own id (when
/// updating) is skipped.
pub fn find_conflicts<'a, I>(candidate: &SlotRecord, existing: I) -> Vec<Conflict>
where
    I: IntoIterator<Item = &'a SlotRecord>,
{
    let mut out = Vec::new();
    for slot in existing {
        let Some(slot_id) = slot.id.as_deref() else {
            continue;
        };
        if candidate.id.as_deref() == Some(slot_id) {
            continue;
        }
        if slot.day != candidate.day
            || !overlaps(candidate.start, candidate.end, slot.start, slot.end)
        {
            continue;
        }
        let mut reasons = Vec::new();
        if slot.class_id == candidate.class_id {
            reasons.push(ConflictReason::Class);
        }
        if same_key(
            candidate.teacher_name.as_deref(),
            slot.teacher_name.as_deref(),
        ) {
            reasons.push(ConflictReason::Teacher);
        }
        if same_key(candidate.room.as_deref(), slot.room.as_deref()) {
            reasons.push(ConflictReason::Room);
        }
        if reasons.is_empty() {
            continue;
        }
        out.push(Conflict {
            slot_id: slot_id.to_string(),
            class_id: slot.class_id.clone(),
            day: day_name(slot.day).to_string(),
            start_time: format_hhmm(slot.start),
            end_time: format_hhmm(slot.end),
            reasons,
        });
    }
    out
}
