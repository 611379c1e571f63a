use crate::ipc::helpers::{
    db_conn, now_ts, opt_str, patch_str, required_str, respond, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::timetable::{
    day_from_index, day_index, day_name, find_conflicts, format_hhmm, parse_day, parse_hhmm,
    Conflict, SlotError, SlotRecord,
};
use chrono::Weekday;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use super::subjects::load_subject;

struct SlotRow {
    record: SlotRecord,
    subject_id: String,
    subject_name: Option<String>,
    subject_code: Option<String>,
}

impl SlotRow {
    fn id(&self) -> &str {
        self.record.id.as_deref().unwrap_or("")
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id(),
            "classId": self.record.class_id,
            "subjectId": self.subject_id,
            "subjectName": self.subject_name,
            "subjectCode": self.subject_code,
            "day": day_name(self.record.day),
            "startTime": format_hhmm(self.record.start),
            "endTime": format_hhmm(self.record.end),
            "room": self.record.room,
            "teacherName": self.record.teacher_name
        })
    }
}

const SLOT_SELECT: &str = "SELECT t.id, t.class_id, t.subject_id, t.day, t.start_minute,
    t.end_minute, t.room, t.teacher_name, sb.name, sb.code
    FROM timetable_slots t
    LEFT JOIN subjects sb ON sb.id = t.subject_id";

fn slot_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SlotRow> {
    let day: i64 = r.get(3)?;
    Ok(SlotRow {
        record: SlotRecord {
            id: Some(r.get(0)?),
            class_id: r.get(1)?,
            day: day_from_index(day).unwrap_or(Weekday::Mon),
            start: r.get(4)?,
            end: r.get(5)?,
            room: r.get(6)?,
            teacher_name: r.get(7)?,
        },
        subject_id: r.get(2)?,
        subject_name: r.get(8)?,
        subject_code: r.get(9)?,
    })
}

fn load_slot(conn: &Connection, slot_id: &str) -> Result<SlotRow, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE t.id = ?", SLOT_SELECT),
        [slot_id],
        slot_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("timetable slot not found"))
}

fn slots_on_day(conn: &Connection, day: Weekday) -> Result<Vec<SlotRecord>, HandlerErr> {
    let mut stmt = conn.prepare(&format!("{} WHERE t.day = ?", SLOT_SELECT))?;
    let rows = stmt
        .query_map([day_index(day)], slot_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|s| s.record).collect())
}

fn slot_error(e: SlotError) -> HandlerErr {
    HandlerErr::bad_params(e.to_string())
}

fn conflicts_for(conn: &Connection, candidate: &SlotRecord) -> Result<Vec<Conflict>, HandlerErr> {
    candidate.check_interval().map_err(slot_error)?;
    let existing = slots_on_day(conn, candidate.day)?;
    Ok(find_conflicts(candidate, &existing))
}

fn conflict_error(conflicts: Vec<Conflict>) -> HandlerErr {
    HandlerErr::conflict("timetable slot overlaps existing slots")
        .with_details(json!({ "conflicts": conflicts }))
}

fn parse_day_param(params: &Value) -> Result<Weekday, HandlerErr> {
    parse_day(&required_str(params, "day")?).map_err(slot_error)
}

fn parse_time_param(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    parse_hhmm(&required_str(params, key)?).map_err(slot_error)
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = opt_str(&req.params, "classId")?;
    let day = match opt_str(&req.params, "day")? {
        Some(d) => Some(day_index(parse_day(&d).map_err(slot_error)?)),
        None => None,
    };
    let teacher = opt_str(&req.params, "teacherName")?.map(|t| t.to_lowercase());
    let mut stmt = conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR t.class_id = ?1)
           AND (?2 IS NULL OR t.day = ?2)
           AND (?3 IS NULL OR lower(trim(t.teacher_name)) = ?3)
         ORDER BY t.day, t.start_minute, t.class_id",
        SLOT_SELECT
    ))?;
    let slots = stmt
        .query_map((&class_id, day, &teacher), slot_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "slots": slots.iter().map(SlotRow::to_json).collect::<Vec<_>>() }))
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let class_id = required_str(p, "classId")?;
    let subject_id = required_str(p, "subjectId")?;
    super::classes::load_class(conn, &class_id)?;
    let subject = load_subject(conn, &subject_id)?;
    if subject.class_id != class_id {
        return Err(HandlerErr::bad_params("subject does not belong to this class"));
    }

    let candidate = SlotRecord {
        id: None,
        class_id: class_id.clone(),
        day: parse_day_param(p)?,
        start: parse_time_param(p, "startTime")?,
        end: parse_time_param(p, "endTime")?,
        teacher_name: opt_str(p, "teacherName")?.or(subject.teacher_name.clone()),
        room: opt_str(p, "room")?,
    };
    let conflicts = conflicts_for(conn, &candidate)?;
    if !conflicts.is_empty() {
        return Err(conflict_error(conflicts));
    }

    let slot_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO timetable_slots(id, class_id, subject_id, day, start_minute, end_minute,
            room, teacher_name, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            slot_id,
            class_id,
            subject_id,
            day_index(candidate.day),
            candidate.start,
            candidate.end,
            candidate.room,
            candidate.teacher_name,
            now_ts()
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "timetable_slots", e))?;
    Ok(json!({ "slotId": slot_id, "slot": load_slot(conn, &slot_id)?.to_json() }))
}

fn handle_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let slot_id = required_str(p, "slotId")?;
    let current = load_slot(conn, &slot_id)?;

    let subject_id = opt_str(p, "subjectId")?.unwrap_or(current.subject_id.clone());
    let subject = load_subject(conn, &subject_id)?;
    if subject.class_id != current.record.class_id {
        return Err(HandlerErr::bad_params("subject does not belong to this class"));
    }
    let day = match opt_str(p, "day")? {
        Some(d) => parse_day(&d).map_err(slot_error)?,
        None => current.record.day,
    };
    let start = match opt_str(p, "startTime")? {
        Some(t) => parse_hhmm(&t).map_err(slot_error)?,
        None => current.record.start,
    };
    let end = match opt_str(p, "endTime")? {
        Some(t) => parse_hhmm(&t).map_err(slot_error)?,
        None => current.record.end,
    };
    let teacher_name = match patch_str(p, "teacherName")? {
        Some(t) => t,
        None if subject_id != current.subject_id => subject.teacher_name.clone(),
        None => current.record.teacher_name.clone(),
    };
    let room = patch_str(p, "room")?.unwrap_or(current.record.room.clone());

    let candidate = SlotRecord {
        id: Some(slot_id.clone()),
        class_id: current.record.class_id.clone(),
        day,
        start,
        end,
        teacher_name,
        room,
    };
    let conflicts = conflicts_for(conn, &candidate)?;
    if !conflicts.is_empty() {
        return Err(conflict_error(conflicts));
    }

    conn.execute(
        "UPDATE timetable_slots SET subject_id = ?, day = ?, start_minute = ?, end_minute = ?,
            room = ?, teacher_name = ?
         WHERE id = ?",
        rusqlite::params![
            subject_id,
            day_index(candidate.day),
            candidate.start,
            candidate.end,
            candidate.room,
            candidate.teacher_name,
            slot_id
        ],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "timetable_slots", e))?;
    Ok(json!({ "slot": load_slot(conn, &slot_id)?.to_json() }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let slot_id = required_str(&req.params, "slotId")?;
    let n = conn
        .execute("DELETE FROM timetable_slots WHERE id = ?", [&slot_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "timetable_slots", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("timetable slot not found"));
    }
    Ok(json!({ "ok": true }))
}

fn handle_check_conflicts(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let candidate = SlotRecord {
        id: opt_str(p, "excludeSlotId")?,
        class_id: required_str(p, "classId")?,
        day: parse_day_param(p)?,
        start: parse_time_param(p, "startTime")?,
        end: parse_time_param(p, "endTime")?,
        teacher_name: opt_str(p, "teacherName")?,
        room: opt_str(p, "room")?,
    };
    let conflicts = conflicts_for(conn, &candidate)?;
    Ok(json!({
        "hasConflicts": !conflicts.is_empty(),
        "conflicts": conflicts
    }))
}

fn handle_weekly(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let class = super::classes::load_class(conn, &class_id)?;
    let mut stmt = conn.prepare(&format!(
        "{} WHERE t.class_id = ? ORDER BY t.day, t.start_minute",
        SLOT_SELECT
    ))?;
    let slots = stmt
        .query_map([&class_id], slot_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let days: Vec<Value> = (0..7)
        .filter_map(day_from_index)
        .map(|day| {
            let day_slots: Vec<Value> = slots
                .iter()
                .filter(|s| s.record.day == day)
                .map(SlotRow::to_json)
                .collect();
            json!({ "day": day_name(day), "slots": day_slots })
        })
        .collect();
    Ok(json!({
        "classId": class.id,
        "className": class.display_name(),
        "days": days
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "timetable.list" => handle_list(state, req),
        "timetable.create" => handle_create(state, req),
        "timetable.update" => handle_update(state, req),
        "timetable.delete" => handle_delete(state, req),
        "timetable.checkConflicts" => handle_check_conflicts(state, req),
        "timetable.weekly" => handle_weekly(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
