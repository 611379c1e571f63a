use crate::attendance::{self, attendance_percent, Bucket, Counts, Roster, Sheet, SheetError};
use crate::ipc::helpers::{
    current_user_id, date_range, db_conn, now_ts, opt_i64, opt_str, required_date, required_str,
    respond, string_array, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use super::classes::load_class;
use super::setup::attendance_policy;

struct RecordRow {
    id: String,
    class_id: String,
    date: String,
    total_students: i64,
    present_count: i64,
    absent_count: i64,
    late_count: i64,
    remarks: Option<String>,
    taken_by: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

const RECORD_COLUMNS: &str = "id, class_id, date, total_students, present_count, absent_count,
    late_count, remarks, taken_by, created_at, updated_at";

fn record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        date: r.get(2)?,
        total_students: r.get(3)?,
        present_count: r.get(4)?,
        absent_count: r.get(5)?,
        late_count: r.get(6)?,
        remarks: r.get(7)?,
        taken_by: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

impl RecordRow {
    fn counts(&self) -> Counts {
        Counts {
            present: self.present_count as usize,
            absent: self.absent_count as usize,
            late: self.late_count as usize,
            total: self.total_students as usize,
        }
    }

    fn summary_json(&self, late_counts_as_present: bool) -> Value {
        json!({
            "id": self.id,
            "classId": self.class_id,
            "date": self.date,
            "totalStudents": self.total_students,
            "presentCount": self.present_count,
            "absentCount": self.absent_count,
            "lateCount": self.late_count,
            "attendanceRate": attendance_percent(&self.counts(), late_counts_as_present),
            "remarks": self.remarks,
            "takenBy": self.taken_by,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }

    fn full_json(&self, sheet: &Sheet, late_counts_as_present: bool) -> Value {
        let mut v = self.summary_json(late_counts_as_present);
        for bucket in Bucket::ALL {
            v[bucket.field()] = json!(sheet.bucket(bucket));
        }
        v
    }
}

fn find_record_by_id(conn: &Connection, id: &str) -> Result<Option<RecordRow>, HandlerErr> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM attendance_records WHERE id = ?", RECORD_COLUMNS),
            [id],
            record_from_row,
        )
        .optional()?)
}

fn find_record_by_day(
    conn: &Connection,
    class_id: &str,
    date: &str,
) -> Result<Option<RecordRow>, HandlerErr> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM attendance_records WHERE class_id = ? AND date = ?",
                RECORD_COLUMNS
            ),
            (class_id, date),
            record_from_row,
        )
        .optional()?)
}

fn load_sheet(conn: &Connection, attendance_id: &str) -> Result<Sheet, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT student_id, status FROM attendance_entries WHERE attendance_id = ? ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([attendance_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Sheet::from_entries(rows.into_iter().filter_map(
        |(id, status)| Bucket::parse(&status).map(|b| (id, b)),
    )))
}

fn class_roster(conn: &Connection, class_id: &str) -> Result<(HashSet<String>, HashSet<String>), HandlerErr> {
    let mut stmt = conn.prepare("SELECT id, active FROM students WHERE class_id = ?")?;
    let rows = stmt
        .query_map([class_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0)))?
        .collect::<Result<Vec<_>, _>>()?;
    let enrolled = rows.iter().map(|(id, _)| id.clone()).collect();
    let active = rows
        .into_iter()
        .filter(|(_, a)| *a)
        .map(|(id, _)| id)
        .collect();
    Ok((enrolled, active))
}

fn sheet_error(e: SheetError) -> HandlerErr {
    let details = e.details();
    HandlerErr::validation(e.to_string()).with_details(details)
}

fn write_entries(conn: &Connection, attendance_id: &str, sheet: &Sheet) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM attendance_entries WHERE attendance_id = ?",
        [attendance_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", "attendance_entries", e))?;
    let mut stmt = conn.prepare(
        "INSERT INTO attendance_entries(attendance_id, student_id, status) VALUES(?, ?, ?)",
    )?;
    for (student_id, bucket) in sheet.entries() {
        stmt.execute((attendance_id, student_id, bucket.as_str()))
            .map_err(|e| HandlerErr::db("db_insert_failed", "attendance_entries", e))?;
    }
    Ok(())
}

/// Creates or replaces the (class, date) record with a validated sheet.
fn save_sheet(
    conn: &Connection,
    existing: Option<&RecordRow>,
    class_id: &str,
    date: &str,
    sheet: &Sheet,
    counts: &Counts,
    remarks: Option<&str>,
    taken_by: Option<&str>,
) -> Result<String, HandlerErr> {
    let now = now_ts();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let attendance_id = match existing {
        Some(rec) => {
            tx.execute(
                "UPDATE attendance_records
                 SET total_students = ?, present_count = ?, absent_count = ?, late_count = ?,
                     remarks = ?, taken_by = ?, updated_at = ?
                 WHERE id = ?",
                rusqlite::params![
                    counts.total as i64,
                    counts.present as i64,
                    counts.absent as i64,
                    counts.late as i64,
                    remarks,
                    taken_by,
                    now,
                    rec.id
                ],
            )
            .map_err(|e| HandlerErr::db("db_update_failed", "attendance_records", e))?;
            rec.id.clone()
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO attendance_records(id, class_id, date, total_students, present_count,
                    absent_count, late_count, remarks, taken_by, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    id,
                    class_id,
                    date,
                    counts.total as i64,
                    counts.present as i64,
                    counts.absent as i64,
                    counts.late as i64,
                    remarks,
                    taken_by,
                    now,
                    now
                ],
            )
            .map_err(|e| HandlerErr::db("db_insert_failed", "attendance_records", e))?;
            id
        }
    };
    write_entries(&tx, &attendance_id, sheet)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(attendance_id)
}

/// Re-derives a record's counts from its entries after students leave it.
/// A record left with nobody on it is removed.
pub fn recount_record(conn: &Connection, attendance_id: &str) -> Result<(), HandlerErr> {
    let sheet = load_sheet(conn, attendance_id)?;
    if sheet.is_empty() {
        conn.execute("DELETE FROM attendance_records WHERE id = ?", [attendance_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", "attendance_records", e))?;
        return Ok(());
    }
    let counts = attendance::validate(&sheet, None).map_err(sheet_error)?;
    conn.execute(
        "UPDATE attendance_records
         SET total_students = ?, present_count = ?, absent_count = ?, late_count = ?, updated_at = ?
         WHERE id = ?",
        (
            counts.total as i64,
            counts.present as i64,
            counts.absent as i64,
            counts.late as i64,
            now_ts(),
            attendance_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "attendance_records", e))?;
    Ok(())
}

fn handle_record(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let class_id = required_str(p, "classId")?;
    let date = required_date(p, "date")?;
    load_class(conn, &class_id)?;

    let total_students = match opt_i64(p, "totalStudents")? {
        Some(n) if n < 0 => return Err(HandlerErr::bad_params("totalStudents must be >= 0")),
        Some(n) => Some(n as usize),
        None => None,
    };
    let sheet = Sheet {
        present: string_array(p, "presentStudents")?,
        absent: string_array(p, "absentStudents")?,
        late: string_array(p, "lateStudents")?,
        total_students,
    };

    let policy = attendance_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let (enrolled, active) = class_roster(conn, &class_id)?;
    let roster = Roster {
        enrolled: &enrolled,
        active: &active,
        require_complete: policy.require_complete_roster,
    };
    let counts = attendance::validate(&sheet, Some(&roster)).map_err(sheet_error)?;

    let existing = find_record_by_day(conn, &class_id, &date)?;
    let taken_by = current_user_id(state);
    let attendance_id = save_sheet(
        conn,
        existing.as_ref(),
        &class_id,
        &date,
        &sheet,
        &counts,
        opt_str(p, "remarks")?.as_deref(),
        taken_by.as_deref(),
    )?;

    let rec = find_record_by_id(conn, &attendance_id)?
        .ok_or_else(|| HandlerErr::not_found("attendance record not found"))?;
    let stored = load_sheet(conn, &attendance_id)?;
    Ok(json!({
        "attendance": rec.full_json(&stored, policy.late_counts_as_present),
        "created": existing.is_none()
    }))
}

fn handle_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let rec = match opt_str(&req.params, "attendanceId")? {
        Some(id) => find_record_by_id(conn, &id)?,
        None => {
            let class_id = required_str(&req.params, "classId")?;
            let date = required_date(&req.params, "date")?;
            find_record_by_day(conn, &class_id, &date)?
        }
    };
    let rec = rec.ok_or_else(|| HandlerErr::not_found("attendance record not found"))?;
    let policy = attendance_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let sheet = load_sheet(conn, &rec.id)?;
    Ok(json!({ "attendance": rec.full_json(&sheet, policy.late_counts_as_present) }))
}

fn records_in_range(
    conn: &Connection,
    class_id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Vec<RecordRow>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM attendance_records
         WHERE class_id = ?1 AND (?2 IS NULL OR date >= ?2) AND (?3 IS NULL OR date <= ?3)
         ORDER BY date DESC",
        RECORD_COLUMNS
    ))?;
    let rows = stmt
        .query_map((class_id, from, to), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let (from, to) = date_range(&req.params)?;
    let policy = attendance_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let records = records_in_range(conn, &class_id, from.as_deref(), to.as_deref())?;
    Ok(json!({
        "records": records
            .iter()
            .map(|r| r.summary_json(policy.late_counts_as_present))
            .collect::<Vec<_>>()
    }))
}

fn handle_set_student_status(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let class_id = required_str(p, "classId")?;
    let date = required_date(p, "date")?;
    let student_id = required_str(p, "studentId")?;
    let bucket = match p.get("status") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(Bucket::parse(s).ok_or_else(|| {
            HandlerErr::bad_params("status must be one of: present, absent, late, null")
        })?),
        Some(_) => {
            return Err(HandlerErr::bad_params(
                "status must be one of: present, absent, late, null",
            ))
        }
    };
    load_class(conn, &class_id)?;

    let existing = find_record_by_day(conn, &class_id, &date)?;
    let mut sheet = match existing.as_ref() {
        Some(rec) => load_sheet(conn, &rec.id)?,
        None => Sheet::default(),
    };
    let before = sheet.status_of(&student_id);
    sheet.set_status(&student_id, bucket);

    if sheet.is_empty() {
        // Removing the last student leaves nothing to record.
        if let Some(rec) = existing.as_ref() {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
            write_entries(&tx, &rec.id, &sheet)?;
            tx.execute("DELETE FROM attendance_records WHERE id = ?", [&rec.id])
                .map_err(|e| HandlerErr::db("db_delete_failed", "attendance_records", e))?;
            tx.commit()
                .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        }
        return Ok(json!({ "attendance": Value::Null, "previousStatus": before.map(Bucket::as_str) }));
    }

    let policy = attendance_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let (mut enrolled, active) = class_roster(conn, &class_id)?;
    // Students already on the sheet stay valid after a transfer.
    for (id, _) in sheet.entries() {
        if id != student_id.as_str() {
            enrolled.insert(id.to_string());
        }
    }
    let roster = Roster {
        enrolled: &enrolled,
        active: &active,
        require_complete: policy.require_complete_roster,
    };
    let counts = attendance::validate(&sheet, Some(&roster)).map_err(sheet_error)?;

    let taken_by = current_user_id(state);
    let attendance_id = save_sheet(
        conn,
        existing.as_ref(),
        &class_id,
        &date,
        &sheet,
        &counts,
        existing.as_ref().and_then(|r| r.remarks.as_deref()),
        taken_by.as_deref(),
    )?;
    let rec = find_record_by_id(conn, &attendance_id)?
        .ok_or_else(|| HandlerErr::not_found("attendance record not found"))?;
    Ok(json!({
        "attendance": rec.full_json(&sheet, policy.late_counts_as_present),
        "previousStatus": before.map(Bucket::as_str)
    }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let attendance_id = required_str(&req.params, "attendanceId")?;
    if find_record_by_id(conn, &attendance_id)?.is_none() {
        return Err(HandlerErr::not_found("attendance record not found"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM attendance_entries WHERE attendance_id = ?",
        [&attendance_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", "attendance_entries", e))?;
    tx.execute("DELETE FROM attendance_records WHERE id = ?", [&attendance_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "attendance_records", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn add_status(counts: &mut Counts, bucket: Bucket) {
    match bucket {
        Bucket::Present => counts.present += 1,
        Bucket::Absent => counts.absent += 1,
        Bucket::Late => counts.late += 1,
    }
    counts.total += 1;
}

fn counts_json(c: &Counts, late_counts_as_present: bool) -> Value {
    json!({
        "present": c.present,
        "absent": c.absent,
        "late": c.late,
        "total": c.total,
        "percentage": attendance_percent(c, late_counts_as_present)
    })
}

fn handle_student_report(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let (from, to) = date_range(&req.params)?;
    let student = super::students::load_student(conn, &student_id)?;
    let policy = attendance_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut stmt = conn.prepare(
        "SELECT r.date, r.class_id, e.status
         FROM attendance_entries e
         JOIN attendance_records r ON r.id = e.attendance_id
         WHERE e.student_id = ?1 AND (?2 IS NULL OR r.date >= ?2) AND (?3 IS NULL OR r.date <= ?3)
         ORDER BY r.date",
    )?;
    let rows = stmt
        .query_map((&student_id, &from, &to), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = Counts::default();
    let mut days = Vec::with_capacity(rows.len());
    for (date, class_id, status) in rows {
        if let Some(bucket) = Bucket::parse(&status) {
            add_status(&mut counts, bucket);
        }
        days.push(json!({ "date": date, "classId": class_id, "status": status }));
    }
    let pct = attendance_percent(&counts, policy.late_counts_as_present);
    Ok(json!({
        "studentId": student.id,
        "fullName": student.full_name(),
        "summary": counts_json(&counts, policy.late_counts_as_present),
        "belowThreshold": pct.map(|v| v < policy.low_attendance_threshold).unwrap_or(false),
        "days": days
    }))
}

fn handle_class_report(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let (from, to) = date_range(&req.params)?;
    let class = load_class(conn, &class_id)?;
    let policy = attendance_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let late_ok = policy.late_counts_as_present;

    let mut records = records_in_range(conn, &class_id, from.as_deref(), to.as_deref())?;
    records.reverse();

    let mut per_student: BTreeMap<String, Counts> = BTreeMap::new();
    for s in super::students::class_students(conn, &class_id, false)? {
        per_student.insert(s.id, Counts::default());
    }
    let mut daily = Vec::with_capacity(records.len());
    let mut overall = Counts::default();
    for rec in &records {
        let sheet = load_sheet(conn, &rec.id)?;
        for (student_id, bucket) in sheet.entries() {
            add_status(per_student.entry(student_id.to_string()).or_default(), bucket);
            add_status(&mut overall, bucket);
        }
        daily.push(json!({
            "date": rec.date,
            "present": rec.present_count,
            "absent": rec.absent_count,
            "late": rec.late_count,
            "total": rec.total_students,
            "attendanceRate": attendance_percent(&rec.counts(), late_ok)
        }));
    }

    let names: BTreeMap<String, String> = super::students::class_students(conn, &class_id, false)?
        .into_iter()
        .map(|s| {
            let name = s.full_name();
            (s.id, name)
        })
        .collect();
    let students: Vec<Value> = per_student
        .iter()
        .map(|(id, c)| {
            let pct = attendance_percent(c, late_ok);
            json!({
                "studentId": id,
                "fullName": names.get(id),
                "present": c.present,
                "absent": c.absent,
                "late": c.late,
                "total": c.total,
                "percentage": pct,
                "lowAttendance": pct.map(|v| v < policy.low_attendance_threshold).unwrap_or(false)
            })
        })
        .collect();

    Ok(json!({
        "classId": class.id,
        "className": class.display_name(),
        "days": records.len(),
        "threshold": policy.low_attendance_threshold,
        "overall": counts_json(&overall, late_ok),
        "students": students,
        "daily": daily
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "attendance.record" => handle_record(state, req),
        "attendance.get" => handle_get(state, req),
        "attendance.list" => handle_list(state, req),
        "attendance.setStudentStatus" => handle_set_student_status(state, req),
        "attendance.delete" => handle_delete(state, req),
        "attendance.studentReport" => handle_student_report(state, req),
        "attendance.classReport" => handle_class_report(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
