use crate::ipc::helpers::{
    db_conn, like_escape, name_key, now_ts, opt_bool, opt_date, opt_i64, opt_str, patch_str,
    required_str, respond, string_array, today, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::classes::{active_enrolment, load_class, ClassRow};

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub reg_no: String,
    pub first_name: String,
    pub last_name: String,
    pub gender: Option<String>,
    pub date_of_birth: Option<String>,
    pub guardian_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub class_id: String,
    pub roll_no: Option<i64>,
    pub admission_date: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: Option<String>,
    pub class_name: Option<String>,
}

impl StudentRow {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "regNo": self.reg_no,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "fullName": self.full_name(),
            "gender": self.gender,
            "dateOfBirth": self.date_of_birth,
            "guardianName": self.guardian_name,
            "phone": self.phone,
            "email": self.email,
            "address": self.address,
            "classId": self.class_id,
            "className": self.class_name,
            "rollNo": self.roll_no,
            "admissionDate": self.admission_date,
            "active": self.active,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }
}

const STUDENT_SELECT: &str = "SELECT s.id, s.reg_no, s.first_name, s.last_name, s.gender,
    s.date_of_birth, s.guardian_name, s.phone, s.email, s.address, s.class_id, s.roll_no,
    s.admission_date, s.active, s.created_at, s.updated_at,
    CASE WHEN c.section IS NULL OR c.section = '' THEN c.name ELSE c.name || ' - ' || c.section END
    FROM students s
    LEFT JOIN classes c ON c.id = s.class_id";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        reg_no: r.get(1)?,
        first_name: r.get(2)?,
        last_name: r.get(3)?,
        gender: r.get(4)?,
        date_of_birth: r.get(5)?,
        guardian_name: r.get(6)?,
        phone: r.get(7)?,
        email: r.get(8)?,
        address: r.get(9)?,
        class_id: r.get(10)?,
        roll_no: r.get(11)?,
        admission_date: r.get(12)?,
        active: r.get::<_, i64>(13)? != 0,
        created_at: r.get(14)?,
        updated_at: r.get(15)?,
        class_name: r.get(16)?,
    })
}

pub fn find_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRow>, HandlerErr> {
    Ok(conn
        .query_row(
            &format!("{} WHERE s.id = ?", STUDENT_SELECT),
            [student_id],
            student_from_row,
        )
        .optional()?)
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<StudentRow, HandlerErr> {
    find_student(conn, student_id)?.ok_or_else(|| HandlerErr::not_found("student not found"))
}

/// Students of a class in roll/name order; `active_only` drops inactive ones.
pub fn class_students(
    conn: &Connection,
    class_id: &str,
    active_only: bool,
) -> Result<Vec<StudentRow>, HandlerErr> {
    let sql = format!(
        "{} WHERE s.class_id = ?1 AND (?2 = 0 OR s.active = 1)
         ORDER BY s.roll_no IS NULL, s.roll_no, s.last_name, s.first_name",
        STUDENT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((class_id, active_only as i64), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_gender(params: &Value) -> Result<Option<Option<String>>, HandlerErr> {
    match patch_str(params, "gender")? {
        Some(Some(g)) => {
            let g = g.to_ascii_lowercase();
            if !matches!(g.as_str(), "male" | "female" | "other") {
                return Err(HandlerErr::bad_params(
                    "gender must be one of: male, female, other",
                ));
            }
            Ok(Some(Some(g)))
        }
        other => Ok(other),
    }
}

fn parse_roll_no(params: &Value) -> Result<Option<Option<i64>>, HandlerErr> {
    if params.get("rollNo").is_none() {
        return Ok(None);
    }
    match opt_i64(params, "rollNo")? {
        Some(n) if n < 1 => Err(HandlerErr::bad_params("rollNo must be >= 1")),
        other => Ok(Some(other)),
    }
}

fn patch_date(params: &Value, key: &str) -> Result<Option<Option<String>>, HandlerErr> {
    if params.get(key).is_none() {
        return Ok(None);
    }
    opt_date(params, key).map(Some)
}

fn ensure_reg_no_free(conn: &Connection, reg_no: &str, except: Option<&str>) -> Result<(), HandlerErr> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE reg_no_key = ?",
            [name_key(&[reg_no])],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        Some(id) if Some(id.as_str()) != except => Err(HandlerErr::conflict(
            "registration number already exists",
        )
        .with_details(json!({ "regNo": reg_no }))),
        _ => Ok(()),
    }
}

fn ensure_roll_free(
    conn: &Connection,
    class_id: &str,
    roll_no: Option<i64>,
    except: Option<&str>,
) -> Result<(), HandlerErr> {
    let Some(roll) = roll_no else {
        return Ok(());
    };
    let owner: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE class_id = ? AND roll_no = ?",
            (class_id, roll),
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        Some(id) if Some(id.as_str()) != except => Err(HandlerErr::conflict(
            "roll number already taken in this class",
        )
        .with_details(json!({ "rollNo": roll }))),
        _ => Ok(()),
    }
}

fn ensure_seats(conn: &Connection, class: &ClassRow, joining: i64) -> Result<(), HandlerErr> {
    let Some(capacity) = class.capacity else {
        return Ok(());
    };
    let enrolled = active_enrolment(conn, &class.id)?;
    if enrolled + joining > capacity {
        return Err(HandlerErr::conflict("class is full").with_details(json!({
            "classId": class.id,
            "capacity": capacity,
            "enrolled": enrolled
        })));
    }
    Ok(())
}

/// Rewrites the regNo/class fields copied onto the student's fee records.
pub fn sync_fee_records(conn: &Connection, student_id: &str) -> Result<usize, HandlerErr> {
    let student = load_student(conn, student_id)?;
    conn.execute(
        "UPDATE fee_records SET reg_no = ?, class_id = ?, class_name = ?, updated_at = ?
         WHERE student_id = ?",
        (
            &student.reg_no,
            &student.class_id,
            student.class_name.as_deref().unwrap_or(""),
            now_ts(),
            student_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "fee_records", e))
}

/// Removes a student with their marks and attendance entries; attendance
/// records they appeared on are recounted. Fee records are left in place.
pub fn delete_student_rows(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM marks WHERE student_id = ?", [student_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "marks", e))?;

    let record_ids: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT attendance_id FROM attendance_entries WHERE student_id = ?")?;
        let ids = stmt
            .query_map([student_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    conn.execute(
        "DELETE FROM attendance_entries WHERE student_id = ?",
        [student_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", "attendance_entries", e))?;
    for record_id in &record_ids {
        super::attendance::recount_record(conn, record_id)?;
    }

    conn.execute("DELETE FROM students WHERE id = ?", [student_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "students", e))?;
    Ok(())
}

fn handle_students_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = opt_str(&req.params, "classId")?;
    let search = opt_str(&req.params, "search")?
        .map(|s| format!("%{}%", like_escape(&s.to_lowercase())));
    let active = opt_bool(&req.params, "active")?.map(|b| b as i64);

    let sql = format!(
        "{} WHERE (?1 IS NULL OR s.class_id = ?1)
           AND (?2 IS NULL OR lower(s.first_name || ' ' || s.last_name) LIKE ?2 ESCAPE '\\'
                OR lower(s.reg_no) LIKE ?2 ESCAPE '\\')
           AND (?3 IS NULL OR s.active = ?3)
         ORDER BY c.name_key, s.roll_no IS NULL, s.roll_no, s.last_name, s.first_name",
        STUDENT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map((&class_id, &search, active), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "students": students.iter().map(StudentRow::to_json).collect::<Vec<_>>()
    }))
}

fn handle_students_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    Ok(json!({ "student": load_student(conn, &student_id)?.to_json() }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let reg_no = required_str(p, "regNo")?;
    let first_name = required_str(p, "firstName")?;
    let last_name = opt_str(p, "lastName")?.unwrap_or_default();
    let class_id = required_str(p, "classId")?;
    let gender = parse_gender(p)?.flatten();
    let date_of_birth = opt_date(p, "dateOfBirth")?;
    let admission_date = opt_date(p, "admissionDate")?.unwrap_or_else(today);
    let roll_no = parse_roll_no(p)?.flatten();
    let active = opt_bool(p, "active")?.unwrap_or(true);

    let class = load_class(conn, &class_id)?;
    ensure_reg_no_free(conn, &reg_no, None)?;
    ensure_roll_free(conn, &class_id, roll_no, None)?;
    if active {
        ensure_seats(conn, &class, 1)?;
    }

    let student_id = Uuid::new_v4().to_string();
    let now = now_ts();
    conn.execute(
        "INSERT INTO students(id, reg_no, reg_no_key, first_name, last_name, gender, date_of_birth,
            guardian_name, phone, email, address, class_id, roll_no, admission_date, active,
            created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            student_id,
            reg_no,
            name_key(&[&reg_no]),
            first_name,
            last_name,
            gender,
            date_of_birth,
            opt_str(p, "guardianName")?,
            opt_str(p, "phone")?,
            opt_str(p, "email")?,
            opt_str(p, "address")?,
            class_id,
            roll_no,
            admission_date,
            active as i64,
            now,
            now
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "students", e))?;

    Ok(json!({
        "studentId": student_id,
        "student": load_student(conn, &student_id)?.to_json()
    }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let student_id = required_str(p, "studentId")?;
    let cur = load_student(conn, &student_id)?;

    let reg_no = opt_str(p, "regNo")?.unwrap_or(cur.reg_no.clone());
    let first_name = opt_str(p, "firstName")?.unwrap_or(cur.first_name.clone());
    let last_name = patch_str(p, "lastName")?
        .map(Option::unwrap_or_default)
        .unwrap_or(cur.last_name.clone());
    let class_id = opt_str(p, "classId")?.unwrap_or(cur.class_id.clone());
    let gender = parse_gender(p)?.unwrap_or(cur.gender.clone());
    let date_of_birth = patch_date(p, "dateOfBirth")?.unwrap_or(cur.date_of_birth.clone());
    let admission_date = opt_date(p, "admissionDate")?.unwrap_or(cur.admission_date.clone());
    let guardian_name = patch_str(p, "guardianName")?.unwrap_or(cur.guardian_name.clone());
    let phone = patch_str(p, "phone")?.unwrap_or(cur.phone.clone());
    let email = patch_str(p, "email")?.unwrap_or(cur.email.clone());
    let address = patch_str(p, "address")?.unwrap_or(cur.address.clone());
    let roll_no = parse_roll_no(p)?.unwrap_or(cur.roll_no);
    let active = opt_bool(p, "active")?.unwrap_or(cur.active);

    let class_changed = class_id != cur.class_id;
    let reg_changed = reg_no != cur.reg_no;
    if reg_changed {
        ensure_reg_no_free(conn, &reg_no, Some(&student_id))?;
    }
    let class = load_class(conn, &class_id)?;
    ensure_roll_free(conn, &class_id, roll_no, Some(&student_id))?;
    if active && (class_changed || !cur.active) {
        ensure_seats(conn, &class, 1)?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE students SET reg_no = ?, reg_no_key = ?, first_name = ?, last_name = ?, gender = ?,
            date_of_birth = ?, guardian_name = ?, phone = ?, email = ?, address = ?, class_id = ?,
            roll_no = ?, admission_date = ?, active = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            reg_no,
            name_key(&[&reg_no]),
            first_name,
            last_name,
            gender,
            date_of_birth,
            guardian_name,
            phone,
            email,
            address,
            class_id,
            roll_no,
            admission_date,
            active as i64,
            now_ts(),
            student_id
        ],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "students", e))?;
    let fee_records_updated = if reg_changed || class_changed {
        sync_fee_records(&tx, &student_id)?
    } else {
        0
    };
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "student": load_student(conn, &student_id)?.to_json(),
        "feeRecordsUpdated": fee_records_updated
    }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let student = load_student(conn, &student_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    delete_student_rows(&tx, &student_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let orphaned_fee_records: i64 = conn.query_row(
        "SELECT COUNT(*) FROM fee_records WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    )?;
    tracing::info!(reg_no = %student.reg_no, orphaned_fee_records, "student deleted");
    Ok(json!({ "ok": true, "orphanedFeeRecords": orphaned_fee_records }))
}

fn handle_students_transfer(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_ids = string_array(&req.params, "studentIds")?;
    if student_ids.is_empty() {
        return Err(HandlerErr::bad_params("studentIds must not be empty"));
    }
    let unique: BTreeSet<&String> = student_ids.iter().collect();
    if unique.len() != student_ids.len() {
        return Err(HandlerErr::bad_params("studentIds contains duplicates"));
    }
    let to_class_id = required_str(&req.params, "toClassId")?;
    let class = load_class(conn, &to_class_id)?;

    let mut moving = Vec::with_capacity(student_ids.len());
    let mut missing = Vec::new();
    for id in &student_ids {
        match find_student(conn, id)? {
            Some(s) => moving.push(s),
            None => missing.push(id.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(HandlerErr::not_found("students not found")
            .with_details(json!({ "studentIds": missing })));
    }
    let moving: Vec<StudentRow> = moving
        .into_iter()
        .filter(|s| s.class_id != to_class_id)
        .collect();
    let joining = moving.iter().filter(|s| s.active).count() as i64;
    ensure_seats(conn, &class, joining)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let now = now_ts();
    for s in &moving {
        // Roll numbers are per class; the receiving class assigns new ones.
        tx.execute(
            "UPDATE students SET class_id = ?, roll_no = NULL, updated_at = ? WHERE id = ?",
            (&to_class_id, &now, &s.id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", "students", e))?;
        sync_fee_records(&tx, &s.id)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(class = %class.display_name(), moved = moving.len(), "students transferred");
    Ok(json!({
        "transferred": moving.len(),
        "skipped": student_ids.len() - moving.len(),
        "toClassId": to_class_id
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_students_list(state, req),
        "students.get" => handle_students_get(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        "students.transfer" => handle_students_transfer(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
