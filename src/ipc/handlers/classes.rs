use crate::auth::Permission;
use crate::ipc::helpers::{
    db_conn, is_unique_violation, name_key, now_ts, opt_bool, opt_i64, opt_str, patch_str,
    required_str, require_permission, respond, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::cents_to_number;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use super::setup::opt_amount_cents;

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: String,
    pub name: String,
    pub section: Option<String>,
    pub monthly_fee_cents: Option<i64>,
    pub capacity: Option<i64>,
    pub created_at: String,
}

impl ClassRow {
    /// Label stored on fee records, e.g. `Grade 5 - A`.
    pub fn display_name(&self) -> String {
        display_name(&self.name, self.section.as_deref())
    }
}

pub fn display_name(name: &str, section: Option<&str>) -> String {
    match section {
        Some(s) if !s.is_empty() => format!("{} - {}", name, s),
        _ => name.to_string(),
    }
}

fn class_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ClassRow> {
    Ok(ClassRow {
        id: r.get(0)?,
        name: r.get(1)?,
        section: r.get(2)?,
        monthly_fee_cents: r.get(3)?,
        capacity: r.get(4)?,
        created_at: r.get(5)?,
    })
}

pub fn find_class(conn: &Connection, class_id: &str) -> Result<Option<ClassRow>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, name, section, monthly_fee_cents, capacity, created_at
             FROM classes WHERE id = ?",
            [class_id],
            class_from_row,
        )
        .optional()?)
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassRow, HandlerErr> {
    find_class(conn, class_id)?.ok_or_else(|| HandlerErr::not_found("class not found"))
}

pub fn active_enrolment(conn: &Connection, class_id: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ? AND active = 1",
        [class_id],
        |r| r.get(0),
    )?)
}

fn class_json(c: &ClassRow, student_count: i64, subject_count: i64) -> Value {
    json!({
        "id": c.id,
        "name": c.name,
        "section": c.section,
        "displayName": c.display_name(),
        "monthlyFee": c.monthly_fee_cents.map(cents_to_number),
        "capacity": c.capacity,
        "studentCount": student_count,
        "subjectCount": subject_count,
        "createdAt": c.created_at
    })
}

fn counts(conn: &Connection, class_id: &str) -> Result<(i64, i64), HandlerErr> {
    let students: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [class_id],
        |r| r.get(0),
    )?;
    let subjects: i64 = conn.query_row(
        "SELECT COUNT(*) FROM subjects WHERE class_id = ?",
        [class_id],
        |r| r.get(0),
    )?;
    Ok((students, subjects))
}

fn parse_capacity(params: &Value) -> Result<Option<i64>, HandlerErr> {
    match opt_i64(params, "capacity")? {
        Some(c) if !(1..=10_000).contains(&c) => {
            Err(HandlerErr::bad_params("capacity must be in 1..=10000"))
        }
        other => Ok(other),
    }
}

fn handle_classes_list(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.section, c.monthly_fee_cents, c.capacity, c.created_at,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM subjects sb WHERE sb.class_id = c.id) AS subject_count
         FROM classes c
         ORDER BY c.name_key",
    )?;
    let classes = stmt
        .query_map([], |r| {
            let c = class_from_row(r)?;
            let students: i64 = r.get(6)?;
            let subjects: i64 = r.get(7)?;
            Ok(class_json(&c, students, subjects))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn handle_classes_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let class = load_class(conn, &class_id)?;
    let (students, subjects) = counts(conn, &class_id)?;
    Ok(json!({ "class": class_json(&class, students, subjects) }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let name = required_str(&req.params, "name")?;
    let section = opt_str(&req.params, "section")?;
    let monthly_fee = opt_amount_cents(&req.params, "monthlyFee")?;
    let capacity = parse_capacity(&req.params)?;

    let class_id = Uuid::new_v4().to_string();
    let key = name_key(&[&name, section.as_deref().unwrap_or("")]);
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, section, name_key, monthly_fee_cents, capacity, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &class_id,
            &name,
            &section,
            &key,
            monthly_fee,
            capacity,
            now_ts(),
        ),
    ) {
        if is_unique_violation(&e) {
            return Err(HandlerErr::conflict("a class with this name and section already exists"));
        }
        return Err(HandlerErr::db("db_insert_failed", "classes", e));
    }
    let class = load_class(conn, &class_id)?;
    Ok(json!({ "classId": class_id, "class": class_json(&class, 0, 0) }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let current = load_class(conn, &class_id)?;

    let name = match opt_str(&req.params, "name")? {
        Some(n) => n,
        None if req.params.get("name").is_some() => {
            return Err(HandlerErr::bad_params("name must not be empty"))
        }
        None => current.name.clone(),
    };
    let section = patch_str(&req.params, "section")?.unwrap_or(current.section.clone());
    let monthly_fee = if req.params.get("monthlyFee").is_some() {
        opt_amount_cents(&req.params, "monthlyFee")?
    } else {
        current.monthly_fee_cents
    };
    let capacity = if req.params.get("capacity").is_some() {
        parse_capacity(&req.params)?
    } else {
        current.capacity
    };
    if let Some(cap) = capacity {
        let enrolled = active_enrolment(conn, &class_id)?;
        if cap < enrolled {
            return Err(HandlerErr::conflict("capacity is below current enrolment")
                .with_details(json!({ "capacity": cap, "enrolled": enrolled })));
        }
    }

    let renamed = name != current.name || section != current.section;
    let key = name_key(&[&name, section.as_deref().unwrap_or("")]);
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "UPDATE classes SET name = ?, section = ?, name_key = ?, monthly_fee_cents = ?, capacity = ?
         WHERE id = ?",
        (&name, &section, &key, monthly_fee, capacity, &class_id),
    ) {
        if is_unique_violation(&e) {
            return Err(HandlerErr::conflict("a class with this name and section already exists"));
        }
        return Err(HandlerErr::db("db_update_failed", "classes", e));
    }
    let mut fee_records_updated = 0usize;
    if renamed {
        fee_records_updated = tx
            .execute(
                "UPDATE fee_records SET class_name = ?, updated_at = ? WHERE class_id = ?",
                (display_name(&name, section.as_deref()), now_ts(), &class_id),
            )
            .map_err(|e| HandlerErr::db("db_update_failed", "fee_records", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let class = load_class(conn, &class_id)?;
    let (students, subjects) = counts(conn, &class_id)?;
    Ok(json!({
        "class": class_json(&class, students, subjects),
        "feeRecordsUpdated": fee_records_updated
    }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let force = opt_bool(&req.params, "force")?.unwrap_or(false);
    let class = load_class(conn, &class_id)?;

    let student_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM students WHERE class_id = ?")?;
        let ids = stmt
            .query_map([&class_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    if !student_ids.is_empty() {
        if !force {
            return Err(HandlerErr::conflict("class still has students")
                .with_details(json!({ "studentCount": student_ids.len() })));
        }
        require_permission(state, Permission::Admin)?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicit dependency order (no ON DELETE CASCADE).
    let steps: [(&str, &str); 7] = [
        (
            "marks",
            "DELETE FROM marks WHERE exam_id IN (SELECT id FROM exams WHERE class_id = ?1)",
        ),
        (
            "exam_subjects",
            "DELETE FROM exam_subjects WHERE exam_id IN (SELECT id FROM exams WHERE class_id = ?1)",
        ),
        ("exams", "DELETE FROM exams WHERE class_id = ?1"),
        (
            "attendance_entries",
            "DELETE FROM attendance_entries
             WHERE attendance_id IN (SELECT id FROM attendance_records WHERE class_id = ?1)",
        ),
        ("attendance_records", "DELETE FROM attendance_records WHERE class_id = ?1"),
        ("timetable_slots", "DELETE FROM timetable_slots WHERE class_id = ?1"),
        ("subjects", "DELETE FROM subjects WHERE class_id = ?1"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&class_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", table, e))?;
    }
    for student_id in &student_ids {
        super::students::delete_student_rows(&tx, student_id)?;
    }
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "classes", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    if student_ids.is_empty() {
        tracing::info!(class = %class.display_name(), "class deleted");
    } else {
        tracing::warn!(
            class = %class.display_name(),
            students = student_ids.len(),
            "class force-deleted with its students"
        );
    }
    Ok(json!({ "ok": true, "studentsDeleted": student_ids.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "classes.list" => handle_classes_list(state, req),
        "classes.get" => handle_classes_get(state, req),
        "classes.create" => handle_classes_create(state, req),
        "classes.update" => handle_classes_update(state, req),
        "classes.delete" => handle_classes_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
