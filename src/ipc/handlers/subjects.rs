use crate::ipc::helpers::{
    db_conn, is_unique_violation, name_key, now_ts, opt_str, patch_str, required_str, respond,
    HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub code: String,
    pub teacher_name: Option<String>,
    pub created_at: String,
}

impl SubjectRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "classId": self.class_id,
            "name": self.name,
            "code": self.code,
            "teacherName": self.teacher_name,
            "createdAt": self.created_at
        })
    }
}

const SUBJECT_COLUMNS: &str = "id, class_id, name, code, teacher_name, created_at";

fn subject_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SubjectRow> {
    Ok(SubjectRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        name: r.get(2)?,
        code: r.get(3)?,
        teacher_name: r.get(4)?,
        created_at: r.get(5)?,
    })
}

pub fn load_subject(conn: &Connection, subject_id: &str) -> Result<SubjectRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM subjects WHERE id = ?", SUBJECT_COLUMNS),
        [subject_id],
        subject_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("subject not found"))
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

fn duplicate_code() -> HandlerErr {
    HandlerErr::conflict("subject code already used in this class")
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = opt_str(&req.params, "classId")?;
    let sql = format!(
        "SELECT {} FROM subjects WHERE (?1 IS NULL OR class_id = ?1) ORDER BY class_id, code_key",
        SUBJECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let subjects = stmt
        .query_map([&class_id], subject_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects.iter().map(SubjectRow::to_json).collect::<Vec<_>>() }))
}

fn handle_subjects_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    Ok(json!({ "subject": load_subject(conn, &subject_id)?.to_json() }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let name = required_str(&req.params, "name")?;
    let code = normalize_code(&required_str(&req.params, "code")?);
    let teacher_name = opt_str(&req.params, "teacherName")?;
    super::classes::load_class(conn, &class_id)?;

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, class_id, name, code, code_key, teacher_name, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &class_id,
            &name,
            &code,
            name_key(&[&code]),
            &teacher_name,
            now_ts(),
        ),
    ) {
        if is_unique_violation(&e) {
            return Err(duplicate_code());
        }
        return Err(HandlerErr::db("db_insert_failed", "subjects", e));
    }
    Ok(json!({
        "subjectId": subject_id,
        "subject": load_subject(conn, &subject_id)?.to_json()
    }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let current = load_subject(conn, &subject_id)?;

    let name = opt_str(&req.params, "name")?.unwrap_or(current.name.clone());
    let code = opt_str(&req.params, "code")?
        .map(|c| normalize_code(&c))
        .unwrap_or(current.code.clone());
    let teacher_name = patch_str(&req.params, "teacherName")?.unwrap_or(current.teacher_name.clone());

    if let Err(e) = conn.execute(
        "UPDATE subjects SET name = ?, code = ?, code_key = ?, teacher_name = ? WHERE id = ?",
        (&name, &code, name_key(&[&code]), &teacher_name, &subject_id),
    ) {
        if is_unique_violation(&e) {
            return Err(duplicate_code());
        }
        return Err(HandlerErr::db("db_update_failed", "subjects", e));
    }
    Ok(json!({ "subject": load_subject(conn, &subject_id)?.to_json() }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    load_subject(conn, &subject_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let steps: [(&str, &str); 4] = [
        ("timetable_slots", "DELETE FROM timetable_slots WHERE subject_id = ?"),
        ("marks", "DELETE FROM marks WHERE subject_id = ?"),
        ("exam_subjects", "DELETE FROM exam_subjects WHERE subject_id = ?"),
        ("subjects", "DELETE FROM subjects WHERE id = ?"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&subject_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", table, e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "subjects.list" => handle_subjects_list(state, req),
        "subjects.get" => handle_subjects_get(state, req),
        "subjects.create" => handle_subjects_create(state, req),
        "subjects.update" => handle_subjects_update(state, req),
        "subjects.delete" => handle_subjects_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
