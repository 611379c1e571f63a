use crate::calc::{exam_results, GradingPolicy, MarkState, SubjectDef};
use crate::ipc::helpers::{
    db_conn, now_ts, opt_bool, opt_date, opt_str, patch_str, required_str, respond, HandlerErr,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::classes::load_class;
use super::setup::grading_policy;
use super::students::{class_students, load_student, StudentRow};

struct ExamRow {
    id: String,
    class_id: String,
    name: String,
    term: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    published: bool,
    created_at: String,
}

#[derive(Debug, Clone)]
struct ExamSubject {
    subject_id: String,
    name: String,
    code: String,
    max_marks: f64,
    pass_marks: f64,
}

impl ExamSubject {
    fn to_json(&self) -> Value {
        json!({
            "subjectId": self.subject_id,
            "name": self.name,
            "code": self.code,
            "maxMarks": self.max_marks,
            "passMarks": self.pass_marks
        })
    }

    fn def(&self) -> SubjectDef {
        SubjectDef {
            subject_id: self.subject_id.clone(),
            max_marks: self.max_marks,
            pass_marks: self.pass_marks,
        }
    }
}

const EXAM_COLUMNS: &str =
    "id, class_id, name, term, start_date, end_date, published, created_at";

fn exam_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ExamRow> {
    Ok(ExamRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        name: r.get(2)?,
        term: r.get(3)?,
        start_date: r.get(4)?,
        end_date: r.get(5)?,
        published: r.get::<_, i64>(6)? != 0,
        created_at: r.get(7)?,
    })
}

fn load_exam(conn: &Connection, exam_id: &str) -> Result<ExamRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM exams WHERE id = ?", EXAM_COLUMNS),
        [exam_id],
        exam_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("exam not found"))
}

fn exam_subjects(conn: &Connection, exam_id: &str) -> Result<Vec<ExamSubject>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT es.subject_id, sb.name, sb.code, es.max_marks, es.pass_marks
         FROM exam_subjects es
         JOIN subjects sb ON sb.id = es.subject_id
         WHERE es.exam_id = ?
         ORDER BY es.sort_order",
    )?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(ExamSubject {
                subject_id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
                max_marks: r.get(3)?,
                pass_marks: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn exam_json(exam: &ExamRow, subjects: &[ExamSubject]) -> Value {
    json!({
        "id": exam.id,
        "classId": exam.class_id,
        "name": exam.name,
        "term": exam.term,
        "startDate": exam.start_date,
        "endDate": exam.end_date,
        "published": exam.published,
        "createdAt": exam.created_at,
        "maxTotal": subjects.iter().map(|s| s.max_marks).sum::<f64>(),
        "subjects": subjects.iter().map(ExamSubject::to_json).collect::<Vec<_>>()
    })
}

struct SubjectSpec {
    subject_id: String,
    max_marks: f64,
    pass_marks: f64,
}

/// `stored` holds the current pass marks per subject; an omitted `passMarks`
/// keeps the stored value while it still fits under `maxMarks`.
fn parse_subject_specs(
    conn: &Connection,
    class_id: &str,
    raw: &Value,
    stored: &HashMap<String, f64>,
) -> Result<Vec<SubjectSpec>, HandlerErr> {
    let items = raw
        .as_array()
        .ok_or_else(|| HandlerErr::bad_params("subjects must be an array"))?;
    if items.is_empty() {
        return Err(HandlerErr::bad_params("subjects must not be empty"));
    }
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let subject_id = required_str(item, "subjectId")
            .map_err(|e| HandlerErr::bad_params(format!("subjects[{}]: {}", i, e.message)))?;
        if !seen.insert(subject_id.clone()) {
            return Err(HandlerErr::bad_params(format!(
                "subjects[{}]: duplicate subject",
                i
            )));
        }
        let subject = super::subjects::load_subject(conn, &subject_id)?;
        if subject.class_id != class_id {
            return Err(HandlerErr::bad_params(format!(
                "subjects[{}]: subject does not belong to this class",
                i
            )));
        }
        let max_marks = item
            .get("maxMarks")
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite() && *v > 0.0 && *v <= 1000.0)
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("subjects[{}]: maxMarks must be in (0, 1000]", i))
            })?;
        let pass_marks = match item.get("passMarks") {
            None | Some(Value::Null) => stored
                .get(&subject_id)
                .copied()
                .filter(|p| *p <= max_marks)
                .unwrap_or_else(|| (max_marks * 0.4 * 100.0).round() / 100.0),
            Some(v) => v
                .as_f64()
                .filter(|p| (0.0..=max_marks).contains(p))
                .ok_or_else(|| {
                    HandlerErr::bad_params(format!(
                        "subjects[{}]: passMarks must be in 0..=maxMarks",
                        i
                    ))
                })?,
        };
        specs.push(SubjectSpec {
            subject_id,
            max_marks,
            pass_marks,
        });
    }
    Ok(specs)
}

fn check_date_order(start: Option<&str>, end: Option<&str>) -> Result<(), HandlerErr> {
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(HandlerErr::bad_params("startDate must not be after endDate"));
        }
    }
    Ok(())
}

fn write_exam_subjects(conn: &Connection, exam_id: &str, specs: &[SubjectSpec]) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM exam_subjects WHERE exam_id = ?", [exam_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "exam_subjects", e))?;
    for (i, s) in specs.iter().enumerate() {
        conn.execute(
            "INSERT INTO exam_subjects(exam_id, subject_id, max_marks, pass_marks, sort_order)
             VALUES(?, ?, ?, ?, ?)",
            (exam_id, &s.subject_id, s.max_marks, s.pass_marks, i as i64),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", "exam_subjects", e))?;
    }
    Ok(())
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = opt_str(&req.params, "classId")?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM exams WHERE (?1 IS NULL OR class_id = ?1)
         ORDER BY start_date IS NULL, start_date DESC, created_at DESC",
        EXAM_COLUMNS
    ))?;
    let exams = stmt
        .query_map([&class_id], exam_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(exams.len());
    for exam in &exams {
        out.push(exam_json(exam, &exam_subjects(conn, &exam.id)?));
    }
    Ok(json!({ "exams": out }))
}

fn handle_exams_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let exam = load_exam(conn, &exam_id)?;
    Ok(json!({ "exam": exam_json(&exam, &exam_subjects(conn, &exam_id)?) }))
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let class_id = required_str(p, "classId")?;
    let name = required_str(p, "name")?;
    load_class(conn, &class_id)?;
    let start_date = opt_date(p, "startDate")?;
    let end_date = opt_date(p, "endDate")?;
    check_date_order(start_date.as_deref(), end_date.as_deref())?;
    let specs = parse_subject_specs(
        conn,
        &class_id,
        p.get("subjects").unwrap_or(&Value::Null),
        &HashMap::new(),
    )?;

    let exam_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO exams(id, class_id, name, term, start_date, end_date, published, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
        rusqlite::params![
            exam_id,
            class_id,
            name,
            opt_str(p, "term")?,
            start_date,
            end_date,
            now_ts()
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "exams", e))?;
    write_exam_subjects(&tx, &exam_id, &specs)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let exam = load_exam(conn, &exam_id)?;
    Ok(json!({
        "examId": exam_id,
        "exam": exam_json(&exam, &exam_subjects(conn, &exam_id)?)
    }))
}

fn handle_exams_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let exam_id = required_str(p, "examId")?;
    let cur = load_exam(conn, &exam_id)?;

    let name = opt_str(p, "name")?.unwrap_or(cur.name.clone());
    let term = patch_str(p, "term")?.unwrap_or(cur.term.clone());
    let start_date = if p.get("startDate").is_some() {
        opt_date(p, "startDate")?
    } else {
        cur.start_date.clone()
    };
    let end_date = if p.get("endDate").is_some() {
        opt_date(p, "endDate")?
    } else {
        cur.end_date.clone()
    };
    check_date_order(start_date.as_deref(), end_date.as_deref())?;

    let specs = match p.get("subjects") {
        None | Some(Value::Null) => None,
        Some(raw) => {
            let stored: HashMap<String, f64> = exam_subjects(conn, &exam_id)?
                .into_iter()
                .map(|s| (s.subject_id, s.pass_marks))
                .collect();
            Some(parse_subject_specs(conn, &cur.class_id, raw, &stored)?)
        }
    };
    if let Some(specs) = specs.as_ref() {
        for s in specs {
            let over: i64 = conn.query_row(
                "SELECT COUNT(*) FROM marks WHERE exam_id = ? AND subject_id = ? AND marks > ?",
                (&exam_id, &s.subject_id, s.max_marks),
                |r| r.get(0),
            )?;
            if over > 0 {
                return Err(HandlerErr::conflict("existing marks exceed the new maxMarks")
                    .with_details(json!({ "subjectId": s.subject_id, "marks": over })));
            }
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE exams SET name = ?, term = ?, start_date = ?, end_date = ? WHERE id = ?",
        (&name, &term, &start_date, &end_date, &exam_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "exams", e))?;
    let mut marks_removed = 0usize;
    if let Some(specs) = specs.as_ref() {
        let keep: HashSet<&str> = specs.iter().map(|s| s.subject_id.as_str()).collect();
        for old in exam_subjects(&tx, &exam_id)? {
            if !keep.contains(old.subject_id.as_str()) {
                marks_removed += tx
                    .execute(
                        "DELETE FROM marks WHERE exam_id = ? AND subject_id = ?",
                        (&exam_id, &old.subject_id),
                    )
                    .map_err(|e| HandlerErr::db("db_delete_failed", "marks", e))?;
            }
        }
        write_exam_subjects(&tx, &exam_id, specs)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let exam = load_exam(conn, &exam_id)?;
    Ok(json!({
        "exam": exam_json(&exam, &exam_subjects(conn, &exam_id)?),
        "marksRemoved": marks_removed
    }))
}

fn handle_exams_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    load_exam(conn, &exam_id)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let steps: [(&str, &str); 3] = [
        ("marks", "DELETE FROM marks WHERE exam_id = ?"),
        ("exam_subjects", "DELETE FROM exam_subjects WHERE exam_id = ?"),
        ("exams", "DELETE FROM exams WHERE id = ?"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&exam_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", table, e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn handle_exams_publish(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let published = opt_bool(&req.params, "published")?.unwrap_or(true);
    load_exam(conn, &exam_id)?;
    conn.execute(
        "UPDATE exams SET published = ? WHERE id = ?",
        (published as i64, &exam_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "exams", e))?;
    Ok(json!({ "examId": exam_id, "published": published }))
}

fn load_marks(
    conn: &Connection,
    exam_id: &str,
) -> Result<HashMap<(String, String), MarkState>, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT student_id, subject_id, marks, absent FROM marks WHERE exam_id = ?")?;
    let rows = stmt
        .query_map([exam_id], |r| {
            let marks: Option<f64> = r.get(2)?;
            let absent = r.get::<_, i64>(3)? != 0;
            let state = match (absent, marks) {
                (true, _) => MarkState::Absent,
                (false, Some(m)) => MarkState::Scored(m),
                (false, None) => MarkState::NotEntered,
            };
            Ok(((r.get::<_, String>(0)?, r.get::<_, String>(1)?), state))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

fn handle_marks_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let exam = load_exam(conn, &exam_id)?;
    let subjects = exam_subjects(conn, &exam_id)?;
    let students = class_students(conn, &exam.class_id, false)?;
    let marks = load_marks(conn, &exam_id)?;

    let rows: Vec<Value> = students
        .iter()
        .map(|s| {
            let entries: Vec<Value> = subjects
                .iter()
                .map(|sub| {
                    let state = marks
                        .get(&(s.id.clone(), sub.subject_id.clone()))
                        .copied()
                        .unwrap_or(MarkState::NotEntered);
                    json!({
                        "subjectId": sub.subject_id,
                        "marks": match state { MarkState::Scored(v) => Some(v), _ => None },
                        "absent": state == MarkState::Absent
                    })
                })
                .collect();
            json!({
                "studentId": s.id,
                "fullName": s.full_name(),
                "rollNo": s.roll_no,
                "active": s.active,
                "entries": entries
            })
        })
        .collect();
    Ok(json!({
        "exam": exam_json(&exam, &subjects),
        "students": rows
    }))
}

fn handle_marks_set(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let exam_id = required_str(p, "examId")?;
    let subject_id = required_str(p, "subjectId")?;
    let exam = load_exam(conn, &exam_id)?;
    let subject = exam_subjects(conn, &exam_id)?
        .into_iter()
        .find(|s| s.subject_id == subject_id)
        .ok_or_else(|| HandlerErr::bad_params("subject is not part of this exam"))?;
    let entries = p
        .get("entries")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("entries must be an array"))?;

    let enrolled: HashSet<String> = class_students(conn, &exam.class_id, false)?
        .into_iter()
        .map(|s| s.id)
        .collect();

    let mut parsed: Vec<(String, Option<f64>, bool)> = Vec::with_capacity(entries.len());
    for (i, e) in entries.iter().enumerate() {
        let student_id = required_str(e, "studentId")
            .map_err(|err| HandlerErr::bad_params(format!("entries[{}]: {}", i, err.message)))?;
        if !enrolled.contains(&student_id) {
            return Err(HandlerErr::bad_params(format!(
                "entries[{}]: student is not in this exam's class",
                i
            ))
            .with_details(json!({ "studentId": student_id })));
        }
        let absent = e.get("absent").and_then(|v| v.as_bool()).unwrap_or(false);
        let marks = match e.get("marks") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_f64()
                    .filter(|m| m.is_finite() && (0.0..=subject.max_marks).contains(m))
                    .ok_or_else(|| {
                        HandlerErr::bad_params(format!(
                            "entries[{}]: marks must be within 0..={}",
                            i, subject.max_marks
                        ))
                    })?,
            ),
        };
        if absent && marks.is_some() {
            return Err(HandlerErr::bad_params(format!(
                "entries[{}]: an absent student cannot have marks",
                i
            )));
        }
        parsed.push((student_id, marks, absent));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let now = now_ts();
    let mut updated = 0usize;
    let mut cleared = 0usize;
    for (student_id, marks, absent) in &parsed {
        if marks.is_none() && !absent {
            cleared += tx
                .execute(
                    "DELETE FROM marks WHERE exam_id = ? AND subject_id = ? AND student_id = ?",
                    (&exam_id, &subject_id, student_id),
                )
                .map_err(|e| HandlerErr::db("db_delete_failed", "marks", e))?;
            continue;
        }
        tx.execute(
            "INSERT INTO marks(exam_id, subject_id, student_id, marks, absent, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(exam_id, subject_id, student_id) DO UPDATE SET
               marks = excluded.marks,
               absent = excluded.absent,
               updated_at = excluded.updated_at",
            rusqlite::params![exam_id, subject_id, student_id, marks, *absent as i64, now],
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", "marks", e))?;
        updated += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "updated": updated, "cleared": cleared }))
}

fn compute_results(
    conn: &Connection,
    exam: &ExamRow,
    policy: &GradingPolicy,
) -> Result<(Vec<StudentRow>, Vec<ExamSubject>, Vec<Value>, Vec<Value>), HandlerErr> {
    let subjects = exam_subjects(conn, &exam.id)?;
    let students = class_students(conn, &exam.class_id, false)?;
    let marks = load_marks(conn, &exam.id)?;
    let ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
    let defs: Vec<SubjectDef> = subjects.iter().map(ExamSubject::def).collect();
    let (results, stats) = exam_results(&ids, &defs, &marks, policy);

    let names: HashMap<&str, &StudentRow> = students.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut rows: Vec<Value> = results
        .iter()
        .map(|r| {
            let mut v = json!(r);
            if let Some(s) = names.get(r.student_id.as_str()) {
                v["fullName"] = json!(s.full_name());
                v["rollNo"] = json!(s.roll_no);
                v["regNo"] = json!(s.reg_no);
            }
            v
        })
        .collect();
    rows.sort_by_key(|v| v["rank"].as_u64().unwrap_or(u64::MAX));

    let subject_names: HashMap<&str, &ExamSubject> =
        subjects.iter().map(|s| (s.subject_id.as_str(), s)).collect();
    let stats: Vec<Value> = stats
        .iter()
        .map(|st| {
            let mut v = json!(st);
            if let Some(s) = subject_names.get(st.subject_id.as_str()) {
                v["name"] = json!(s.name);
                v["code"] = json!(s.code);
                v["passMarks"] = json!(s.pass_marks);
            }
            v
        })
        .collect();
    Ok((students, subjects, rows, stats))
}

fn handle_results_exam(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let exam = load_exam(conn, &exam_id)?;
    let policy = grading_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let (_, subjects, rows, stats) = compute_results(conn, &exam, &policy)?;
    let passed = rows
        .iter()
        .filter(|r| r["passed"].as_bool().unwrap_or(false))
        .count();
    Ok(json!({
        "exam": exam_json(&exam, &subjects),
        "results": rows,
        "subjects": stats,
        "summary": {
            "students": rows.len(),
            "passed": passed,
            "failed": rows.len() - passed
        }
    }))
}

fn handle_results_student(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let student = load_student(conn, &student_id)?;
    let policy = grading_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM exams WHERE class_id = ?
         ORDER BY start_date IS NULL, start_date, created_at",
        EXAM_COLUMNS
    ))?;
    let exams = stmt
        .query_map([&student.class_id], exam_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(exams.len());
    for exam in &exams {
        let (_, _, rows, _) = compute_results(conn, exam, &policy)?;
        let mine = rows
            .into_iter()
            .find(|r| r["studentId"].as_str() == Some(student_id.as_str()));
        out.push(json!({
            "examId": exam.id,
            "name": exam.name,
            "term": exam.term,
            "startDate": exam.start_date,
            "published": exam.published,
            "result": mine
        }));
    }
    Ok(json!({ "student": student.to_json(), "exams": out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "exams.list" => handle_exams_list(state, req),
        "exams.get" => handle_exams_get(state, req),
        "exams.create" => handle_exams_create(state, req),
        "exams.update" => handle_exams_update(state, req),
        "exams.delete" => handle_exams_delete(state, req),
        "exams.publish" => handle_exams_publish(state, req),
        "marks.get" => handle_marks_get(state, req),
        "marks.set" => handle_marks_set(state, req),
        "results.exam" => handle_results_exam(state, req),
        "results.student" => handle_results_student(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
