use crate::attendance::{attendance_percent, Counts};
use crate::ipc::helpers::{db_conn, opt_date, respond, today, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::ledger::cents_to_number;
use rusqlite::Connection;
use serde_json::{json, Value};

use super::setup::attendance_policy;

const UPCOMING_EXAMS: i64 = 5;

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

fn handle_stats(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let date = opt_date(&req.params, "date")?.unwrap_or_else(today);
    let month = date[..7].to_string();
    let policy =
        attendance_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let (classes_recorded, present, absent, late, total): (i64, i64, i64, i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(present_count), 0), COALESCE(SUM(absent_count), 0),
                COALESCE(SUM(late_count), 0),
                COALESCE(SUM(present_count + absent_count + late_count), 0)
             FROM attendance_records WHERE date = ?",
            [&date],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )?;
    let counts = Counts {
        present: present as usize,
        absent: absent as usize,
        late: late as usize,
        total: total as usize,
    };

    let (collected, charged): (i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN kind = 'payment' AND substr(date, 1, 7) = ?1 THEN amount_cents END), 0),
            COALESCE(SUM(CASE WHEN kind = 'charge' AND month = ?1 THEN amount_cents END), 0)
         FROM fee_records",
        [&month],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let spent: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount_cents), 0) FROM expenses WHERE substr(date, 1, 7) = ?",
        [&month],
        |r| r.get(0),
    )?;
    let outstanding: i64 = conn.query_row(
        "SELECT COALESCE(SUM(CASE WHEN kind = 'charge' THEN amount_cents ELSE -amount_cents END), 0)
         FROM fee_records",
        [],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT e.id, e.name, e.class_id,
            CASE WHEN c.section IS NULL OR c.section = '' THEN c.name ELSE c.name || ' - ' || c.section END,
            e.start_date
         FROM exams e
         LEFT JOIN classes c ON c.id = e.class_id
         WHERE e.start_date >= ?
         ORDER BY e.start_date, e.name
         LIMIT ?",
    )?;
    let upcoming = stmt
        .query_map((&date, UPCOMING_EXAMS), |r| {
            Ok(json!({
                "examId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "classId": r.get::<_, String>(2)?,
                "className": r.get::<_, Option<String>>(3)?,
                "startDate": r.get::<_, String>(4)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "date": date,
        "students": {
            "active": count(conn, "SELECT COUNT(*) FROM students WHERE active = 1")?,
            "total": count(conn, "SELECT COUNT(*) FROM students")?
        },
        "classes": count(conn, "SELECT COUNT(*) FROM classes")?,
        "subjects": count(conn, "SELECT COUNT(*) FROM subjects")?,
        "users": count(conn, "SELECT COUNT(*) FROM users WHERE active = 1")?,
        "attendance": {
            "classesRecorded": classes_recorded,
            "present": counts.present,
            "absent": counts.absent,
            "late": counts.late,
            "rate": attendance_percent(&counts, policy.late_counts_as_present)
        },
        "fees": {
            "month": month,
            "charged": cents_to_number(charged),
            "collected": cents_to_number(collected),
            "outstanding": cents_to_number(outstanding)
        },
        "expenses": { "month": month, "total": cents_to_number(spent) },
        "upcomingExams": upcoming
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "dashboard.stats" => handle_stats(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
