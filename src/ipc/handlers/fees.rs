use crate::ipc::helpers::{
    csv_line, current_user_id, db_conn, date_range, name_key, now_ts, opt_bool, opt_date,
    opt_f64, opt_month, opt_str, patch_str, required_str, respond, today, write_text_file,
    HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{
    build_ledger, cents_to_number, format_cents, EntryKind, LedgerLine, Totals,
};
use chrono::{Datelike, NaiveDate};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use uuid::Uuid;

use super::classes::load_class;
use super::setup::{fee_settings, opt_amount_cents};
use super::students::{class_students, load_student};

pub const FEE_TYPES: [&str; 6] = ["tuition", "admission", "exam", "transport", "library", "other"];
pub const PAYMENT_METHODS: [&str; 4] = ["cash", "bank", "card", "online"];

#[derive(Debug, Clone)]
struct FeeRow {
    id: String,
    student_id: String,
    reg_no: String,
    class_id: String,
    class_name: String,
    fee_type: String,
    kind: EntryKind,
    amount_cents: i64,
    month: Option<String>,
    date: String,
    method: Option<String>,
    reference: Option<String>,
    note: Option<String>,
    created_by: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

impl FeeRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "regNo": self.reg_no,
            "classId": self.class_id,
            "className": self.class_name,
            "feeType": self.fee_type,
            "kind": self.kind.as_str(),
            "amountCents": self.amount_cents,
            "amount": cents_to_number(self.amount_cents),
            "month": self.month,
            "date": self.date,
            "method": self.method,
            "reference": self.reference,
            "note": self.note,
            "createdBy": self.created_by,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }
}

const FEE_COLUMNS: &str = "id, student_id, reg_no, class_id, class_name, fee_type, kind,
    amount_cents, month, date, method, reference, note, created_by, created_at, updated_at";

fn stored_kind(idx: usize, raw: &str) -> rusqlite::Result<EntryKind> {
    EntryKind::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown fee kind {:?}", raw).into(),
        )
    })
}

fn fee_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FeeRow> {
    let kind: String = r.get(6)?;
    Ok(FeeRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        reg_no: r.get(2)?,
        class_id: r.get(3)?,
        class_name: r.get(4)?,
        fee_type: r.get(5)?,
        kind: stored_kind(6, &kind)?,
        amount_cents: r.get(7)?,
        month: r.get(8)?,
        date: r.get(9)?,
        method: r.get(10)?,
        reference: r.get(11)?,
        note: r.get(12)?,
        created_by: r.get(13)?,
        created_at: r.get(14)?,
        updated_at: r.get(15)?,
    })
}

fn load_fee(conn: &Connection, fee_id: &str) -> Result<FeeRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM fee_records WHERE id = ?", FEE_COLUMNS),
        [fee_id],
        fee_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("fee record not found"))
}

fn parse_fee_type(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim().to_ascii_lowercase();
    if FEE_TYPES.contains(&t.as_str()) {
        Ok(t)
    } else {
        Err(HandlerErr::bad_params(format!(
            "feeType must be one of: {}",
            FEE_TYPES.join(", ")
        )))
    }
}

fn parse_kind(raw: &str) -> Result<EntryKind, HandlerErr> {
    EntryKind::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("kind must be charge, payment or waiver"))
}

fn parse_method(raw: &str) -> Result<String, HandlerErr> {
    let m = raw.trim().to_ascii_lowercase();
    if PAYMENT_METHODS.contains(&m.as_str()) {
        Ok(m)
    } else {
        Err(HandlerErr::bad_params(format!(
            "method must be one of: {}",
            PAYMENT_METHODS.join(", ")
        )))
    }
}

fn required_amount(params: &Value) -> Result<i64, HandlerErr> {
    opt_amount_cents(params, "amount")?.ok_or_else(|| HandlerErr::bad_params("missing amount"))
}

fn check_method(kind: EntryKind, method: Option<&str>) -> Result<(), HandlerErr> {
    if kind == EntryKind::Payment && method.is_none() {
        return Err(HandlerErr::bad_params("a payment requires method"));
    }
    Ok(())
}

/// Shared filters for `fees.list` and `fees.exportCsv`.
struct FeeFilter {
    student_id: Option<String>,
    class_id: Option<String>,
    month: Option<String>,
    kind: Option<String>,
    fee_type: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

impl FeeFilter {
    fn from_params(p: &Value) -> Result<Self, HandlerErr> {
        let (from, to) = date_range(p)?;
        Ok(Self {
            student_id: opt_str(p, "studentId")?,
            class_id: opt_str(p, "classId")?,
            month: opt_month(p, "month")?,
            kind: opt_str(p, "kind")?
                .map(|k| parse_kind(&k).map(|k| k.as_str().to_string()))
                .transpose()?,
            fee_type: opt_str(p, "feeType")?
                .map(|t| parse_fee_type(&t))
                .transpose()?,
            from,
            to,
        })
    }

    fn query(&self, conn: &Connection) -> Result<Vec<FeeRow>, HandlerErr> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM fee_records
             WHERE (?1 IS NULL OR student_id = ?1)
               AND (?2 IS NULL OR class_id = ?2)
               AND (?3 IS NULL OR month = ?3)
               AND (?4 IS NULL OR kind = ?4)
               AND (?5 IS NULL OR fee_type = ?5)
               AND (?6 IS NULL OR date >= ?6)
               AND (?7 IS NULL OR date <= ?7)
             ORDER BY date DESC, created_at DESC",
            FEE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    self.student_id,
                    self.class_id,
                    self.month,
                    self.kind,
                    self.fee_type,
                    self.from,
                    self.to
                ],
                fee_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn totals_json(t: &Totals) -> Value {
    json!({
        "charged": cents_to_number(t.charged),
        "paid": cents_to_number(t.paid),
        "waived": cents_to_number(t.waived),
        "balance": cents_to_number(t.balance()),
        "chargedCents": t.charged,
        "paidCents": t.paid,
        "waivedCents": t.waived,
        "balanceCents": t.balance()
    })
}

fn handle_fees_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let rows = FeeFilter::from_params(&req.params)?.query(conn)?;
    Ok(json!({ "fees": rows.iter().map(FeeRow::to_json).collect::<Vec<_>>() }))
}

fn handle_fees_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let student_id = required_str(p, "studentId")?;
    let student = load_student(conn, &student_id)?;
    let fee_type = match opt_str(p, "feeType")? {
        Some(t) => parse_fee_type(&t)?,
        None => fee_settings(conn)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
            .default_fee_type,
    };
    let kind = parse_kind(&required_str(p, "kind")?)?;
    let amount_cents = required_amount(p)?;
    let month = opt_month(p, "month")?;
    let date = opt_date(p, "date")?.unwrap_or_else(today);
    let method = opt_str(p, "method")?.map(|m| parse_method(&m)).transpose()?;
    check_method(kind, method.as_deref())?;

    let fee_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fee_records(id, student_id, reg_no, class_id, class_name, fee_type, kind,
            amount_cents, month, date, method, reference, note, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            fee_id,
            student.id,
            student.reg_no,
            student.class_id,
            student.class_name.as_deref().unwrap_or(""),
            fee_type,
            kind.as_str(),
            amount_cents,
            month,
            date,
            method,
            opt_str(p, "reference")?,
            opt_str(p, "note")?,
            current_user_id(state),
            now_ts()
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "fee_records", e))?;
    Ok(json!({ "feeId": fee_id, "fee": load_fee(conn, &fee_id)?.to_json() }))
}

fn handle_fees_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let fee_id = required_str(p, "feeId")?;
    let cur = load_fee(conn, &fee_id)?;

    let fee_type = match opt_str(p, "feeType")? {
        Some(t) => parse_fee_type(&t)?,
        None => cur.fee_type.clone(),
    };
    let kind = match opt_str(p, "kind")? {
        Some(k) => parse_kind(&k)?,
        None => cur.kind,
    };
    let amount_cents = opt_amount_cents(p, "amount")?.unwrap_or(cur.amount_cents);
    let month = if p.get("month").is_some() {
        opt_month(p, "month")?
    } else {
        cur.month.clone()
    };
    let date = opt_date(p, "date")?.unwrap_or(cur.date.clone());
    let method = match patch_str(p, "method")? {
        Some(m) => m.map(|m| parse_method(&m)).transpose()?,
        None => cur.method.clone(),
    };
    check_method(kind, method.as_deref())?;
    let reference = patch_str(p, "reference")?.unwrap_or(cur.reference.clone());
    let note = patch_str(p, "note")?.unwrap_or(cur.note.clone());

    conn.execute(
        "UPDATE fee_records SET fee_type = ?, kind = ?, amount_cents = ?, month = ?, date = ?,
            method = ?, reference = ?, note = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            fee_type,
            kind.as_str(),
            amount_cents,
            month,
            date,
            method,
            reference,
            note,
            now_ts(),
            fee_id
        ],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "fee_records", e))?;
    Ok(json!({ "fee": load_fee(conn, &fee_id)?.to_json() }))
}

fn handle_fees_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let fee_id = required_str(&req.params, "feeId")?;
    let n = conn
        .execute("DELETE FROM fee_records WHERE id = ?", [&fee_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "fee_records", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("fee record not found"));
    }
    Ok(json!({ "ok": true }))
}

fn handle_fees_ledger(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let student = load_student(conn, &student_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM fee_records WHERE student_id = ?
         ORDER BY date, created_at, rowid",
        FEE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([&student_id], fee_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let lines: Vec<LedgerLine> = rows
        .iter()
        .map(|r| LedgerLine {
            kind: r.kind,
            cents: r.amount_cents,
            month: r.month.clone(),
        })
        .collect();
    let ledger = build_ledger(&lines);

    let entries: Vec<Value> = rows
        .iter()
        .zip(ledger.running.iter())
        .map(|(r, running)| {
            let mut v = r.to_json();
            v["runningBalance"] = json!(cents_to_number(*running));
            v["runningBalanceCents"] = json!(running);
            v
        })
        .collect();
    let months: Vec<Value> = ledger
        .by_month
        .iter()
        .map(|(month, t)| {
            let mut v = totals_json(t);
            v["month"] = json!(month);
            v["status"] = json!(t.status());
            v
        })
        .collect();

    Ok(json!({
        "student": student.to_json(),
        "entries": entries,
        "totals": totals_json(&ledger.totals),
        "balance": cents_to_number(ledger.totals.balance()),
        "months": months
    }))
}

/// Due date for `month` on the configured day, clamped to the month's end.
fn default_due_date(month: &str, day: u32) -> Option<String> {
    let first = NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d").ok()?;
    let mut d = day.clamp(1, 31);
    loop {
        if let Some(date) = NaiveDate::from_ymd_opt(first.year(), first.month(), d) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
        d -= 1;
    }
}

fn handle_generate_monthly(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let class_id = required_str(p, "classId")?;
    let month = opt_month(p, "month")?.ok_or_else(|| HandlerErr::bad_params("missing month"))?;
    let class = load_class(conn, &class_id)?;
    let Some(amount_cents) = class.monthly_fee_cents else {
        return Err(HandlerErr::conflict("class has no monthly fee"));
    };
    let due_date = match opt_date(p, "dueDate")? {
        Some(d) => d,
        None => {
            let settings = fee_settings(conn)
                .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
            default_due_date(&month, settings.due_day_of_month)
                .ok_or_else(|| HandlerErr::bad_params("month must be YYYY-MM"))?
        }
    };

    let already: HashSet<String> = {
        let mut stmt = conn.prepare(
            "SELECT student_id FROM fee_records
             WHERE class_id = ? AND month = ? AND kind = 'charge' AND fee_type = 'tuition'",
        )?;
        let ids = stmt
            .query_map((&class_id, &month), |r| r.get(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        ids
    };
    let students = class_students(conn, &class_id, true)?;
    let class_name = class.display_name();
    let created_by = current_user_id(state);
    let now = now_ts();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut created = 0usize;
    let mut skipped = 0usize;
    for s in &students {
        if already.contains(&s.id) {
            skipped += 1;
            continue;
        }
        tx.execute(
            "INSERT INTO fee_records(id, student_id, reg_no, class_id, class_name, fee_type, kind,
                amount_cents, month, date, note, created_by, created_at)
             VALUES(?, ?, ?, ?, ?, 'tuition', 'charge', ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                s.id,
                s.reg_no,
                class_id,
                class_name,
                amount_cents,
                month,
                due_date,
                format!("Monthly tuition {}", month),
                created_by,
                now
            ],
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", "fee_records", e))?;
        created += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(class_id = %class_id, month = %month, created, skipped, "monthly fees generated");

    Ok(json!({
        "classId": class_id,
        "month": month,
        "dueDate": due_date,
        "amount": cents_to_number(amount_cents),
        "created": created,
        "skipped": skipped
    }))
}

fn summary_json(t: &Totals) -> Value {
    json!({
        "charged": cents_to_number(t.charged),
        "collected": cents_to_number(t.paid),
        "waived": cents_to_number(t.waived),
        "outstanding": cents_to_number(t.balance())
    })
}

fn handle_fees_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let month = opt_month(&req.params, "month")?;
    let class_id = opt_str(&req.params, "classId")?;
    let mut stmt = conn.prepare(
        "SELECT class_id, class_name, fee_type, kind, SUM(amount_cents)
         FROM fee_records
         WHERE (?1 IS NULL OR month = ?1) AND (?2 IS NULL OR class_id = ?2)
         GROUP BY class_id, class_name, fee_type, kind",
    )?;
    let groups = stmt
        .query_map((&month, &class_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut total = Totals::default();
    let mut by_class: BTreeMap<String, (String, Totals)> = BTreeMap::new();
    let mut by_type: BTreeMap<String, Totals> = BTreeMap::new();
    for (cid, cname, fee_type, kind, cents) in groups {
        let kind = stored_kind(3, &kind)?;
        total.add(kind, cents);
        let entry = by_class.entry(cid).or_insert_with(|| (cname, Totals::default()));
        entry.1.add(kind, cents);
        by_type.entry(fee_type).or_default().add(kind, cents);
    }

    let classes: Vec<Value> = by_class
        .iter()
        .map(|(cid, (cname, t))| {
            let mut v = summary_json(t);
            v["classId"] = json!(cid);
            v["className"] = json!(cname);
            v
        })
        .collect();
    let types: Vec<Value> = by_type
        .iter()
        .map(|(fee_type, t)| {
            let mut v = summary_json(t);
            v["feeType"] = json!(fee_type);
            v
        })
        .collect();
    Ok(json!({
        "month": month,
        "classId": class_id,
        "totals": summary_json(&total),
        "byClass": classes,
        "byFeeType": types
    }))
}

fn handle_fees_defaulters(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_id = opt_str(&req.params, "classId")?;
    let min_balance = match opt_f64(&req.params, "minBalance")? {
        Some(v) if v < 0.0 => return Err(HandlerErr::bad_params("minBalance must be >= 0")),
        Some(v) => (v * 100.0).round() as i64,
        None => 0,
    };
    let mut stmt = conn.prepare(
        "SELECT s.id, s.reg_no, s.first_name, s.last_name, s.class_id, f.class_name,
            SUM(CASE WHEN f.kind = 'charge' THEN f.amount_cents ELSE 0 END),
            SUM(CASE WHEN f.kind = 'payment' THEN f.amount_cents ELSE 0 END),
            SUM(CASE WHEN f.kind = 'waiver' THEN f.amount_cents ELSE 0 END)
         FROM fee_records f
         JOIN students s ON s.id = f.student_id
         WHERE (?1 IS NULL OR s.class_id = ?1)
         GROUP BY s.id",
    )?;
    let mut rows: Vec<(Value, i64)> = stmt
        .query_map([&class_id], |r| {
            let totals = Totals {
                charged: r.get(6)?,
                paid: r.get(7)?,
                waived: r.get(8)?,
            };
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            let mut v = totals_json(&totals);
            v["studentId"] = json!(r.get::<_, String>(0)?);
            v["regNo"] = json!(r.get::<_, String>(1)?);
            v["fullName"] = json!(format!("{} {}", first, last).trim());
            v["classId"] = json!(r.get::<_, String>(4)?);
            v["className"] = json!(r.get::<_, String>(5)?);
            Ok((v, totals.balance()))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.retain(|(_, balance)| *balance > min_balance);
    rows.sort_by(|a, b| b.1.cmp(&a.1));
    let total: i64 = rows.iter().map(|(_, b)| b).sum();
    Ok(json!({
        "defaulters": rows.into_iter().map(|(v, _)| v).collect::<Vec<_>>(),
        "totalOutstanding": cents_to_number(total)
    }))
}

/// Fee records whose regNo no longer matches any student.
fn orphan_rows(conn: &Connection) -> Result<Vec<FeeRow>, HandlerErr> {
    let known: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT reg_no_key FROM students")?;
        let keys = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        keys
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM fee_records ORDER BY reg_no, date",
        FEE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], fee_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|r| !known.contains(&name_key(&[&r.reg_no])))
        .collect())
}

fn handle_orphans_list(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let rows = orphan_rows(conn)?;
    let total: i64 = rows.iter().map(|r| r.amount_cents).sum();
    Ok(json!({
        "orphans": rows.iter().map(FeeRow::to_json).collect::<Vec<_>>(),
        "count": rows.len(),
        "totalAmount": cents_to_number(total)
    }))
}

fn handle_orphans_purge(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let dry_run = opt_bool(&req.params, "dryRun")?.unwrap_or(false);
    let rows = orphan_rows(conn)?;
    if dry_run {
        return Ok(json!({ "dryRun": true, "count": rows.len(), "deleted": 0 }));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut deleted = 0usize;
    for r in &rows {
        deleted += tx
            .execute("DELETE FROM fee_records WHERE id = ?", [&r.id])
            .map_err(|e| HandlerErr::db("db_delete_failed", "fee_records", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::warn!(deleted, "orphaned fee records purged");
    Ok(json!({ "dryRun": false, "count": rows.len(), "deleted": deleted }))
}

fn handle_export_csv(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let out_path = PathBuf::from(required_str(&req.params, "outPath")?);
    let mut rows = FeeFilter::from_params(&req.params)?.query(conn)?;
    rows.reverse();

    let header = [
        "date", "regNo", "className", "feeType", "kind", "amount", "month", "method",
        "reference", "note",
    ];
    let mut text = csv_line(&header.iter().map(|h| h.to_string()).collect::<Vec<_>>());
    text.push('\n');
    for r in &rows {
        text.push_str(&csv_line(&[
            r.date.clone(),
            r.reg_no.clone(),
            r.class_name.clone(),
            r.fee_type.clone(),
            r.kind.as_str().to_string(),
            format_cents(r.amount_cents),
            r.month.clone().unwrap_or_default(),
            r.method.clone().unwrap_or_default(),
            r.reference.clone().unwrap_or_default(),
            r.note.clone().unwrap_or_default(),
        ]));
        text.push('\n');
    }
    write_text_file(&out_path, &text)
        .map_err(|e| HandlerErr::new("export_failed", format!("{:#}", e)))?;
    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "rows": rows.len()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "fees.list" => handle_fees_list(state, req),
        "fees.create" => handle_fees_create(state, req),
        "fees.update" => handle_fees_update(state, req),
        "fees.delete" => handle_fees_delete(state, req),
        "fees.ledger" => handle_fees_ledger(state, req),
        "fees.generateMonthly" => handle_generate_monthly(state, req),
        "fees.summary" => handle_fees_summary(state, req),
        "fees.defaulters" => handle_fees_defaulters(state, req),
        "fees.orphans.list" => handle_orphans_list(state, req),
        "fees.orphans.purge" => handle_orphans_purge(state, req),
        "fees.exportCsv" => handle_export_csv(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_date_clamps_to_month_end() {
        assert_eq!(default_due_date("2026-02", 31).as_deref(), Some("2026-02-28"));
        assert_eq!(default_due_date("2024-02", 30).as_deref(), Some("2024-02-29"));
        assert_eq!(default_due_date("2026-03", 10).as_deref(), Some("2026-03-10"));
        assert_eq!(default_due_date("nope", 10), None);
    }

    #[test]
    fn payments_need_a_method() {
        assert!(check_method(EntryKind::Payment, None).is_err());
        assert!(check_method(EntryKind::Payment, Some("cash")).is_ok());
        assert!(check_method(EntryKind::Charge, None).is_ok());
        assert!(parse_method("Cheque").is_err());
        assert_eq!(parse_fee_type(" Tuition ").ok().as_deref(), Some("tuition"));
    }
}
