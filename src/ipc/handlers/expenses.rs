use crate::ipc::helpers::{
    csv_line, current_user_id, db_conn, date_range, now_ts, opt_date, opt_str, patch_str,
    required_str, respond, today, write_text_file, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{cents_to_number, format_cents};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use super::fees::PAYMENT_METHODS;
use super::setup::opt_amount_cents;

pub const EXPENSE_CATEGORIES: [&str; 7] = [
    "salary",
    "utilities",
    "maintenance",
    "supplies",
    "transport",
    "events",
    "other",
];

struct ExpenseRow {
    id: String,
    title: String,
    category: String,
    amount_cents: i64,
    date: String,
    paid_to: Option<String>,
    method: Option<String>,
    note: Option<String>,
    created_by: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

impl ExpenseRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "title": self.title,
            "category": self.category,
            "amountCents": self.amount_cents,
            "amount": cents_to_number(self.amount_cents),
            "date": self.date,
            "paidTo": self.paid_to,
            "method": self.method,
            "note": self.note,
            "createdBy": self.created_by,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }
}

const EXPENSE_COLUMNS: &str =
    "id, title, category, amount_cents, date, paid_to, method, note, created_by, created_at, updated_at";

fn expense_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ExpenseRow> {
    Ok(ExpenseRow {
        id: r.get(0)?,
        title: r.get(1)?,
        category: r.get(2)?,
        amount_cents: r.get(3)?,
        date: r.get(4)?,
        paid_to: r.get(5)?,
        method: r.get(6)?,
        note: r.get(7)?,
        created_by: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

fn load_expense(conn: &Connection, expense_id: &str) -> Result<ExpenseRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM expenses WHERE id = ?", EXPENSE_COLUMNS),
        [expense_id],
        expense_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("expense not found"))
}

fn parse_category(raw: &str) -> Result<String, HandlerErr> {
    let c = raw.trim().to_ascii_lowercase();
    if EXPENSE_CATEGORIES.contains(&c.as_str()) {
        Ok(c)
    } else {
        Err(HandlerErr::bad_params(format!(
            "category must be one of: {}",
            EXPENSE_CATEGORIES.join(", ")
        )))
    }
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

fn query_expenses(
    conn: &Connection,
    from: &Option<String>,
    to: &Option<String>,
    category: &Option<String>,
) -> Result<Vec<ExpenseRow>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM expenses
         WHERE (?1 IS NULL OR date >= ?1)
           AND (?2 IS NULL OR date <= ?2)
           AND (?3 IS NULL OR category = ?3)
         ORDER BY date DESC, created_at DESC",
        EXPENSE_COLUMNS
    ))?;
    let rows = stmt
        .query_map((from, to, category), expense_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_expenses_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let (from, to) = date_range(&req.params)?;
    let category = opt_str(&req.params, "category")?
        .map(|c| parse_category(&c))
        .transpose()?;
    let rows = query_expenses(conn, &from, &to, &category)?;
    let total: i64 = rows.iter().map(|r| r.amount_cents).sum();
    Ok(json!({
        "expenses": rows.iter().map(ExpenseRow::to_json).collect::<Vec<_>>(),
        "total": cents_to_number(total)
    }))
}

fn handle_expenses_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let expense_id = required_str(&req.params, "expenseId")?;
    Ok(json!({ "expense": load_expense(conn, &expense_id)?.to_json() }))
}

fn handle_expenses_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let title = required_str(p, "title")?;
    let category = parse_category(&required_str(p, "category")?)?;
    let amount_cents =
        opt_amount_cents(p, "amount")?.ok_or_else(|| HandlerErr::bad_params("missing amount"))?;
    let date = opt_date(p, "date")?.unwrap_or_else(today);
    let method = opt_str(p, "method")?.map(|m| parse_method(&m)).transpose()?;

    let expense_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO expenses(id, title, category, amount_cents, date, paid_to, method, note,
            created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            expense_id,
            title,
            category,
            amount_cents,
            date,
            opt_str(p, "paidTo")?,
            method,
            opt_str(p, "note")?,
            current_user_id(state),
            now_ts()
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "expenses", e))?;
    Ok(json!({
        "expenseId": expense_id,
        "expense": load_expense(conn, &expense_id)?.to_json()
    }))
}

fn handle_expenses_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let expense_id = required_str(p, "expenseId")?;
    let cur = load_expense(conn, &expense_id)?;

    let title = opt_str(p, "title")?.unwrap_or(cur.title.clone());
    let category = match opt_str(p, "category")? {
        Some(c) => parse_category(&c)?,
        None => cur.category.clone(),
    };
    let amount_cents = opt_amount_cents(p, "amount")?.unwrap_or(cur.amount_cents);
    let date = opt_date(p, "date")?.unwrap_or(cur.date.clone());
    let method = match patch_str(p, "method")? {
        Some(m) => m.map(|m| parse_method(&m)).transpose()?,
        None => cur.method.clone(),
    };
    let paid_to = patch_str(p, "paidTo")?.unwrap_or(cur.paid_to.clone());
    let note = patch_str(p, "note")?.unwrap_or(cur.note.clone());

    conn.execute(
        "UPDATE expenses SET title = ?, category = ?, amount_cents = ?, date = ?, paid_to = ?,
            method = ?, note = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            title,
            category,
            amount_cents,
            date,
            paid_to,
            method,
            note,
            now_ts(),
            expense_id
        ],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "expenses", e))?;
    Ok(json!({ "expense": load_expense(conn, &expense_id)?.to_json() }))
}

fn handle_expenses_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let expense_id = required_str(&req.params, "expenseId")?;
    let n = conn
        .execute("DELETE FROM expenses WHERE id = ?", [&expense_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "expenses", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("expense not found"));
    }
    Ok(json!({ "ok": true }))
}

fn handle_expenses_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let (from, to) = date_range(&req.params)?;
    let rows = query_expenses(conn, &from, &to, &None)?;

    let mut by_category: BTreeMap<&str, i64> = BTreeMap::new();
    let mut by_month: BTreeMap<&str, i64> = BTreeMap::new();
    let mut total = 0i64;
    for r in &rows {
        total += r.amount_cents;
        *by_category.entry(r.category.as_str()).or_default() += r.amount_cents;
        *by_month.entry(&r.date[..7.min(r.date.len())]).or_default() += r.amount_cents;
    }
    Ok(json!({
        "from": from,
        "to": to,
        "total": cents_to_number(total),
        "count": rows.len(),
        "byCategory": by_category
            .iter()
            .map(|(c, cents)| json!({ "category": c, "total": cents_to_number(*cents) }))
            .collect::<Vec<_>>(),
        "byMonth": by_month
            .iter()
            .map(|(m, cents)| json!({ "month": m, "total": cents_to_number(*cents) }))
            .collect::<Vec<_>>()
    }))
}

/// Sums `(month, cents)` for fee payments within the range.
fn monthly_income(
    conn: &Connection,
    from: &Option<String>,
    to: &Option<String>,
) -> Result<BTreeMap<String, i64>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT substr(date, 1, 7), SUM(amount_cents) FROM fee_records
         WHERE kind = 'payment'
           AND (?1 IS NULL OR date >= ?1)
           AND (?2 IS NULL OR date <= ?2)
         GROUP BY substr(date, 1, 7)",
    )?;
    let rows = stmt
        .query_map((from, to), |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

fn monthly_expenses(
    conn: &Connection,
    from: &Option<String>,
    to: &Option<String>,
) -> Result<BTreeMap<String, i64>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT substr(date, 1, 7), SUM(amount_cents) FROM expenses
         WHERE (?1 IS NULL OR date >= ?1)
           AND (?2 IS NULL OR date <= ?2)
         GROUP BY substr(date, 1, 7)",
    )?;
    let rows = stmt
        .query_map((from, to), |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

fn handle_finance_overview(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let (from, to) = date_range(&req.params)?;
    let income = monthly_income(conn, &from, &to)?;
    let spent = monthly_expenses(conn, &from, &to)?;

    let mut months: Vec<&String> = income.keys().chain(spent.keys()).collect();
    months.sort();
    months.dedup();
    let series: Vec<Value> = months
        .iter()
        .map(|m| {
            let i = income.get(*m).copied().unwrap_or(0);
            let e = spent.get(*m).copied().unwrap_or(0);
            json!({
                "month": m,
                "income": cents_to_number(i),
                "expenses": cents_to_number(e),
                "net": cents_to_number(i - e)
            })
        })
        .collect();

    let total_income: i64 = income.values().sum();
    let total_expenses: i64 = spent.values().sum();
    Ok(json!({
        "from": from,
        "to": to,
        "income": cents_to_number(total_income),
        "expenses": cents_to_number(total_expenses),
        "net": cents_to_number(total_income - total_expenses),
        "monthly": series
    }))
}

fn handle_export_csv(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let out_path = PathBuf::from(required_str(&req.params, "outPath")?);
    let (from, to) = date_range(&req.params)?;
    let mut rows = query_expenses(conn, &from, &to, &None)?;
    rows.reverse();

    let header = ["date", "title", "category", "amount", "paidTo", "method", "note"];
    let mut text = csv_line(&header.iter().map(|h| h.to_string()).collect::<Vec<_>>());
    text.push('\n');
    for r in &rows {
        text.push_str(&csv_line(&[
            r.date.clone(),
            r.title.clone(),
            r.category.clone(),
            format_cents(r.amount_cents),
            r.paid_to.clone().unwrap_or_default(),
            r.method.clone().unwrap_or_default(),
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
        "expenses.list" => handle_expenses_list(state, req),
        "expenses.get" => handle_expenses_get(state, req),
        "expenses.create" => handle_expenses_create(state, req),
        "expenses.update" => handle_expenses_update(state, req),
        "expenses.delete" => handle_expenses_delete(state, req),
        "expenses.summary" => handle_expenses_summary(state, req),
        "expenses.exportCsv" => handle_export_csv(state, req),
        "finance.overview" => handle_finance_overview(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
