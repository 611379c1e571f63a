use crate::auth::Permission;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use anyhow::Context;
use chrono::{NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::Path;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

pub type HandlerResult = Result<Value, HandlerErr>;

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_failed", message)
    }

    /// Storage failure tagged with the table it happened on.
    pub fn db(code: &'static str, table: &str, e: impl std::fmt::Display) -> Self {
        Self::new(code, e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

pub fn respond(req: &Request, result: HandlerResult) -> Value {
    match result {
        Ok(v) => crate::ipc::error::ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn current_user_id(state: &AppState) -> Option<String> {
    state.current_user.as_ref().map(|u| u.user_id.clone())
}

/// Parameter-dependent checks beyond the router's per-method gate.
pub fn require_permission(state: &AppState, permission: Permission) -> Result<(), HandlerErr> {
    let role = state.current_user.as_ref().map(|u| u.role);
    match role {
        Some(r) if r.allows(permission) => Ok(()),
        Some(_) => Err(HandlerErr::new("forbidden", "insufficient role")),
        None => Err(HandlerErr::new("unauthorized", "sign in first")),
    }
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(HandlerErr::bad_params(format!(
            "{} must not be empty",
            key
        ))),
        Some(Value::Null) | None => Err(HandlerErr::bad_params(format!("missing {}", key))),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

/// Missing, null and blank all read as `None`.
pub fn opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

/// Update semantics: `None` leaves the column alone, `Some(None)` clears it.
pub fn patch_str(params: &Value, key: &str) -> Result<Option<Option<String>>, HandlerErr> {
    if params.get(key).is_none() {
        return Ok(None);
    }
    opt_str(params, key).map(Some)
}

pub fn opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn opt_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn string_array(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        HandlerErr::bad_params(format!("{} must contain non-empty strings", key))
                    })
            })
            .collect(),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be an array", key))),
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn opt_date(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match opt_str(params, key)? {
        None => Ok(None),
        Some(s) => parse_date(&s)
            .map(|d| Some(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))),
    }
}

pub fn required_date(params: &Value, key: &str) -> Result<String, HandlerErr> {
    opt_date(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn is_month(s: &str) -> bool {
    NaiveDate::parse_from_str(&format!("{}-01", s.trim()), "%Y-%m-%d").is_ok()
        && s.trim().len() == 7
}

pub fn opt_month(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match opt_str(params, key)? {
        None => Ok(None),
        Some(s) if is_month(&s) => Ok(Some(s)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be YYYY-MM", key))),
    }
}

/// Optional inclusive `from`/`to` date filter; `from` after `to` is rejected.
pub fn date_range(params: &Value) -> Result<(Option<String>, Option<String>), HandlerErr> {
    let from = opt_date(params, "from")?;
    let to = opt_date(params, "to")?;
    if let (Some(f), Some(t)) = (from.as_deref(), to.as_deref()) {
        if f > t {
            return Err(HandlerErr::bad_params("from must not be after to"));
        }
    }
    Ok((from, to))
}

pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn today() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| csv_quote(f))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn write_text_file(path: &Path, text: &str) -> anyhow::Result<()> {
    write_bytes_file(path, text.as_bytes())
}

pub fn write_bytes_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }
    std::fs::write(path, bytes)
        .with_context(|| format!("failed to write {}", path.to_string_lossy()))
}

/// Escapes `\`, `%` and `_` for a `LIKE ... ESCAPE '\'` pattern.
pub fn like_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Lowercased, whitespace-collapsed key for case-insensitive uniqueness.
pub fn name_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| {
            p.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        })
        .collect::<Vec<_>>()
        .join("|")
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
