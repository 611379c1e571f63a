use crate::db;
use crate::ipc::helpers::{respond, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

pub fn user_count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
}

fn handle_health(state: &mut AppState, _req: &Request) -> HandlerResult {
    let has_users = match state.db.as_ref() {
        Some(conn) => Some(user_count(conn)? > 0),
        None => None,
    };
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "hasUsers": has_users
    }))
}

/// Opens (creating if needed) the workspace database and makes it current.
pub fn open_workspace(state: &mut AppState, path: PathBuf) -> anyhow::Result<()> {
    state.db = None;
    state.current_user = None;
    let conn = db::open_db(&path)?;
    tracing::info!(workspace = %path.display(), "workspace opened");
    state.workspace = Some(path);
    state.db = Some(conn);
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> HandlerResult {
    let path = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr::bad_params("missing params.path"))?;

    if let Err(e) = open_workspace(state, path.clone()) {
        tracing::warn!(workspace = %path.display(), error = %e, "workspace open failed");
        return Err(HandlerErr::new("db_open_failed", format!("{e:#}")));
    }
    let has_users = match state.db.as_ref() {
        Some(conn) => user_count(conn)? > 0,
        None => false,
    };
    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "hasUsers": has_users
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(respond(req, handle_health(state, req))),
        "workspace.select" => Some(respond(req, handle_workspace_select(state, req))),
        _ => None,
    }
}
