use std::time::Instant;

use super::handlers;
use super::helpers::HandlerErr;
use super::types::{AppState, Request};
use crate::auth::{self, Permission};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let started = Instant::now();
    let resp = match authorize(state, &req) {
        Ok(()) => dispatch(state, &req),
        Err(e) => e.response(&req.id),
    };
    state.current_user = None;

    let ok = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    let code = resp
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    tracing::debug!(
        id = %req.id,
        method = %req.method,
        ok,
        code,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    resp
}

/// Resolves the session token and checks the method's permission. Public
/// methods still pick up a valid token so `auth.status`/`auth.register` can
/// see who is asking.
fn authorize(state: &mut AppState, req: &Request) -> Result<(), HandlerErr> {
    let permission = auth::permission_for(&req.method);
    let token = req
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    if permission == Permission::Public {
        if let (Some(token), Some(conn)) = (token, state.db.as_ref()) {
            state.current_user = handlers::auth::authenticate(conn, token).ok();
        }
        return Ok(());
    }

    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let Some(token) = token else {
        return Err(HandlerErr::new("unauthorized", "sign in first"));
    };
    let user = handlers::auth::authenticate(conn, token)?;
    if !user.role.allows(permission) {
        tracing::warn!(
            method = %req.method,
            user = %user.username,
            role = user.role.as_str(),
            "permission denied"
        );
        return Err(HandlerErr::new("forbidden", "insufficient role")
            .with_details(serde_json::json!({ "role": user.role.as_str() })));
    }
    state.current_user = Some(user);
    Ok(())
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::auth::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::classes::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::subjects::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::timetable::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::attendance::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::exams::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::fees::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::expenses::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::certificates::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::dashboard::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::setup::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::backup::try_handle(state, req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
