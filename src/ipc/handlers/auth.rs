use crate::auth::{self, PasswordHash, Role};
use crate::ipc::helpers::{
    db_conn, is_unique_violation, now_ts, opt_bool, opt_str, required_str, respond, HandlerErr,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const BAD_CREDENTIALS: &str = "invalid username or password";

struct UserRow {
    id: String,
    username: String,
    display_name: String,
    role: String,
    active: bool,
    created_at: String,
    hash: PasswordHash,
}

impl UserRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "displayName": self.display_name,
            "role": self.role,
            "active": self.active,
            "createdAt": self.created_at
        })
    }
}

const USER_COLUMNS: &str = "id, username, display_name, role, active, created_at,
    password_hash, password_salt, password_iterations";

fn user_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    let iterations: i64 = r.get(8)?;
    Ok(UserRow {
        id: r.get(0)?,
        username: r.get(1)?,
        display_name: r.get(2)?,
        role: r.get(3)?,
        active: r.get::<_, i64>(4)? != 0,
        created_at: r.get(5)?,
        hash: PasswordHash {
            hash_b64: r.get(6)?,
            salt_b64: r.get(7)?,
            iterations: u32::try_from(iterations).unwrap_or(1),
        },
    })
}

fn load_user(conn: &Connection, user_id: &str) -> Result<UserRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
        [user_id],
        user_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("user not found"))
}

fn username_key(username: &str) -> String {
    username.trim().to_lowercase()
}

fn validate_username(username: &str) -> Result<(), HandlerErr> {
    let n = username.chars().count();
    if !(3..=32).contains(&n)
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(HandlerErr::bad_params(
            "username must be 3..=32 letters, digits, '.', '_' or '-'",
        ));
    }
    Ok(())
}

fn validate_password(state: &AppState, password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < state.config.min_password_len {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            state.config.min_password_len
        )));
    }
    Ok(())
}

/// Passwords are taken verbatim, surrounding whitespace included.
fn required_password(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("role must be one of: admin, staff, accountant"))
}

fn session_expired(expires_at: &str) -> bool {
    DateTime::parse_from_rfc3339(expires_at)
        .map(|t| t.with_timezone(&Utc) <= Utc::now())
        .unwrap_or(true)
}

/// Resolves a bearer token to its user. Expired sessions are removed.
pub fn authenticate(conn: &Connection, token: &str) -> Result<SessionUser, HandlerErr> {
    let token_hash = auth::token_digest(token.trim());
    let row: Option<(String, String, String, String, i64, String)> = conn
        .query_row(
            "SELECT u.id, u.username, u.display_name, u.role, u.active, s.expires_at
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ?",
            [&token_hash],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )
        .optional()?;
    let Some((user_id, username, display_name, role, active, expires_at)) = row else {
        return Err(HandlerErr::new("unauthorized", "invalid or expired session"));
    };
    if session_expired(&expires_at) {
        if let Err(e) = conn.execute("DELETE FROM sessions WHERE token_hash = ?", [&token_hash]) {
            tracing::warn!(error = %e, "failed to drop expired session");
        }
        return Err(HandlerErr::new("unauthorized", "invalid or expired session"));
    }
    if active == 0 {
        return Err(HandlerErr::new("unauthorized", "account is disabled"));
    }
    let role = Role::parse(&role)
        .ok_or_else(|| HandlerErr::new("unauthorized", "account has an unknown role"))?;
    Ok(SessionUser {
        user_id,
        username,
        display_name,
        role,
        token_hash,
    })
}

fn issue_session(conn: &Connection, user_id: &str, ttl_minutes: i64) -> Result<(String, String), HandlerErr> {
    let token = auth::new_session_token();
    let now = Utc::now();
    let expires_at = (now + Duration::minutes(ttl_minutes)).to_rfc3339_opts(SecondsFormat::Secs, true);
    conn.execute(
        "INSERT INTO sessions(token_hash, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (
            auth::token_digest(&token),
            user_id,
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
            &expires_at,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "sessions", e))?;
    Ok((token, expires_at))
}

fn prune_expired_sessions(conn: &Connection) {
    let now = now_ts();
    if let Err(e) = conn.execute("DELETE FROM sessions WHERE expires_at <= ?", [&now]) {
        tracing::warn!(error = %e, "failed to prune expired sessions");
    }
}

fn active_admin_count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'admin' AND active = 1",
        [],
        |r| r.get(0),
    )
}

fn handle_status(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let has_users = super::core::user_count(conn)? > 0;
    let user = match state.current_user.as_ref() {
        Some(u) => Some(load_user(conn, &u.user_id)?.to_json()),
        None => None,
    };
    Ok(json!({
        "hasUsers": has_users,
        "authenticated": user.is_some(),
        "user": user
    }))
}

fn handle_register(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let first_user = super::core::user_count(conn)? == 0;
    if !first_user {
        match state.current_user.as_ref() {
            None => return Err(HandlerErr::new("unauthorized", "sign in as an admin first")),
            Some(u) if u.role != Role::Admin => {
                return Err(HandlerErr::new("forbidden", "only admins can add users"))
            }
            Some(_) => {}
        }
    }

    let username = required_str(&req.params, "username")?;
    validate_username(&username)?;
    let password = required_password(&req.params, "password")?;
    validate_password(state, &password)?;
    let display_name = opt_str(&req.params, "displayName")?.unwrap_or_else(|| username.clone());
    let role = if first_user {
        Role::Admin
    } else {
        match opt_str(&req.params, "role")? {
            Some(r) => parse_role(&r)?,
            None => Role::Staff,
        }
    };

    let hash = auth::hash_password(&password, state.config.pbkdf2_iterations);
    let user_id = Uuid::new_v4().to_string();
    let now = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, username, username_key, display_name, role,
            password_hash, password_salt, password_iterations, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        rusqlite::params![
            user_id,
            username,
            username_key(&username),
            display_name,
            role.as_str(),
            hash.hash_b64,
            hash.salt_b64,
            hash.iterations as i64,
            now,
            now
        ],
    ) {
        if is_unique_violation(&e) {
            return Err(HandlerErr::conflict("username already taken"));
        }
        return Err(HandlerErr::db("db_insert_failed", "users", e));
    }
    tracing::info!(username = %username, role = role.as_str(), first_user, "user registered");
    Ok(json!({ "user": load_user(conn, &user_id)?.to_json() }))
}

fn handle_login(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let username = required_str(&req.params, "username")?;
    let password = required_password(&req.params, "password")?;

    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE username_key = ?", USER_COLUMNS),
            [username_key(&username)],
            user_from_row,
        )
        .optional()?;
    let Some(user) = user else {
        tracing::warn!(username = %username, "login failed");
        return Err(HandlerErr::new("unauthorized", BAD_CREDENTIALS));
    };
    if !auth::verify_password(&password, &user.hash) {
        tracing::warn!(username = %username, "login failed");
        return Err(HandlerErr::new("unauthorized", BAD_CREDENTIALS));
    }
    if !user.active {
        tracing::warn!(username = %username, "login refused for disabled account");
        return Err(HandlerErr::new("unauthorized", "account is disabled"));
    }

    prune_expired_sessions(conn);
    let (token, expires_at) = issue_session(conn, &user.id, state.config.session_ttl_minutes)?;
    tracing::info!(username = %user.username, "login");
    Ok(json!({
        "token": token,
        "expiresAt": expires_at,
        "user": user.to_json()
    }))
}

fn signed_in(state: &AppState) -> Result<&SessionUser, HandlerErr> {
    state
        .current_user
        .as_ref()
        .ok_or_else(|| HandlerErr::new("unauthorized", "sign in first"))
}

fn handle_logout(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let me = signed_in(state)?;
    conn.execute("DELETE FROM sessions WHERE token_hash = ?", [&me.token_hash])
        .map_err(|e| HandlerErr::db("db_delete_failed", "sessions", e))?;
    Ok(json!({ "ok": true }))
}

fn handle_me(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let me = signed_in(state)?;
    Ok(json!({ "user": load_user(conn, &me.user_id)?.to_json() }))
}

fn store_password(conn: &Connection, user_id: &str, hash: &PasswordHash) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE users SET password_hash = ?, password_salt = ?, password_iterations = ?, updated_at = ?
         WHERE id = ?",
        (
            &hash.hash_b64,
            &hash.salt_b64,
            hash.iterations as i64,
            now_ts(),
            user_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "users", e))?;
    Ok(())
}

fn handle_change_password(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let me = signed_in(state)?;
    let current = required_password(&req.params, "currentPassword")?;
    let new_password = required_password(&req.params, "newPassword")?;
    validate_password(state, &new_password)?;

    let user = load_user(conn, &me.user_id)?;
    if !auth::verify_password(&current, &user.hash) {
        return Err(HandlerErr::bad_params("current password is incorrect"));
    }
    let hash = auth::hash_password(&new_password, state.config.pbkdf2_iterations);
    store_password(conn, &me.user_id, &hash)?;
    let revoked = conn
        .execute(
            "DELETE FROM sessions WHERE user_id = ? AND token_hash <> ?",
            (&me.user_id, &me.token_hash),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", "sessions", e))?;
    tracing::info!(username = %me.username, revoked, "password changed");
    Ok(json!({ "ok": true, "revokedSessions": revoked }))
}

fn handle_users_list(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users ORDER BY username_key",
        USER_COLUMNS
    ))?;
    let users = stmt
        .query_map([], user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": users.iter().map(UserRow::to_json).collect::<Vec<_>>() }))
}

fn handle_users_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let me = signed_in(state)?;
    let user_id = required_str(&req.params, "userId")?;
    let target = load_user(conn, &user_id)?;

    let display_name = opt_str(&req.params, "displayName")?;
    let role = match opt_str(&req.params, "role")? {
        Some(r) => Some(parse_role(&r)?),
        None => None,
    };
    let active = opt_bool(&req.params, "active")?;

    let new_role = role.map(Role::as_str).unwrap_or(target.role.as_str());
    let new_active = active.unwrap_or(target.active);
    let loses_admin = target.role == "admin" && target.active && (new_role != "admin" || !new_active);
    if user_id == me.user_id && loses_admin {
        return Err(HandlerErr::conflict("you cannot demote or deactivate yourself"));
    }
    if user_id == me.user_id && !new_active {
        return Err(HandlerErr::conflict("you cannot deactivate yourself"));
    }
    if loses_admin && active_admin_count(conn)? <= 1 {
        return Err(HandlerErr::conflict("at least one active admin must remain"));
    }

    conn.execute(
        "UPDATE users SET display_name = ?, role = ?, active = ?, updated_at = ? WHERE id = ?",
        (
            display_name.as_deref().unwrap_or(&target.display_name),
            new_role,
            new_active as i64,
            now_ts(),
            &user_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "users", e))?;
    if !new_active {
        conn.execute("DELETE FROM sessions WHERE user_id = ?", [&user_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", "sessions", e))?;
    }
    tracing::info!(user = %target.username, role = new_role, active = new_active, "user updated");
    Ok(json!({ "user": load_user(conn, &user_id)?.to_json() }))
}

fn handle_users_reset_password(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let user_id = required_str(&req.params, "userId")?;
    let new_password = required_password(&req.params, "newPassword")?;
    validate_password(state, &new_password)?;
    let target = load_user(conn, &user_id)?;

    let hash = auth::hash_password(&new_password, state.config.pbkdf2_iterations);
    store_password(conn, &user_id, &hash)?;
    conn.execute("DELETE FROM sessions WHERE user_id = ?", [&user_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "sessions", e))?;
    tracing::info!(user = %target.username, "password reset");
    Ok(json!({ "ok": true }))
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let me = signed_in(state)?;
    let user_id = required_str(&req.params, "userId")?;
    if user_id == me.user_id {
        return Err(HandlerErr::conflict("you cannot delete yourself"));
    }
    let target = load_user(conn, &user_id)?;
    if target.role == "admin" && target.active && active_admin_count(conn)? <= 1 {
        return Err(HandlerErr::conflict("at least one active admin must remain"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM sessions WHERE user_id = ?", [&user_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "sessions", e))?;
    tx.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "users", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(user = %target.username, "user deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "auth.status" => handle_status(state, req),
        "auth.register" => handle_register(state, req),
        "auth.login" => handle_login(state, req),
        "auth.logout" => handle_logout(state, req),
        "auth.me" => handle_me(state, req),
        "auth.changePassword" => handle_change_password(state, req),
        "users.list" => handle_users_list(state, req),
        "users.update" => handle_users_update(state, req),
        "users.resetPassword" => handle_users_reset_password(state, req),
        "users.delete" => handle_users_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
