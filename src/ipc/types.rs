use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::Role;
use crate::config::Config;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub token: Option<String>,
}

/// The user behind the current request, resolved from its session token.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub token_hash: String,
}

pub struct AppState {
    pub config: Config,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Set by the router for the duration of one request.
    pub current_user: Option<SessionUser>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            workspace: None,
            db: None,
            current_user: None,
        }
    }
}
