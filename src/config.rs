use std::env;
use std::path::PathBuf;

pub const DEFAULT_SESSION_TTL_MINUTES: i64 = 720;
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;
pub const MIN_PBKDF2_ITERATIONS: u32 = 1_000;
pub const DEFAULT_MIN_PASSWORD_LEN: usize = 8;

/// Process-level settings read once at startup. Per-school settings live in
/// the workspace database instead (see `setup.*`).
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub log_filter: String,
    pub log_json: bool,
    pub session_ttl_minutes: i64,
    pub pbkdf2_iterations: u32,
    pub min_password_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            log_filter: "info".to_string(),
            log_json: false,
            session_ttl_minutes: DEFAULT_SESSION_TTL_MINUTES,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let workspace = lookup("SCHOOLD_WORKSPACE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let log_filter = lookup("SCHOOLD_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.log_filter);
        let log_json = lookup("SCHOOLD_LOG_JSON")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(defaults.log_json);
        let session_ttl_minutes = lookup("SCHOOLD_SESSION_TTL_MINUTES")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.session_ttl_minutes);
        let pbkdf2_iterations = lookup("SCHOOLD_PBKDF2_ITERATIONS")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .map(|v| v.max(MIN_PBKDF2_ITERATIONS))
            .unwrap_or(defaults.pbkdf2_iterations);
        let min_password_len = lookup("SCHOOLD_MIN_PASSWORD_LEN")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.min_password_len);

        Self {
            workspace,
            log_filter,
            log_json,
            session_ttl_minutes,
            pbkdf2_iterations,
            min_password_len,
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
