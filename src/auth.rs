//! Password hashing, session tokens and the role/permission model.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub hash_b64: String,
    pub salt_b64: String,
    pub iterations: u32,
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

pub fn hash_password(password: &str, iterations: u32) -> PasswordHash {
    let salt = *Uuid::new_v4().as_bytes();
    let key = derive_key(password, &salt, iterations.max(1));
    PasswordHash {
        hash_b64: B64.encode(key),
        salt_b64: B64.encode(salt),
        iterations: iterations.max(1),
    }
}

pub fn verify_password(password: &str, stored: &PasswordHash) -> bool {
    let Ok(salt) = B64.decode(stored.salt_b64.as_bytes()) else {
        return false;
    };
    let Ok(expected) = B64.decode(stored.hash_b64.as_bytes()) else {
        return false;
    };
    let key = derive_key(password, &salt, stored.iterations.max(1));
    constant_time_eq(&key, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 64 hex chars drawn from two v4 UUIDs.
pub fn new_session_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Only the digest of a session token is stored.
pub fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Staff,
    Accountant,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "staff" => Some(Self::Staff),
            "accountant" => Some(Self::Accountant),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
            Self::Accountant => "accountant",
        }
    }

    pub fn allows(self, permission: Permission) -> bool {
        match permission {
            Permission::Public | Permission::Authenticated => true,
            Permission::Academic => matches!(self, Self::Admin | Self::Staff),
            Permission::Finance => matches!(self, Self::Admin | Self::Accountant),
            Permission::Admin => self == Self::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Public,
    Authenticated,
    Academic,
    Finance,
    Admin,
}

fn is_read_method(action: &str) -> bool {
    matches!(
        action,
        "list" | "get" | "weekly" | "checkConflicts" | "preview" | "ledger" | "summary"
            | "defaulters" | "overview" | "studentReport" | "classReport" | "exam" | "student"
            | "stats"
    )
}

/// Permission a method needs before its handler runs. Handlers may apply
/// stricter, parameter-dependent checks (e.g. forced class deletion).
pub fn permission_for(method: &str) -> Permission {
    match method {
        "health" | "workspace.select" | "auth.status" | "auth.login" | "auth.register" => {
            return Permission::Public
        }
        "auth.me" | "auth.logout" | "auth.changePassword" => return Permission::Authenticated,
        "fees.orphans.purge" | "setup.update" => return Permission::Admin,
        _ => {}
    }

    let (family, action) = method.split_once('.').unwrap_or((method, ""));
    let action = action.rsplit('.').next().unwrap_or(action);
    match family {
        "users" | "backup" => Permission::Admin,
        _ if is_read_method(action) => Permission::Authenticated,
        "fees" | "expenses" | "finance" => Permission::Finance,
        "setup" | "dashboard" => Permission::Authenticated,
        _ => Permission::Academic,
    }
}
