#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-pass-1";

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}-{}",
        prefix,
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::SeqCst),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

/// A running `schoold` talking the line protocol over pipes.
pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub token: Option<String>,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut child = Command::new(exe)
            .env("SCHOOLD_PBKDF2_ITERATIONS", "1000")
            .env("SCHOOLD_LOG", "off")
            .env_remove("SCHOOLD_WORKSPACE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
            token: None,
        }
    }

    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut payload = json!({ "id": id, "method": method, "params": params });
        if let Some(token) = self.token.as_ref() {
            payload["token"] = json!(token);
        }
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    /// Calls and asserts success, returning `result`.
    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.call(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value["result"].clone()
    }

    /// Calls and asserts failure, returning the error code.
    pub fn err_code(&mut self, method: &str, params: Value) -> String {
        let value = self.call(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn select_workspace(&mut self, prefix: &str) -> PathBuf {
        let workspace = temp_dir(prefix);
        self.ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        workspace
    }

    pub fn login(&mut self, username: &str, password: &str) -> Value {
        let result = self.ok(
            "auth.login",
            json!({ "username": username, "password": password }),
        );
        self.token = result["token"].as_str().map(str::to_string);
        result
    }

    /// Fresh workspace with the first (admin) account signed in.
    pub fn with_admin(prefix: &str) -> (Self, PathBuf) {
        let mut sc = Self::spawn();
        let workspace = sc.select_workspace(prefix);
        sc.ok(
            "auth.register",
            json!({ "username": ADMIN_USER, "password": ADMIN_PASSWORD, "displayName": "Head Office" }),
        );
        sc.login(ADMIN_USER, ADMIN_PASSWORD);
        (sc, workspace)
    }

    /// Registers another account as the signed-in admin.
    pub fn add_user(&mut self, username: &str, role: &str) {
        self.ok(
            "auth.register",
            json!({ "username": username, "password": ADMIN_PASSWORD, "role": role }),
        );
    }

    pub fn create_class(&mut self, name: &str, params: Value) -> String {
        let mut p = json!({ "name": name });
        if let (Some(obj), Some(extra)) = (p.as_object_mut(), params.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let r = self.ok("classes.create", p);
        r["classId"].as_str().expect("classId").to_string()
    }

    pub fn create_student(&mut self, class_id: &str, reg_no: &str, first: &str) -> String {
        let r = self.ok(
            "students.create",
            json!({ "classId": class_id, "regNo": reg_no, "firstName": first, "lastName": "Test" }),
        );
        r["studentId"].as_str().expect("studentId").to_string()
    }

    pub fn create_subject(&mut self, class_id: &str, name: &str, code: &str) -> String {
        let r = self.ok(
            "subjects.create",
            json!({ "classId": class_id, "name": name, "code": code }),
        );
        r["subjectId"].as_str().expect("subjectId").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
