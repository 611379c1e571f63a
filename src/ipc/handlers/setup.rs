use crate::calc::{GradeBand, GradingPolicy};
use crate::db;
use crate::ipc::helpers::{db_conn, respond, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::ledger::parse_amount;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
pub enum SetupSection {
    School,
    Attendance,
    Fees,
    Grading,
    Certificates,
}

impl SetupSection {
    const ALL: [SetupSection; 5] = [
        Self::School,
        Self::Attendance,
        Self::Fees,
        Self::Grading,
        Self::Certificates,
    ];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "attendance" => Some(Self::Attendance),
            "fees" => Some(Self::Fees),
            "grading" => Some(Self::Grading),
            "certificates" => Some(Self::Certificates),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Attendance => "attendance",
            Self::Fees => "fees",
            Self::Grading => "grading",
            Self::Certificates => "certificates",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Attendance => "setup.attendance",
            Self::Fees => "setup.fees",
            Self::Grading => "setup.grading",
            Self::Certificates => "setup.certificates",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "name": "",
            "address": "",
            "phone": "",
            "email": "",
            "academicYear": "",
            "currency": "USD"
        }),
        SetupSection::Attendance => json!({
            "requireCompleteRoster": false,
            "lateCountsAsPresent": true,
            "lowAttendanceThreshold": 75
        }),
        SetupSection::Fees => json!({
            "defaultFeeType": "tuition",
            "dueDayOfMonth": 10
        }),
        SetupSection::Grading => json!({
            "passPercent": 40,
            "bands": crate::calc::default_grade_bands(),
            "roundDecimals": 2
        }),
        SetupSection::Certificates => json!({
            "defaultFontSize": 32,
            "defaultColor": "#1a1a1a",
            "serialPrefix": "CERT"
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_bands(v: &Value) -> Result<Vec<GradeBand>, String> {
    let bands: Vec<GradeBand> = serde_json::from_value(v.clone())
        .map_err(|_| "bands must be an array of {min, grade}".to_string())?;
    if bands.is_empty() {
        return Err("bands must not be empty".into());
    }
    for b in &bands {
        if !(0.0..=100.0).contains(&b.min) {
            return Err("band min must be in 0..=100".into());
        }
        let g = b.grade.trim();
        if g.is_empty() || g.chars().count() > 8 {
            return Err("band grade must be 1..=8 characters".into());
        }
    }
    let mut sorted = bands;
    sorted.sort_by(|a, b| b.min.partial_cmp(&a.min).unwrap_or(std::cmp::Ordering::Equal));
    Ok(sorted)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "name" | "phone" | "email" | "academicYear" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "address" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 300)?));
                }
                "currency" => {
                    let c = parse_string_max(v, k, 3)?.to_ascii_uppercase();
                    if c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_alphabetic()) {
                        return Err("currency must be a 3-letter code".into());
                    }
                    obj.insert(k.clone(), Value::String(c));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "requireCompleteRoster" | "lateCountsAsPresent" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "lowAttendanceThreshold" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Fees => match k.as_str() {
                "defaultFeeType" => {
                    let t = parse_string_max(v, k, 16)?.to_ascii_lowercase();
                    if !super::fees::FEE_TYPES.contains(&t.as_str()) {
                        return Err(format!(
                            "defaultFeeType must be one of: {}",
                            super::fees::FEE_TYPES.join(", ")
                        ));
                    }
                    obj.insert(k.clone(), Value::String(t));
                }
                "dueDayOfMonth" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 28)?));
                }
                _ => return Err(format!("unknown fees field: {}", k)),
            },
            SetupSection::Grading => match k.as_str() {
                "passPercent" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "bands" => {
                    obj.insert(k.clone(), json!(parse_bands(v)?));
                }
                "roundDecimals" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 4)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Certificates => match k.as_str() {
                "defaultFontSize" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 4.0, 200.0)?));
                }
                "defaultColor" => {
                    let c = parse_string_max(v, k, 7)?;
                    if crate::certificate::parse_hex_color(&c).is_none() {
                        return Err("defaultColor must be #RRGGBB".into());
                    }
                    obj.insert(k.clone(), Value::String(c));
                }
                "serialPrefix" => {
                    let p = parse_string_max(v, k, 12)?.to_ascii_uppercase();
                    if p.is_empty() || !p.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                        return Err("serialPrefix must be 1..=12 letters or digits".into());
                    }
                    obj.insert(k.clone(), Value::String(p));
                }
                _ => return Err(format!("unknown certificates field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Stored values that no longer validate fall back to defaults.
            for (k, v) in saved_obj {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &single);
            }
        }
    }
    Ok(current)
}

pub struct AttendancePolicy {
    pub require_complete_roster: bool,
    pub late_counts_as_present: bool,
    pub low_attendance_threshold: f64,
}

pub fn attendance_policy(conn: &Connection) -> anyhow::Result<AttendancePolicy> {
    let s = load_section(conn, SetupSection::Attendance)?;
    Ok(AttendancePolicy {
        require_complete_roster: s["requireCompleteRoster"].as_bool().unwrap_or(false),
        late_counts_as_present: s["lateCountsAsPresent"].as_bool().unwrap_or(true),
        low_attendance_threshold: s["lowAttendanceThreshold"].as_f64().unwrap_or(75.0),
    })
}

pub fn grading_policy(conn: &Connection) -> anyhow::Result<GradingPolicy> {
    let s = load_section(conn, SetupSection::Grading)?;
    let defaults = GradingPolicy::default();
    Ok(GradingPolicy {
        pass_percent: s["passPercent"].as_f64().unwrap_or(defaults.pass_percent),
        bands: serde_json::from_value(s["bands"].clone()).unwrap_or(defaults.bands),
        round_decimals: s["roundDecimals"]
            .as_u64()
            .map(|v| v as u32)
            .unwrap_or(defaults.round_decimals),
    })
}

pub struct CertificateSettings {
    pub default_font_size: f64,
    pub default_color: String,
    pub serial_prefix: String,
}

pub fn certificate_settings(conn: &Connection) -> anyhow::Result<CertificateSettings> {
    let s = load_section(conn, SetupSection::Certificates)?;
    Ok(CertificateSettings {
        default_font_size: s["defaultFontSize"].as_f64().unwrap_or(32.0),
        default_color: s["defaultColor"].as_str().unwrap_or("#1a1a1a").to_string(),
        serial_prefix: s["serialPrefix"].as_str().unwrap_or("CERT").to_string(),
    })
}

pub struct FeeSettings {
    pub default_fee_type: String,
    pub due_day_of_month: u32,
}

pub fn fee_settings(conn: &Connection) -> anyhow::Result<FeeSettings> {
    let s = load_section(conn, SetupSection::Fees)?;
    Ok(FeeSettings {
        default_fee_type: s["defaultFeeType"]
            .as_str()
            .unwrap_or("tuition")
            .to_string(),
        due_day_of_month: s["dueDayOfMonth"].as_u64().unwrap_or(10) as u32,
    })
}

fn query_failed(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

fn setup_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    match req.params.get("section").and_then(|v| v.as_str()) {
        Some(raw) => {
            let section = SetupSection::parse(raw)
                .ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
            let value = load_section(conn, section).map_err(query_failed)?;
            Ok(json!({ section.name(): value }))
        }
        None => {
            let mut all = Map::new();
            for section in SetupSection::ALL {
                let value = load_section(conn, section).map_err(query_failed)?;
                all.insert(section.name().to_string(), value);
            }
            Ok(Value::Object(all))
        }
    }
}

fn setup_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let section_raw = req
        .params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing section"))?;
    let section =
        SetupSection::parse(section_raw).ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch = req
        .params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;

    let mut current = load_section(conn, section).map_err(query_failed)?;
    merge_section_patch(section, &mut current, patch).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::db("db_update_failed", "settings", e))?;
    tracing::info!(section = section.name(), "setup section updated");
    Ok(json!({ section.name(): current }))
}

/// Validates a `monthlyFee`-style amount param shared by classes and fees.
pub fn opt_amount_cents(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_amount(v)
            .map(Some)
            .map_err(|e| HandlerErr::bad_params(format!("{}: {}", key, e))),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(respond(req, setup_get(state, req))),
        "setup.update" => Some(respond(req, setup_update(state, req))),
        _ => None,
    }
}
