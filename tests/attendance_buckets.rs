mod common;

use common::Sidecar;
use serde_json::{json, Value};

fn roster(prefix: &str) -> (Sidecar, String, Vec<String>) {
    let (mut sc, _ws) = Sidecar::with_admin(prefix);
    let class_id = sc.create_class("Grade 2", json!({}));
    let ids = ["A-1", "A-2", "A-3", "A-4"]
        .iter()
        .enumerate()
        .map(|(i, reg)| sc.create_student(&class_id, reg, &format!("Kid{}", i)))
        .collect();
    (sc, class_id, ids)
}

fn rule_of(resp: &Value) -> Option<&str> {
    resp.pointer("/error/details/rule").and_then(|v| v.as_str())
}

#[test]
fn record_stores_buckets_and_counts() {
    let (mut sc, class_id, s) = roster("schoold-att-record");
    let r = sc.ok(
        "attendance.record",
        json!({
            "classId": class_id,
            "date": "2026-03-02",
            "presentStudents": [s[0], s[1]],
            "absentStudents": [s[2]],
            "lateStudents": [s[3]],
            "totalStudents": 4,
            "remarks": "rainy day"
        }),
    );
    assert_eq!(r["created"].as_bool(), Some(true));
    let att = &r["attendance"];
    assert_eq!(att["presentCount"].as_i64(), Some(2));
    assert_eq!(att["absentCount"].as_i64(), Some(1));
    assert_eq!(att["lateCount"].as_i64(), Some(1));
    assert_eq!(att["totalStudents"].as_i64(), Some(4));
    // Late counts as present by default.
    assert_eq!(att["attendanceRate"].as_f64(), Some(75.0));
    assert_eq!(att["lateStudents"], json!([s[3]]));

    let again = sc.ok(
        "attendance.record",
        json!({
            "classId": class_id,
            "date": "2026-03-02",
            "presentStudents": [s[0], s[1], s[2], s[3]]
        }),
    );
    assert_eq!(again["created"].as_bool(), Some(false));
    assert_eq!(again["attendance"]["id"], att["id"]);
    assert_eq!(
        sc.ok("attendance.list", json!({ "classId": class_id }))["records"]
            .as_array()
            .map(|a| a.len()),
        Some(1)
    );
}

#[test]
fn inconsistent_sheets_are_rejected_by_rule() {
    let (mut sc, class_id, s) = roster("schoold-att-rules");
    let base = |present: Value, absent: Value, total: Option<i64>| {
        let mut v = json!({
            "classId": class_id,
            "date": "2026-03-03",
            "presentStudents": present,
            "absentStudents": absent,
        });
        if let Some(t) = total {
            v["totalStudents"] = json!(t);
        }
        v
    };

    let empty = sc.call("attendance.record", base(json!([]), json!([]), None));
    assert_eq!(empty["error"]["code"].as_str(), Some("validation_failed"));
    assert_eq!(rule_of(&empty), Some("non_empty"));

    let twice = sc.call(
        "attendance.record",
        base(json!([s[0]]), json!([s[0]]), None),
    );
    assert_eq!(rule_of(&twice), Some("single_bucket"));

    let mismatch = sc.call(
        "attendance.record",
        base(json!([s[0], s[1]]), json!([]), Some(3)),
    );
    assert_eq!(rule_of(&mismatch), Some("total_reconciles"));
    assert_eq!(mismatch["error"]["details"]["counted"].as_i64(), Some(2));

    let stranger = sc.call(
        "attendance.record",
        base(json!([s[0], "not-a-student"]), json!([]), None),
    );
    assert_eq!(rule_of(&stranger), Some("enrolled"));

    assert_eq!(
        sc.ok("attendance.list", json!({ "classId": class_id }))["records"]
            .as_array()
            .map(|a| a.len()),
        Some(0)
    );
}

#[test]
fn complete_roster_policy_requires_every_active_student() {
    let (mut sc, class_id, s) = roster("schoold-att-complete");
    sc.ok(
        "setup.update",
        json!({ "section": "attendance", "patch": { "requireCompleteRoster": true } }),
    );
    let partial = sc.call(
        "attendance.record",
        json!({ "classId": class_id, "date": "2026-03-04", "presentStudents": [s[0], s[1], s[2]] }),
    );
    assert_eq!(rule_of(&partial), Some("complete_roster"));
    assert_eq!(partial["error"]["details"]["studentIds"], json!([s[3]]));

    sc.ok(
        "attendance.record",
        json!({
            "classId": class_id, "date": "2026-03-04",
            "presentStudents": [s[0], s[1], s[2]], "absentStudents": [s[3]]
        }),
    );
}

#[test]
fn set_student_status_moves_between_buckets() {
    let (mut sc, class_id, s) = roster("schoold-att-status");
    let first = sc.ok(
        "attendance.setStudentStatus",
        json!({ "classId": class_id, "date": "2026-03-05", "studentId": s[0], "status": "present" }),
    );
    assert!(first["previousStatus"].is_null());
    assert_eq!(first["attendance"]["presentCount"].as_i64(), Some(1));

    let moved = sc.ok(
        "attendance.setStudentStatus",
        json!({ "classId": class_id, "date": "2026-03-05", "studentId": s[0], "status": "late" }),
    );
    assert_eq!(moved["previousStatus"].as_str(), Some("present"));
    assert_eq!(moved["attendance"]["presentCount"].as_i64(), Some(0));
    assert_eq!(moved["attendance"]["lateCount"].as_i64(), Some(1));

    assert_eq!(
        sc.err_code(
            "attendance.setStudentStatus",
            json!({ "classId": class_id, "date": "2026-03-05", "studentId": s[1], "status": "sick" })
        ),
        "bad_params"
    );

    let cleared = sc.ok(
        "attendance.setStudentStatus",
        json!({ "classId": class_id, "date": "2026-03-05", "studentId": s[0], "status": null }),
    );
    assert!(cleared["attendance"].is_null());
    assert_eq!(
        sc.err_code(
            "attendance.get",
            json!({ "classId": class_id, "date": "2026-03-05" })
        ),
        "not_found"
    );
}

#[test]
fn deleting_a_student_recounts_their_records() {
    let (mut sc, class_id, s) = roster("schoold-att-recount");
    sc.ok(
        "attendance.record",
        json!({
            "classId": class_id, "date": "2026-03-06",
            "presentStudents": [s[0], s[1]], "absentStudents": [s[2]], "totalStudents": 3
        }),
    );
    sc.ok("students.delete", json!({ "studentId": s[2] }));
    let rec = sc.ok(
        "attendance.get",
        json!({ "classId": class_id, "date": "2026-03-06" }),
    );
    assert_eq!(rec["attendance"]["absentCount"].as_i64(), Some(0));
    assert_eq!(rec["attendance"]["totalStudents"].as_i64(), Some(2));
}

#[test]
fn reports_summarise_per_student_and_class() {
    let (mut sc, class_id, s) = roster("schoold-att-reports");
    sc.ok(
        "setup.update",
        json!({ "section": "attendance", "patch": { "lateCountsAsPresent": false } }),
    );
    for (date, absent) in [("2026-03-09", true), ("2026-03-10", false)] {
        let (present, away): (Vec<&String>, Vec<&String>) = if absent {
            (vec![&s[1]], vec![&s[0]])
        } else {
            (vec![&s[0], &s[1]], vec![])
        };
        sc.ok(
            "attendance.record",
            json!({
                "classId": class_id, "date": date,
                "presentStudents": present, "absentStudents": away, "lateStudents": [s[2]]
            }),
        );
    }

    let student = sc.ok("attendance.studentReport", json!({ "studentId": s[0] }));
    assert_eq!(student["summary"]["total"].as_i64(), Some(2));
    assert_eq!(student["summary"]["percentage"].as_f64(), Some(50.0));
    assert_eq!(student["belowThreshold"].as_bool(), Some(true));

    let late = sc.ok("attendance.studentReport", json!({ "studentId": s[2] }));
    assert_eq!(late["summary"]["late"].as_i64(), Some(2));
    assert_eq!(late["summary"]["percentage"].as_f64(), Some(0.0));

    let class = sc.ok(
        "attendance.classReport",
        json!({ "classId": class_id, "from": "2026-03-01", "to": "2026-03-31" }),
    );
    assert_eq!(class["days"].as_i64(), Some(2));
    assert_eq!(class["students"].as_array().map(|a| a.len()), Some(4));
    assert_eq!(class["daily"][0]["date"].as_str(), Some("2026-03-09"));

    assert_eq!(
        sc.err_code(
            "attendance.classReport",
            json!({ "classId": class_id, "from": "2026-04-01", "to": "2026-03-01" })
        ),
        "bad_params"
    );
}

#[test]
fn deleting_a_record_drops_it_from_reports() {
    let (mut sc, class_id, s) = roster("schoold-att-delete");
    let first = sc.ok(
        "attendance.record",
        json!({
            "classId": class_id, "date": "2026-04-06",
            "presentStudents": [s[1], s[2], s[3]], "absentStudents": [s[0]]
        }),
    );
    sc.ok(
        "attendance.record",
        json!({
            "classId": class_id, "date": "2026-04-07",
            "presentStudents": [s[0], s[1], s[2], s[3]]
        }),
    );
    let first_id = first["attendance"]["id"].as_str().unwrap_or("").to_string();

    let before = sc.ok("attendance.studentReport", json!({ "studentId": s[0] }));
    assert_eq!(before["summary"]["absent"].as_i64(), Some(1));

    sc.ok("attendance.delete", json!({ "attendanceId": first_id }));
    assert_eq!(
        sc.err_code("attendance.get", json!({ "attendanceId": first_id })),
        "not_found"
    );
    assert_eq!(
        sc.err_code(
            "attendance.get",
            json!({ "classId": class_id, "date": "2026-04-06" })
        ),
        "not_found"
    );
    assert_eq!(
        sc.err_code("attendance.delete", json!({ "attendanceId": first_id })),
        "not_found"
    );

    let listed = sc.ok("attendance.list", json!({ "classId": class_id }));
    assert_eq!(listed["records"].as_array().map(|a| a.len()), Some(1));

    let class = sc.ok("attendance.classReport", json!({ "classId": class_id }));
    assert_eq!(class["days"].as_i64(), Some(1));
    assert_eq!(class["daily"][0]["date"].as_str(), Some("2026-04-07"));
    let absentee = class["students"]
        .as_array()
        .and_then(|a| {
            a.iter()
                .find(|r| r["studentId"].as_str() == Some(s[0].as_str()))
                .cloned()
        })
        .unwrap_or(Value::Null);
    assert_eq!(absentee["absent"].as_i64(), Some(0));
    assert_eq!(absentee["percentage"].as_f64(), Some(100.0));

    // The same day can be recorded again afterwards.
    let redo = sc.ok(
        "attendance.record",
        json!({ "classId": class_id, "date": "2026-04-06", "presentStudents": [s[0]] }),
    );
    assert_eq!(redo["created"].as_bool(), Some(true));
}
