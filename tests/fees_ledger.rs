mod common;

use common::Sidecar;
use serde_json::json;

fn setup_class(sc: &mut Sidecar, fee: f64) -> (String, String, String) {
    let class_id = sc.create_class("Grade 10", json!({ "monthlyFee": fee }));
    let a = sc.create_student(&class_id, "FL-1", "Aisha");
    let b = sc.create_student(&class_id, "FL-2", "Bilal");
    (class_id, a, b)
}

#[test]
fn monthly_generation_skips_students_already_charged() {
    let (mut sc, _ws) = Sidecar::with_admin("schoold-fees-generate");
    let (class_id, _a, _b) = setup_class(&mut sc, 120.0);

    let first = sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-02" }),
    );
    assert_eq!(first["created"].as_i64(), Some(2));
    assert_eq!(first["skipped"].as_i64(), Some(0));
    assert_eq!(first["dueDate"].as_str(), Some("2026-02-10"));
    assert_eq!(first["amount"].as_f64(), Some(120.0));

    let again = sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-02" }),
    );
    assert_eq!(again["created"].as_i64(), Some(0));
    assert_eq!(again["skipped"].as_i64(), Some(2));

    let no_fee = sc.create_class("Free Class", json!({}));
    assert_eq!(
        sc.err_code(
            "fees.generateMonthly",
            json!({ "classId": no_fee, "month": "2026-02" })
        ),
        "conflict"
    );
    assert_eq!(
        sc.err_code(
            "fees.generateMonthly",
            json!({ "classId": class_id, "month": "2026-13" })
        ),
        "bad_params"
    );
}

#[test]
fn due_day_setting_drives_generated_due_date() {
    let (mut sc, _ws) = Sidecar::with_admin("schoold-fees-dueday");
    let (class_id, _a, _b) = setup_class(&mut sc, 10.0);
    assert_eq!(
        sc.err_code(
            "setup.update",
            json!({ "section": "fees", "patch": { "dueDayOfMonth": 31 } })
        ),
        "bad_params"
    );
    sc.ok(
        "setup.update",
        json!({ "section": "fees", "patch": { "dueDayOfMonth": 28 } }),
    );
    let r = sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-02" }),
    );
    assert_eq!(r["dueDate"].as_str(), Some("2026-02-28"));
}

#[test]
fn ledger_tracks_running_balance_and_month_status() {
    let (mut sc, _ws) = Sidecar::with_admin("schoold-fees-ledger");
    let (class_id, a, _b) = setup_class(&mut sc, 100.0);
    sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-01", "dueDate": "2026-01-05" }),
    );
    sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-02", "dueDate": "2026-02-05" }),
    );
    sc.ok(
        "fees.create",
        json!({
            "studentId": a, "kind": "payment", "amount": 100, "month": "2026-01",
            "date": "2026-01-06", "method": "cash"
        }),
    );
    sc.ok(
        "fees.create",
        json!({
            "studentId": a, "kind": "payment", "amount": "40.50", "month": "2026-02",
            "date": "2026-02-06", "method": "bank", "reference": "TX-9"
        }),
    );

    let ledger = sc.ok("fees.ledger", json!({ "studentId": a }));
    let entries = ledger["entries"].as_array().cloned().unwrap_or_default();
    assert_eq!(entries.len(), 4);
    let running: Vec<f64> = entries
        .iter()
        .filter_map(|e| e["runningBalance"].as_f64())
        .collect();
    assert_eq!(running, vec![100.0, 0.0, 100.0, 59.5]);
    assert_eq!(ledger["balance"].as_f64(), Some(59.5));
    assert_eq!(ledger["totals"]["paidCents"].as_i64(), Some(14_050));

    let months = ledger["months"].as_array().cloned().unwrap_or_default();
    assert_eq!(months[0]["month"].as_str(), Some("2026-01"));
    assert_eq!(months[0]["status"].as_str(), Some("paid"));
    assert_eq!(months[1]["status"].as_str(), Some("partial"));
}

#[test]
fn fee_entries_are_validated() {
    let (mut sc, _ws) = Sidecar::with_admin("schoold-fees-validate");
    let (_class_id, a, _b) = setup_class(&mut sc, 50.0);
    assert_eq!(
        sc.err_code(
            "fees.create",
            json!({ "studentId": a, "kind": "payment", "amount": 10 })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "fees.create",
            json!({ "studentId": a, "kind": "charge", "amount": 0 })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "fees.create",
            json!({ "studentId": a, "kind": "refund", "amount": 5 })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "fees.create",
            json!({ "studentId": a, "kind": "charge", "amount": 5, "feeType": "parking" })
        ),
        "bad_params"
    );

    let created = sc.ok(
        "fees.create",
        json!({ "studentId": a, "kind": "charge", "amount": 5, "feeType": "Library" }),
    );
    assert_eq!(created["fee"]["feeType"].as_str(), Some("library"));
    let fee_id = created["feeId"].as_str().unwrap_or("").to_string();
    let updated = sc.ok("fees.update", json!({ "feeId": fee_id, "amount": 7.25 }));
    assert_eq!(updated["fee"]["amountCents"].as_i64(), Some(725));
    sc.ok("fees.delete", json!({ "feeId": fee_id }));
    assert_eq!(sc.err_code("fees.delete", json!({ "feeId": fee_id })), "not_found");
}

#[test]
fn summary_and_defaulters_agree() {
    let (mut sc, _ws) = Sidecar::with_admin("schoold-fees-summary");
    let (class_id, a, b) = setup_class(&mut sc, 80.0);
    sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-03" }),
    );
    sc.ok(
        "fees.create",
        json!({ "studentId": a, "kind": "payment", "amount": 80, "month": "2026-03", "method": "card" }),
    );
    sc.ok(
        "fees.create",
        json!({ "studentId": b, "kind": "waiver", "amount": 30, "month": "2026-03" }),
    );

    let summary = sc.ok("fees.summary", json!({ "month": "2026-03" }));
    assert_eq!(summary["totals"]["charged"].as_f64(), Some(160.0));
    assert_eq!(summary["totals"]["collected"].as_f64(), Some(80.0));
    assert_eq!(summary["totals"]["waived"].as_f64(), Some(30.0));
    assert_eq!(summary["totals"]["outstanding"].as_f64(), Some(50.0));
    assert_eq!(summary["byClass"].as_array().map(|a| a.len()), Some(1));

    let defaulters = sc.ok("fees.defaulters", json!({}));
    let list = defaulters["defaulters"].as_array().cloned().unwrap_or_default();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["studentId"].as_str(), Some(b.as_str()));
    assert_eq!(defaulters["totalOutstanding"].as_f64(), Some(50.0));

    let strict = sc.ok("fees.defaulters", json!({ "minBalance": 50 }));
    assert_eq!(strict["defaulters"].as_array().map(|a| a.len()), Some(0));
}

#[test]
fn orphans_can_be_listed_and_purged() {
    let (mut sc, _ws) = Sidecar::with_admin("schoold-fees-orphans");
    let (class_id, a, _b) = setup_class(&mut sc, 25.0);
    sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-04" }),
    );
    sc.ok("students.delete", json!({ "studentId": a }));

    let orphans = sc.ok("fees.orphans.list", json!({}));
    assert_eq!(orphans["count"].as_i64(), Some(1));
    assert_eq!(orphans["totalAmount"].as_f64(), Some(25.0));

    let dry = sc.ok("fees.orphans.purge", json!({ "dryRun": true }));
    assert_eq!(dry["deleted"].as_i64(), Some(0));
    assert_eq!(dry["count"].as_i64(), Some(1));

    let purged = sc.ok("fees.orphans.purge", json!({}));
    assert_eq!(purged["deleted"].as_i64(), Some(1));
    assert_eq!(sc.ok("fees.orphans.list", json!({}))["count"].as_i64(), Some(0));
    assert_eq!(
        sc.ok("fees.list", json!({}))["fees"].as_array().map(|a| a.len()),
        Some(1)
    );
}

#[test]
fn csv_export_writes_header_and_rows() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-fees-csv");
    let (class_id, a, _b) = setup_class(&mut sc, 60.0);
    sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-05" }),
    );
    sc.ok(
        "fees.create",
        json!({
            "studentId": a, "kind": "payment", "amount": 60, "month": "2026-05",
            "method": "cash", "note": "paid, in full"
        }),
    );

    let out = ws.join("exports").join("fees.csv");
    let r = sc.ok(
        "fees.exportCsv",
        json!({ "outPath": out.to_string_lossy(), "studentId": a }),
    );
    assert_eq!(r["rows"].as_i64(), Some(2));
    let text = std::fs::read_to_string(&out).expect("read csv");
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("date,regNo,className,feeType,kind,amount,month,method,reference,note")
    );
    assert!(text.contains("\"paid, in full\""));
    assert!(text.contains("60.00"));
}

#[test]
fn unknown_stored_kind_is_reported_not_counted() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-fees-bad-kind");
    let (class_id, a, _b) = setup_class(&mut sc, 75.0);
    sc.ok(
        "fees.generateMonthly",
        json!({ "classId": class_id, "month": "2026-05" }),
    );
    {
        let conn = rusqlite::Connection::open(ws.join("school.sqlite3")).expect("open db");
        conn.execute(
            "UPDATE fee_records SET kind = 'refund' WHERE student_id = ?",
            [&a],
        )
        .expect("corrupt kind");
    }

    assert_eq!(
        sc.err_code("fees.list", json!({ "studentId": a })),
        "db_query_failed"
    );
    assert_eq!(
        sc.err_code("fees.summary", json!({ "month": "2026-05" })),
        "db_query_failed"
    );
}
