mod common;

use common::Sidecar;
use serde_json::{json, Value};
use std::path::Path;

/// Smallest header `jpeg_info` accepts: SOI, SOF0 (200x100, 3 components), EOI.
const TINY_JPEG: [u8; 23] = [
    0xFF, 0xD8, 0xFF, 0xC0, 0x00, 0x11, 0x08, 0x00, 0x64, 0x00, 0xC8, 0x03, 0x01, 0x22, 0x00,
    0x02, 0x11, 0x01, 0x03, 0x11, 0x01, 0xFF, 0xD9,
];

fn name_fields() -> Value {
    json!([
        { "source": "studentName", "xPercent": 50, "yPercent": 50 },
        { "source": "serial", "xPercent": 90, "yPercent": 95, "fontSize": 10, "align": "right" },
        { "source": "className", "xPercent": 50, "yPercent": 60, "color": "#003366" }
    ])
}

fn create_template(sc: &mut Sidecar, extra: Value) -> String {
    let mut params = json!({ "name": "Merit", "fields": name_fields() });
    if let (Some(obj), Some(more)) = (params.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            obj.insert(k.clone(), v.clone());
        }
    }
    sc.ok("certificates.templates.create", params)["templateId"]
        .as_str()
        .unwrap_or("")
        .to_string()
}

#[test]
fn templates_validate_their_fields() {
    let (mut sc, _ws) = Sidecar::with_admin("schoold-cert-validate");
    let missing_name = sc.call(
        "certificates.templates.create",
        json!({ "name": "Blank", "fields": [{ "source": "serial", "xPercent": 10, "yPercent": 10 }] }),
    );
    assert_eq!(missing_name["error"]["code"].as_str(), Some("validation_failed"));

    let off_page = sc.err_code(
        "certificates.templates.create",
        json!({ "name": "Off", "fields": [{ "source": "studentName", "xPercent": 120, "yPercent": 10 }] }),
    );
    assert_eq!(off_page, "validation_failed");

    let unknown_source = sc.err_code(
        "certificates.templates.create",
        json!({ "name": "Odd", "fields": [{ "source": "shoeSize", "xPercent": 1, "yPercent": 1 }] }),
    );
    assert_eq!(unknown_source, "bad_params");

    let id = create_template(&mut sc, json!({ "orientation": "portrait" }));
    let t = sc.ok("certificates.templates.get", json!({ "templateId": id }));
    assert_eq!(t["template"]["orientation"].as_str(), Some("portrait"));
    assert_eq!(t["template"]["fields"][1]["align"].as_str(), Some("right"));

    let renamed = sc.ok(
        "certificates.templates.update",
        json!({ "templateId": id, "name": "Honour Roll" }),
    );
    assert_eq!(renamed["template"]["name"].as_str(), Some("Honour Roll"));
    assert_eq!(renamed["template"]["fields"].as_array().map(|a| a.len()), Some(3));

    sc.ok("certificates.templates.delete", json!({ "templateId": id }));
    assert_eq!(
        sc.err_code("certificates.templates.get", json!({ "templateId": id })),
        "not_found"
    );
}

#[test]
fn template_images_must_be_readable_jpegs() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-cert-image");
    let png = ws.join("bg.png");
    std::fs::write(&png, b"\x89PNG\r\n\x1a\nnot really").expect("write png");
    assert_eq!(
        sc.err_code(
            "certificates.templates.create",
            json!({ "name": "Png", "fields": name_fields(), "imagePath": png.to_string_lossy() })
        ),
        "validation_failed"
    );
    assert_eq!(
        sc.err_code(
            "certificates.templates.create",
            json!({
                "name": "Missing", "fields": name_fields(),
                "imagePath": ws.join("nope.jpg").to_string_lossy()
            })
        ),
        "bad_params"
    );
}

#[test]
fn preview_places_text_on_the_image_page() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-cert-preview");
    let jpg = ws.join("bg.jpg");
    std::fs::write(&jpg, TINY_JPEG).expect("write jpeg");
    let id = create_template(&mut sc, json!({ "imagePath": jpg.to_string_lossy() }));

    let p = sc.ok(
        "certificates.preview",
        json!({ "templateId": id, "recipientName": "Layla Hassan", "issueDate": "2026-06-30" }),
    );
    assert_eq!(p["page"]["width"].as_f64(), Some(842.0));
    assert_eq!(p["page"]["height"].as_f64(), Some(421.0));

    // No className given, so only the name and serial are placed.
    let placements = p["placements"].as_array().cloned().unwrap_or_default();
    assert_eq!(placements.len(), 2);
    assert_eq!(placements[0]["text"].as_str(), Some("Layla Hassan"));
    assert_eq!(placements[0]["fontSize"].as_f64(), Some(32.0));
    assert_eq!(placements[0]["y"].as_f64(), Some(199.3));
    let width = placements[0]["width"].as_f64().unwrap_or(0.0);
    let x = placements[0]["x"].as_f64().unwrap_or(0.0);
    assert!((x + width / 2.0 - 421.0).abs() < 0.02);
    assert_eq!(placements[1]["text"].as_str(), Some("CERT-2026-00001"));

    // Previewing does not consume a serial.
    let again = sc.ok(
        "certificates.preview",
        json!({ "templateId": id, "recipientName": "Someone Else", "issueDate": "2026-07-01" }),
    );
    assert_eq!(again["placements"][1]["text"].as_str(), Some("CERT-2026-00001"));
}

#[test]
fn generate_writes_a_pdf_and_numbers_serials() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-cert-generate");
    let class_id = sc.create_class("Grade 12", json!({ "section": "Science" }));
    let student = sc.create_student(&class_id, "G-1", "Samir");
    let id = create_template(&mut sc, json!({}));

    assert_eq!(
        sc.err_code(
            "certificates.generate",
            json!({ "templateId": id, "outPath": ws.join("x.pdf").to_string_lossy() })
        ),
        "bad_params"
    );

    let first_out = ws.join("out").join("first.pdf");
    let first = sc.ok(
        "certificates.generate",
        json!({
            "templateId": id, "studentId": student, "issueDate": "2026-06-30",
            "outPath": first_out.to_string_lossy(), "title": "Merit Certificate"
        }),
    );
    assert_eq!(first["serial"].as_str(), Some("CERT-2026-00001"));
    assert_eq!(first["page"]["width"].as_f64(), Some(842.0));
    assert_eq!(first["page"]["height"].as_f64(), Some(595.0));
    let texts: Vec<&str> = first["placements"]
        .as_array()
        .map(|a| a.iter().filter_map(|p| p["text"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(texts, vec!["Samir Test", "CERT-2026-00001", "Grade 12 - Science"]);

    let bytes = std::fs::read(&first_out).expect("read pdf");
    assert!(bytes.starts_with(b"%PDF-1.4"));
    assert_eq!(first["bytes"].as_u64(), Some(bytes.len() as u64));
    assert!(contains(&bytes, b"%%EOF"));

    sc.ok(
        "setup.update",
        json!({ "section": "certificates", "patch": { "serialPrefix": "AWD" } }),
    );
    let second = sc.ok(
        "certificates.generate",
        json!({
            "templateId": id, "recipientName": "Guest Speaker", "issueDate": "2026-09-01",
            "outPath": ws.join("second.pdf").to_string_lossy()
        }),
    );
    assert_eq!(second["serial"].as_str(), Some("AWD-2026-00001"));
    let third = sc.ok(
        "certificates.generate",
        json!({
            "templateId": id, "recipientName": "Guest Two", "issueDate": "2026-09-02",
            "outPath": ws.join("third.pdf").to_string_lossy()
        }),
    );
    assert_eq!(third["serial"].as_str(), Some("AWD-2026-00002"));

    let all = sc.ok("certificates.issued.list", json!({}));
    assert_eq!(all["certificates"].as_array().map(|a| a.len()), Some(3));
    let mine = sc.ok("certificates.issued.list", json!({ "studentId": student }));
    let mine = mine["certificates"].as_array().cloned().unwrap_or_default();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0]["templateName"].as_str(), Some("Merit"));
    assert_eq!(mine[0]["title"].as_str(), Some("Merit Certificate"));
    assert!(Path::new(mine[0]["outPath"].as_str().unwrap_or("")).is_file());
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn failed_write_records_nothing_and_keeps_the_serial() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-cert-write-fail");
    let id = create_template(&mut sc, json!({}));
    let blocker = ws.join("blocker");
    std::fs::write(&blocker, b"a file, not a directory").expect("write blocker");

    assert_eq!(
        sc.err_code(
            "certificates.generate",
            json!({
                "templateId": id, "recipientName": "Nadia", "issueDate": "2026-03-01",
                "outPath": blocker.join("cert.pdf").to_string_lossy()
            })
        ),
        "export_failed"
    );
    let issued = sc.ok("certificates.issued.list", json!({}));
    assert_eq!(issued["certificates"].as_array().map(|a| a.len()), Some(0));

    let ok = sc.ok(
        "certificates.generate",
        json!({
            "templateId": id, "recipientName": "Nadia", "issueDate": "2026-03-01",
            "outPath": ws.join("cert.pdf").to_string_lossy()
        }),
    );
    assert_eq!(ok["serial"].as_str(), Some("CERT-2026-00001"));
}

#[test]
fn corrupt_stored_fields_surface_as_errors() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-cert-corrupt");
    let id = create_template(&mut sc, json!({}));
    {
        let conn = rusqlite::Connection::open(ws.join("school.sqlite3")).expect("open db");
        conn.execute(
            "UPDATE certificate_templates SET fields_json = 'not json' WHERE id = ?",
            [&id],
        )
        .expect("corrupt fields");
    }

    assert_eq!(
        sc.err_code("certificates.templates.get", json!({ "templateId": id })),
        "db_query_failed"
    );
    assert_eq!(
        sc.err_code(
            "certificates.generate",
            json!({
                "templateId": id, "recipientName": "Nadia",
                "outPath": ws.join("never.pdf").to_string_lossy()
            })
        ),
        "db_query_failed"
    );
    assert!(!ws.join("never.pdf").exists());
}
