#[path = "../src/backup.rs"]
mod backup;
mod common;

use common::{temp_dir, Sidecar};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

const SCHEMA_VERSION: i64 = 1;

/// Writes a real SQLite file holding `notes(body)` with one row.
fn sqlite_file(path: &Path, body: &str, user_version: i64) -> Vec<u8> {
    {
        let conn = rusqlite::Connection::open(path).expect("open sqlite");
        conn.execute_batch(&format!(
            "CREATE TABLE notes(body TEXT NOT NULL); PRAGMA user_version = {};",
            user_version
        ))
        .expect("create notes");
        conn.execute("INSERT INTO notes(body) VALUES(?)", [body])
            .expect("insert note");
    }
    std::fs::read(path).expect("read sqlite bytes")
}

fn note_in(path: &Path) -> String {
    let conn = rusqlite::Connection::open(path).expect("open restored db");
    conn.query_row("SELECT body FROM notes", [], |r| r.get(0))
        .expect("read note")
}

#[test]
fn bundle_export_and_import_roundtrip() {
    let workspace = temp_dir("schoold-backup-src");
    let restored_ws = temp_dir("schoold-backup-dst");
    let out_dir = temp_dir("schoold-backup-out");

    let bytes = sqlite_file(&workspace.join("school.sqlite3"), "roundtrip", SCHEMA_VERSION);

    let bundle_path = out_dir.join("nested").join("workspace.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_bytes, bytes.len() as u64);

    let manifest = backup::read_manifest(&bundle_path).expect("read manifest");
    assert_eq!(manifest.format, backup::BUNDLE_FORMAT);
    assert_eq!(manifest.db_sha256.as_deref().map(str::len), Some(64));

    let mut archive = zip::ZipArchive::new(File::open(&bundle_path).expect("open bundle"))
        .expect("open zip archive");
    let mut meta = String::new();
    archive
        .by_name("meta/workspace.json")
        .expect("workspace meta entry")
        .read_to_string(&mut meta)
        .expect("read meta");
    assert!(meta.contains("school.sqlite3"));

    // Stale sidecar files from a previous database must not survive the restore.
    std::fs::write(restored_ws.join("school.sqlite3-wal"), b"stale").expect("write wal");
    let import =
        backup::import_workspace_bundle(&bundle_path, &restored_ws, SCHEMA_VERSION)
            .expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT);
    assert_eq!(import.exported_at.as_deref(), Some(manifest.exported_at.as_str()));
    assert_eq!(
        std::fs::read(restored_ws.join("school.sqlite3")).expect("read restored db"),
        bytes
    );
    assert_eq!(note_in(&restored_ws.join("school.sqlite3")), "roundtrip");
    assert!(!restored_ws.join("school.sqlite3-wal").exists());
    assert!(!restored_ws.join("school.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(restored_ws);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn raw_sqlite_files_import_as_legacy() {
    let out_dir = temp_dir("schoold-backup-legacy");
    let workspace = temp_dir("schoold-backup-legacy-dst");

    let legacy_file = out_dir.join("copy.sqlite3");
    let bytes = sqlite_file(&legacy_file, "legacy", 0);

    let import = backup::import_workspace_bundle(&legacy_file, &workspace, SCHEMA_VERSION)
        .expect("import legacy sqlite");
    assert_eq!(import.bundle_format_detected, backup::LEGACY_FORMAT);
    assert!(import.exported_at.is_none());
    assert_eq!(
        std::fs::read(workspace.join("school.sqlite3")).expect("read restored sqlite"),
        bytes
    );

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_sqlite_input_is_rejected_and_leaves_workspace_alone() {
    let out_dir = temp_dir("schoold-backup-junk");
    let workspace = temp_dir("schoold-backup-junk-dst");
    let existing = sqlite_file(&workspace.join("school.sqlite3"), "keep-me", SCHEMA_VERSION);

    let junk = out_dir.join("notes.txt");
    std::fs::write(&junk, b"definitely not a database").expect("write junk");
    let err = backup::import_workspace_bundle(&junk, &workspace, SCHEMA_VERSION)
        .expect_err("junk rejected");
    assert!(format!("{:#}", err).contains("not a SQLite database"));

    // Right magic, unreadable body.
    let mut truncated = b"SQLite format 3\0".to_vec();
    truncated.extend_from_slice(&[0u8; 40]);
    let broken = out_dir.join("broken.sqlite3");
    std::fs::write(&broken, &truncated).expect("write broken db");
    assert!(backup::import_workspace_bundle(&broken, &workspace, SCHEMA_VERSION).is_err());

    assert_eq!(
        std::fs::read(workspace.join("school.sqlite3")).expect("read existing db"),
        existing
    );
    assert!(!workspace.join("school.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tampered_bundle_fails_checksum() {
    let out_dir = temp_dir("schoold-backup-tamper");
    let workspace = temp_dir("schoold-backup-tamper-dst");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let mut zip = zip::ZipWriter::new(File::create(&bundle_path).expect("create bundle"));
        let opts = zip::write::FileOptions::default();
        let manifest = json!({
            "format": backup::BUNDLE_FORMAT,
            "version": 1,
            "appVersion": "0.0.0",
            "exportedAt": "2026-01-01T00:00:00Z",
            "dbSha256": "00".repeat(32)
        });
        zip.start_file("manifest.json", opts).expect("start manifest");
        zip.write_all(manifest.to_string().as_bytes())
            .expect("write manifest");
        zip.start_file("db/school.sqlite3", opts).expect("start db");
        let edited = sqlite_file(&out_dir.join("edited.sqlite3"), "edited", SCHEMA_VERSION);
        zip.write_all(&edited).expect("write db");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace, SCHEMA_VERSION)
        .expect_err("rejected");
    assert!(format!("{:#}", err).contains("checksum mismatch"));
    assert!(!workspace.join("school.sqlite3").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn newer_schema_is_refused_without_touching_the_workspace() {
    let out_dir = temp_dir("schoold-backup-newer");
    let workspace = temp_dir("schoold-backup-newer-dst");
    let existing = sqlite_file(&workspace.join("school.sqlite3"), "keep-me", SCHEMA_VERSION);

    let future = out_dir.join("future.sqlite3");
    sqlite_file(&future, "from the future", 99);
    let err = backup::import_workspace_bundle(&future, &workspace, SCHEMA_VERSION)
        .expect_err("newer schema rejected");
    assert!(format!("{:#}", err).contains("schema version 99"));

    let restored = workspace.join("school.sqlite3");
    assert_eq!(std::fs::read(&restored).expect("read existing db"), existing);
    assert_eq!(note_in(&restored), "keep-me");
    assert!(!workspace.join("school.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn ipc_import_of_newer_schema_keeps_the_open_workspace() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-backup-ipc-newer");
    sc.create_class("Grade 3", json!({}));

    let future = ws.join("future.sqlite3");
    sqlite_file(&future, "from the future", 99);
    assert_eq!(
        sc.err_code(
            "backup.importWorkspaceBundle",
            json!({ "inPath": future.to_string_lossy() })
        ),
        "import_failed"
    );

    let listed = sc.ok("classes.list", json!({}));
    let names: Vec<&str> = listed["classes"]
        .as_array()
        .map(|a| a.iter().filter_map(|c| c["name"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, vec!["Grade 3"]);
}

#[test]
fn ipc_backup_restores_the_open_workspace() {
    let (mut sc, ws) = Sidecar::with_admin("schoold-backup-ipc");
    sc.create_class("Grade 1", json!({}));

    let bundle = ws.join("backups").join("before.zip");
    let exported = sc.ok(
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"].as_str(), Some("schoold-workspace-v1"));
    assert_eq!(exported["entryCount"].as_u64(), Some(3));
    assert!(bundle.is_file());

    sc.create_class("Grade 2", json!({}));
    let listed = sc.ok("classes.list", json!({}));
    assert_eq!(listed["classes"].as_array().map(|a| a.len()), Some(2));

    let imported = sc.ok(
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        imported["bundleFormatDetected"].as_str(),
        Some("schoold-workspace-v1")
    );
    assert_eq!(imported["exportedAt"], exported["exportedAt"]);

    // The session row predates the export, so the token still resolves.
    let listed = sc.ok("classes.list", json!({}));
    let names: Vec<&str> = listed["classes"]
        .as_array()
        .map(|a| a.iter().filter_map(|c| c["name"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, vec!["Grade 1"]);

    assert_eq!(
        sc.err_code(
            "backup.importWorkspaceBundle",
            json!({ "inPath": ws.join("missing.zip").to_string_lossy() })
        ),
        "not_found"
    );
}
