use anyhow::{anyhow, Context};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DB_FILE: &str = "school.sqlite3";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/school.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT: &str = "schoold-workspace-v1";
pub const LEGACY_FORMAT: &str = "legacy-sqlite3";
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub format: String,
    pub version: u32,
    pub app_version: String,
    pub exported_at: String,
    /// Hex SHA-256 of the database entry.
    #[serde(default)]
    pub db_sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub exported_at: Option<String>,
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn write_json_entry<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    value: &impl Serialize,
    opts: FileOptions,
) -> anyhow::Result<()> {
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start {} entry", name))?;
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", name))?;
    zip.write_all(text.as_bytes())
        .with_context(|| format!("failed to write {} entry", name))
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("workspace database not found: {}", db_path.to_string_lossy()))?;

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = BundleManifest {
        format: BUNDLE_FORMAT.to_string(),
        version: 1,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        db_sha256: Some(hex_digest(&db_bytes)),
    };
    write_json_entry(&mut zip, MANIFEST_ENTRY, &manifest, opts)?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;

    let workspace_meta = serde_json::json!({
        "sourceWorkspace": workspace_path.to_string_lossy(),
        "dbFile": DB_FILE,
        "dbBytes": db_bytes.len(),
    });
    write_json_entry(&mut zip, META_WORKSPACE_ENTRY, &workspace_meta, opts)?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: 3,
        db_bytes: db_bytes.len() as u64,
    })
}

/// Reads the manifest of a bundle without extracting anything.
pub fn read_manifest(in_path: &Path) -> anyhow::Result<BundleManifest> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;
    manifest_from_archive(&mut archive)
}

fn manifest_from_archive<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
) -> anyhow::Result<BundleManifest> {
    let mut text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut text)
        .context("failed to read manifest.json")?;
    let manifest: BundleManifest =
        serde_json::from_str(&text).context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", manifest.format));
    }
    Ok(manifest)
}

/// Restores `school.sqlite3` into `workspace_path` from a bundle or a plain
/// SQLite file. The caller must have closed any connection to it. Databases
/// whose `user_version` is above `max_schema_version` are refused before the
/// existing database is touched.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
    max_schema_version: i64,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!("failed to create workspace {}", workspace_path.to_string_lossy())
    })?;

    let (db_bytes, summary) = if is_zip_file(in_path)? {
        let in_file = File::open(in_path)
            .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
        let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;
        let manifest = manifest_from_archive(&mut archive)?;
        let mut bytes = Vec::new();
        archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/school.sqlite3")?
            .read_to_end(&mut bytes)
            .context("failed to extract database entry")?;
        if let Some(expected) = manifest.db_sha256.as_deref() {
            if hex_digest(&bytes) != expected {
                return Err(anyhow!("database entry checksum mismatch"));
            }
        }
        (
            bytes,
            ImportSummary {
                bundle_format_detected: BUNDLE_FORMAT.to_string(),
                exported_at: Some(manifest.exported_at),
            },
        )
    } else {
        let bytes = std::fs::read(in_path)
            .with_context(|| format!("failed to read {}", in_path.to_string_lossy()))?;
        (
            bytes,
            ImportSummary {
                bundle_format_detected: LEGACY_FORMAT.to_string(),
                exported_at: None,
            },
        )
    };
    if !db_bytes.starts_with(SQLITE_MAGIC) {
        return Err(anyhow!("input is not a SQLite database"));
    }

    let dst = workspace_path.join(DB_FILE);
    let tmp_dst = workspace_path.join(format!("{}.importing", DB_FILE));
    {
        let mut out = File::create(&tmp_dst).with_context(|| {
            format!("failed to create temp database {}", tmp_dst.to_string_lossy())
        })?;
        out.write_all(&db_bytes)
            .context("failed to write extracted database")?;
        out.flush().context("failed to flush extracted database")?;
    }
    if let Err(e) = check_schema_version(&tmp_dst, max_schema_version) {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(e);
    }
    for suffix in ["", "-wal", "-shm"] {
        let side = workspace_path.join(format!("{}{}", DB_FILE, suffix));
        if side.exists() {
            std::fs::remove_file(&side).with_context(|| {
                format!("failed to remove existing {}", side.to_string_lossy())
            })?;
        }
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!("failed to move extracted database to {}", dst.to_string_lossy())
    })?;

    Ok(summary)
}

fn check_schema_version(db_path: &Path, max_schema_version: i64) -> anyhow::Result<()> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .context("failed to open imported database")?;
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .context("imported file is not a readable SQLite database")?;
    if version > max_schema_version {
        return Err(anyhow!(
            "imported database schema version {} is newer than supported version {}",
            version,
            max_schema_version
        ));
    }
    Ok(())
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    Ok(read == 4 && sig == [0x50, 0x4B, 0x03, 0x04])
}
