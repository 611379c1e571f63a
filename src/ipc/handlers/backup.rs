use crate::backup;
use crate::ipc::helpers::{opt_str, required_str, respond, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

fn target_workspace(state: &AppState, req: &Request) -> Result<PathBuf, HandlerErr> {
    opt_str(&req.params, "workspacePath")?
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn handle_export(state: &mut AppState, req: &Request) -> HandlerResult {
    let out_path = PathBuf::from(required_str(&req.params, "outPath")?);
    let workspace_path = target_workspace(state, req)?;

    let export = backup::export_workspace_bundle(&workspace_path, &out_path).map_err(|e| {
        HandlerErr::new("export_failed", format!("{:#}", e))
            .with_details(json!({ "path": out_path.to_string_lossy() }))
    })?;
    let manifest = backup::read_manifest(&out_path).map_err(|e| {
        HandlerErr::new("export_failed", format!("{:#}", e))
            .with_details(json!({ "path": out_path.to_string_lossy() }))
    })?;
    tracing::info!(
        out_path = %out_path.display(),
        db_bytes = export.db_bytes,
        "workspace bundle exported"
    );
    Ok(json!({
        "path": out_path.to_string_lossy(),
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbBytes": export.db_bytes,
        "exportedAt": manifest.exported_at
    }))
}

fn handle_import(state: &mut AppState, req: &Request) -> HandlerResult {
    let in_path = PathBuf::from(required_str(&req.params, "inPath")?);
    let workspace_path = target_workspace(state, req)?;
    if !in_path.is_file() {
        return Err(HandlerErr::not_found("bundle file not found")
            .with_details(json!({ "path": in_path.to_string_lossy() })));
    }

    let replacing_current = state.workspace.as_ref() == Some(&workspace_path);
    if replacing_current {
        state.db = None;
        state.current_user = None;
    }

    let imported =
        backup::import_workspace_bundle(&in_path, &workspace_path, crate::db::SCHEMA_VERSION);
    let reopen = if replacing_current || imported.is_ok() {
        super::core::open_workspace(state, workspace_path.clone())
    } else {
        Ok(())
    };

    let import = imported.map_err(|e| {
        HandlerErr::new("import_failed", format!("{:#}", e))
            .with_details(json!({ "path": in_path.to_string_lossy() }))
    })?;
    reopen.map_err(|e| HandlerErr::new("db_open_failed", format!("{:#}", e)))?;

    tracing::info!(
        in_path = %in_path.display(),
        workspace = %workspace_path.display(),
        format = %import.bundle_format_detected,
        "workspace bundle imported"
    );
    Ok(json!({
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "exportedAt": import.exported_at
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => handle_export(state, req),
        "backup.importWorkspaceBundle" => handle_import(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
