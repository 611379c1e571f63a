use crate::certificate::{
    jpeg_info, parse_hex_color, place_fields, render_pdf, serial_number, validate_fields,
    FieldDefaults, FieldValues, JpegInfo, Orientation, PageSize, Placement, TemplateField,
};
use crate::ipc::helpers::{
    db_conn, like_escape, now_ts, opt_date, opt_str, patch_str, required_str, respond, today,
    write_bytes_file, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::setup::certificate_settings;
use super::students::load_student;

struct TemplateRow {
    id: String,
    name: String,
    image_path: Option<String>,
    orientation: Orientation,
    fields: Vec<TemplateField>,
    created_at: String,
    updated_at: Option<String>,
}

impl TemplateRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "imagePath": self.image_path,
            "orientation": self.orientation,
            "fields": self.fields,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }
}

fn orientation_str(o: Orientation) -> &'static str {
    match o {
        Orientation::Landscape => "landscape",
        Orientation::Portrait => "portrait",
    }
}

fn parse_orientation(raw: &str) -> Result<Orientation, HandlerErr> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "landscape" => Ok(Orientation::Landscape),
        "portrait" => Ok(Orientation::Portrait),
        _ => Err(HandlerErr::bad_params(
            "orientation must be landscape or portrait",
        )),
    }
}

fn corrupt_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn template_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TemplateRow> {
    let orientation: String = r.get(3)?;
    let fields_json: String = r.get(4)?;
    let orientation = parse_orientation(&orientation)
        .map_err(|_| corrupt_column(3, format!("unknown orientation {:?}", orientation)))?;
    let fields: Vec<TemplateField> = serde_json::from_str(&fields_json)
        .map_err(|e| corrupt_column(4, format!("template fields: {}", e)))?;
    Ok(TemplateRow {
        id: r.get(0)?,
        name: r.get(1)?,
        image_path: r.get(2)?,
        orientation,
        fields,
        created_at: r.get(5)?,
        updated_at: r.get(6)?,
    })
}

const TEMPLATE_COLUMNS: &str =
    "id, name, image_path, orientation, fields_json, created_at, updated_at";

fn load_template(conn: &Connection, template_id: &str) -> Result<TemplateRow, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM certificate_templates WHERE id = ?",
            TEMPLATE_COLUMNS
        ),
        [template_id],
        template_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("certificate template not found"))
}

fn parse_fields(raw: Option<&Value>) -> Result<Vec<TemplateField>, HandlerErr> {
    let raw = raw.ok_or_else(|| HandlerErr::bad_params("missing fields"))?;
    let fields: Vec<TemplateField> = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("fields: {}", e)))?;
    validate_fields(&fields).map_err(|e| HandlerErr::validation(e.to_string()))?;
    Ok(fields)
}

fn read_image(path: &str) -> Result<(JpegInfo, Vec<u8>), HandlerErr> {
    let bytes = std::fs::read(Path::new(path)).map_err(|e| {
        HandlerErr::bad_params(format!("cannot read template image: {}", e))
            .with_details(json!({ "imagePath": path }))
    })?;
    let info = jpeg_info(&bytes).map_err(|e| {
        HandlerErr::validation(e.to_string()).with_details(json!({ "imagePath": path }))
    })?;
    Ok((info, bytes))
}

fn handle_templates_list(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM certificate_templates ORDER BY name",
        TEMPLATE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], template_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "templates": rows.iter().map(TemplateRow::to_json).collect::<Vec<_>>() }))
}

fn handle_templates_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let template_id = required_str(&req.params, "templateId")?;
    Ok(json!({ "template": load_template(conn, &template_id)?.to_json() }))
}

fn handle_templates_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let name = required_str(p, "name")?;
    let orientation = match opt_str(p, "orientation")? {
        Some(o) => parse_orientation(&o)?,
        None => Orientation::default(),
    };
    let fields = parse_fields(p.get("fields"))?;
    let image_path = opt_str(p, "imagePath")?;
    if let Some(path) = image_path.as_deref() {
        read_image(path)?;
    }

    let template_id = Uuid::new_v4().to_string();
    let fields_json = serde_json::to_string(&fields)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    conn.execute(
        "INSERT INTO certificate_templates(id, name, image_path, orientation, fields_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &template_id,
            &name,
            &image_path,
            orientation_str(orientation),
            &fields_json,
            now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "certificate_templates", e))?;
    Ok(json!({
        "templateId": template_id,
        "template": load_template(conn, &template_id)?.to_json()
    }))
}

fn handle_templates_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let template_id = required_str(p, "templateId")?;
    let cur = load_template(conn, &template_id)?;

    let name = opt_str(p, "name")?.unwrap_or(cur.name.clone());
    let orientation = match opt_str(p, "orientation")? {
        Some(o) => parse_orientation(&o)?,
        None => cur.orientation,
    };
    let fields = match p.get("fields") {
        None | Some(Value::Null) => cur.fields.clone(),
        raw => parse_fields(raw)?,
    };
    let image_path = patch_str(p, "imagePath")?.unwrap_or(cur.image_path.clone());
    if let Some(path) = image_path.as_deref() {
        if image_path != cur.image_path {
            read_image(path)?;
        }
    }

    let fields_json = serde_json::to_string(&fields)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    conn.execute(
        "UPDATE certificate_templates SET name = ?, image_path = ?, orientation = ?,
            fields_json = ?, updated_at = ?
         WHERE id = ?",
        (
            &name,
            &image_path,
            orientation_str(orientation),
            &fields_json,
            now_ts(),
            &template_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "certificate_templates", e))?;
    Ok(json!({ "template": load_template(conn, &template_id)?.to_json() }))
}

fn handle_templates_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let template_id = required_str(&req.params, "templateId")?;
    let n = conn
        .execute(
            "DELETE FROM certificate_templates WHERE id = ?",
            [&template_id],
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", "certificate_templates", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("certificate template not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Next serial for the prefix and year; gaps left by deletions are not reused.
fn next_serial(conn: &Connection, prefix: &str, year: i32) -> Result<String, HandlerErr> {
    let stem = format!("{}-{}-", prefix, year);
    let mut stmt = conn.prepare(
        "SELECT serial FROM certificates_issued WHERE serial LIKE ? || '%' ESCAPE '\\'",
    )?;
    let serials = stmt
        .query_map([like_escape(&stem)], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let max_seq = serials
        .iter()
        .filter_map(|s| s.strip_prefix(&stem)?.parse::<i64>().ok())
        .max()
        .unwrap_or(0);
    Ok(serial_number(prefix, year, max_seq + 1))
}

struct Rendered {
    page: PageSize,
    placements: Vec<Placement>,
    image: Option<(JpegInfo, Vec<u8>)>,
}

fn lay_out(
    conn: &Connection,
    template: &TemplateRow,
    values: &FieldValues,
) -> Result<Rendered, HandlerErr> {
    let settings = certificate_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let image = match template.image_path.as_deref() {
        Some(path) => Some(read_image(path)?),
        None => None,
    };
    let page = PageSize::for_template(template.orientation, image.as_ref().map(|(i, _)| i));
    let defaults = FieldDefaults {
        font_size: settings.default_font_size,
        rgb: parse_hex_color(&settings.default_color).unwrap_or((0.1, 0.1, 0.1)),
    };
    let placements = place_fields(&template.fields, values, page, defaults);
    Ok(Rendered {
        page,
        placements,
        image,
    })
}

fn year_of(date: &str) -> i32 {
    date.get(..4).and_then(|y| y.parse().ok()).unwrap_or(1970)
}

fn handle_generate(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let template_id = required_str(p, "templateId")?;
    let out_path = PathBuf::from(required_str(p, "outPath")?);
    let template = load_template(conn, &template_id)?;
    let issue_date = opt_date(p, "issueDate")?.unwrap_or_else(today);
    let title = opt_str(p, "title")?;

    let student = match opt_str(p, "studentId")? {
        Some(id) => Some(load_student(conn, &id)?),
        None => None,
    };
    let recipient_name = match (&student, opt_str(p, "recipientName")?) {
        (_, Some(name)) => name,
        (Some(s), None) => s.full_name(),
        (None, None) => {
            return Err(HandlerErr::bad_params(
                "studentId or recipientName is required",
            ))
        }
    };

    let settings = certificate_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let serial = next_serial(conn, &settings.serial_prefix, year_of(&issue_date))?;
    let values = FieldValues {
        student_name: recipient_name.clone(),
        class_name: student.as_ref().and_then(|s| s.class_name.clone()),
        reg_no: student.as_ref().map(|s| s.reg_no.clone()),
        issue_date: Some(issue_date.clone()),
        serial: Some(serial.clone()),
        text: opt_str(p, "text")?,
    };
    let rendered = lay_out(conn, &template, &values)?;
    let pdf = render_pdf(
        rendered.page,
        rendered
            .image
            .as_ref()
            .map(|(info, bytes)| (info, bytes.as_slice())),
        &rendered.placements,
        title.as_deref(),
    );

    // The row is only committed once the file is on disk, so a failed write
    // does not consume the serial.
    let certificate_id = Uuid::new_v4().to_string();
    let out_str = out_path.to_string_lossy().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO certificates_issued(id, serial, template_id, student_id, recipient_name,
            title, issued_at, out_path)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            certificate_id,
            serial,
            template_id,
            student.as_ref().map(|s| s.id.clone()),
            recipient_name,
            title,
            now_ts(),
            out_str
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "certificates_issued", e))?;
    write_bytes_file(&out_path, &pdf)
        .map_err(|e| HandlerErr::new("export_failed", format!("{:#}", e)))?;
    if let Err(e) = tx.commit() {
        if let Err(rm) = std::fs::remove_file(&out_path) {
            tracing::warn!(
                error = %rm,
                out_path = %out_str,
                "failed to remove unrecorded certificate"
            );
        }
        return Err(HandlerErr::new("db_commit_failed", e.to_string()));
    }
    tracing::info!(serial = %serial, out_path = %out_str, "certificate generated");

    Ok(json!({
        "certificateId": certificate_id,
        "serial": serial,
        "outPath": out_str,
        "bytes": pdf.len(),
        "page": { "width": rendered.page.width, "height": rendered.page.height },
        "placements": rendered.placements
    }))
}

fn handle_preview(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let p = &req.params;
    let template_id = required_str(p, "templateId")?;
    let recipient_name = required_str(p, "recipientName")?;
    let template = load_template(conn, &template_id)?;
    let issue_date = opt_date(p, "issueDate")?.unwrap_or_else(today);
    let settings = certificate_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let values = FieldValues {
        student_name: recipient_name,
        class_name: opt_str(p, "className")?,
        reg_no: opt_str(p, "regNo")?,
        issue_date: Some(issue_date.clone()),
        serial: Some(next_serial(conn, &settings.serial_prefix, year_of(&issue_date))?),
        text: opt_str(p, "text")?,
    };
    let rendered = lay_out(conn, &template, &values)?;
    Ok(json!({
        "page": { "width": rendered.page.width, "height": rendered.page.height },
        "placements": rendered.placements
    }))
}

fn handle_issued_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = opt_str(&req.params, "studentId")?;
    let mut stmt = conn.prepare(
        "SELECT i.id, i.serial, i.template_id, t.name, i.student_id, i.recipient_name, i.title,
            i.issued_at, i.out_path
         FROM certificates_issued i
         LEFT JOIN certificate_templates t ON t.id = i.template_id
         WHERE (?1 IS NULL OR i.student_id = ?1)
         ORDER BY i.issued_at DESC, i.serial DESC",
    )?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "serial": r.get::<_, String>(1)?,
                "templateId": r.get::<_, String>(2)?,
                "templateName": r.get::<_, Option<String>>(3)?,
                "studentId": r.get::<_, Option<String>>(4)?,
                "recipientName": r.get::<_, String>(5)?,
                "title": r.get::<_, Option<String>>(6)?,
                "issuedAt": r.get::<_, String>(7)?,
                "outPath": r.get::<_, String>(8)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "certificates": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "certificates.templates.list" => handle_templates_list(state, req),
        "certificates.templates.get" => handle_templates_get(state, req),
        "certificates.templates.create" => handle_templates_create(state, req),
        "certificates.templates.update" => handle_templates_update(state, req),
        "certificates.templates.delete" => handle_templates_delete(state, req),
        "certificates.generate" => handle_generate(state, req),
        "certificates.preview" => handle_preview(state, req),
        "certificates.issued.list" => handle_issued_list(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
