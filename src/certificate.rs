//! Certificate templates: text placement over an optional background image,
//! and a small single-page PDF writer (Helvetica text + one JPEG XObject).

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;

pub const A4_LONG_PT: f64 = 842.0;
pub const A4_SHORT_PT: f64 = 595.0;
/// Baseline drop that puts the anchor point at the visual centre of
/// capital-height glyphs.
const BASELINE_SHIFT_EM: f64 = 0.35;

#[derive(Debug, Error, PartialEq)]
pub enum CertificateError {
    #[error("template needs at least one studentName field")]
    NoNameField,
    #[error("field {index}: {axis} must be within 0..=100")]
    PercentOutOfRange { index: usize, axis: &'static str },
    #[error("field {index}: fontSize must be within 4..=200")]
    BadFontSize { index: usize },
    #[error("field {index}: color must be #RRGGBB")]
    BadColor { index: usize },
    #[error("field {index}: text fields need text")]
    MissingText { index: usize },
    #[error("template image must be a JPEG with 1 or 3 colour components")]
    UnsupportedImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldSource {
    StudentName,
    ClassName,
    RegNo,
    IssueDate,
    Serial,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Align {
    Left,
    #[default]
    Center,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateField {
    pub source: FieldSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub x_percent: f64,
    pub y_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub align: Align,
}

pub fn validate_fields(fields: &[TemplateField]) -> Result<(), CertificateError> {
    if !fields.iter().any(|f| f.source == FieldSource::StudentName) {
        return Err(CertificateError::NoNameField);
    }
    for (index, f) in fields.iter().enumerate() {
        if !(0.0..=100.0).contains(&f.x_percent) {
            return Err(CertificateError::PercentOutOfRange {
                index,
                axis: "xPercent",
            });
        }
        if !(0.0..=100.0).contains(&f.y_percent) {
            return Err(CertificateError::PercentOutOfRange {
                index,
                axis: "yPercent",
            });
        }
        if let Some(size) = f.font_size {
            if !(4.0..=200.0).contains(&size) {
                return Err(CertificateError::BadFontSize { index });
            }
        }
        if let Some(color) = f.color.as_deref() {
            if parse_hex_color(color).is_none() {
                return Err(CertificateError::BadColor { index });
            }
        }
        if f.source == FieldSource::Text
            && f.text.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(CertificateError::MissingText { index });
        }
    }
    Ok(())
}

pub fn parse_hex_color(s: &str) -> Option<(f64, f64, f64)> {
    let hex = s.trim().strip_prefix('#')?;
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some((
        channel(0)? as f64 / 255.0,
        channel(2)? as f64 / 255.0,
        channel(4)? as f64 / 255.0,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegInfo {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub bits_per_component: u8,
}

/// Reads frame dimensions from the first SOFn segment.
pub fn jpeg_info(bytes: &[u8]) -> Result<JpegInfo, CertificateError> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return Err(CertificateError::UnsupportedImage);
    }
    let mut i = 2usize;
    while i + 3 < bytes.len() {
        if bytes[i] != 0xFF {
            return Err(CertificateError::UnsupportedImage);
        }
        let marker = bytes[i + 1];
        if marker == 0xFF {
            i += 1;
            continue;
        }
        if marker == 0x01 || (0xD0..=0xD9).contains(&marker) {
            i += 2;
            continue;
        }
        let len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
        if len < 2 {
            return Err(CertificateError::UnsupportedImage);
        }
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if i + 9 >= bytes.len() {
                return Err(CertificateError::UnsupportedImage);
            }
            let bits = bytes[i + 4];
            let height = u16::from_be_bytes([bytes[i + 5], bytes[i + 6]]) as u32;
            let width = u16::from_be_bytes([bytes[i + 7], bytes[i + 8]]) as u32;
            let components = bytes[i + 9];
            if width == 0 || height == 0 || !matches!(components, 1 | 3) {
                return Err(CertificateError::UnsupportedImage);
            }
            return Ok(JpegInfo {
                width,
                height,
                components,
                bits_per_component: bits,
            });
        }
        i += 2 + len;
    }
    Err(CertificateError::UnsupportedImage)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    /// A4 for the orientation, or the image's aspect ratio scaled so its
    /// longer side matches A4's.
    pub fn for_template(orientation: Orientation, image: Option<&JpegInfo>) -> Self {
        if let Some(img) = image {
            let (w, h) = (img.width as f64, img.height as f64);
            let (width, height) = if w >= h {
                (A4_LONG_PT, A4_LONG_PT * h / w)
            } else {
                (A4_LONG_PT * w / h, A4_LONG_PT)
            };
            return Self {
                width: round2(width),
                height: round2(height),
            };
        }
        match orientation {
            Orientation::Landscape => Self {
                width: A4_LONG_PT,
                height: A4_SHORT_PT,
            },
            Orientation::Portrait => Self {
                width: A4_SHORT_PT,
                height: A4_LONG_PT,
            },
        }
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default)]
pub struct FieldValues {
    pub student_name: String,
    pub class_name: Option<String>,
    pub reg_no: Option<String>,
    pub issue_date: Option<String>,
    pub serial: Option<String>,
    pub text: Option<String>,
}

impl FieldValues {
    fn resolve(&self, field: &TemplateField) -> Option<String> {
        let v = match field.source {
            FieldSource::StudentName => Some(self.student_name.clone()),
            FieldSource::ClassName => self.class_name.clone(),
            FieldSource::RegNo => self.reg_no.clone(),
            FieldSource::IssueDate => self.issue_date.clone(),
            FieldSource::Serial => self.serial.clone(),
            FieldSource::Text => field.text.clone().or_else(|| self.text.clone()),
        };
        v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDefaults {
    pub font_size: f64,
    pub rgb: (f64, f64, f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub font_size: f64,
    pub width: f64,
    #[serde(skip)]
    pub rgb: (f64, f64, f64),
}

/// Maps percentage anchors (origin top-left) to PDF user space (origin
/// bottom-left). Fields whose value is empty are skipped.
pub fn place_fields(
    fields: &[TemplateField],
    values: &FieldValues,
    page: PageSize,
    defaults: FieldDefaults,
) -> Vec<Placement> {
    fields
        .iter()
        .filter_map(|f| {
            let text = values.resolve(f)?;
            let font_size = f.font_size.unwrap_or(defaults.font_size);
            let rgb = f
                .color
                .as_deref()
                .and_then(parse_hex_color)
                .unwrap_or(defaults.rgb);
            let width = helvetica_text_width(&text, font_size);
            let anchor_x = page.width * f.x_percent / 100.0;
            let anchor_y = page.height * (1.0 - f.y_percent / 100.0);
            let x = match f.align {
                Align::Left => anchor_x,
                Align::Center => anchor_x - width / 2.0,
                Align::Right => anchor_x - width,
            };
            Some(Placement {
                text,
                x: round2(x),
                y: round2(anchor_y - BASELINE_SHIFT_EM * font_size),
                font_size,
                width: round2(width),
                rgb,
            })
        })
        .collect()
}

// Helvetica advance widths (1/1000 em) for U+0020..=U+007E.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // '0'..'?'
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // '@'..'O'
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // 'P'..'_'
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // '`'..'o'
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, // 'p'..'~'
];
const FALLBACK_WIDTH: u16 = 556;

pub fn helvetica_text_width(text: &str, font_size: f64) -> f64 {
    let units: u32 = text
        .chars()
        .map(|c| {
            let code = c as u32;
            if (0x20..=0x7E).contains(&code) {
                HELVETICA_WIDTHS[(code - 0x20) as usize] as u32
            } else {
                FALLBACK_WIDTH as u32
            }
        })
        .sum();
    units as f64 * font_size / 1000.0
}

/// PDF literal string in WinAnsi; characters outside Latin-1 become `?`.
fn pdf_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('(');
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            ' '..='~' => out.push(c),
            '\u{A0}'..='\u{FF}' => {
                let _ = write!(out, "\\{:03o}", c as u32);
            }
            _ => out.push('?'),
        }
    }
    out.push(')');
    out
}

pub fn render_pdf(
    page: PageSize,
    image: Option<(&JpegInfo, &[u8])>,
    placements: &[Placement],
    title: Option<&str>,
) -> Vec<u8> {
    let mut content = String::new();
    if image.is_some() {
        let _ = writeln!(content, "q");
        let _ = writeln!(content, "{:.2} 0 0 {:.2} 0 0 cm", page.width, page.height);
        let _ = writeln!(content, "/Im1 Do");
        let _ = writeln!(content, "Q");
    }
    for p in placements {
        let _ = writeln!(content, "BT");
        let _ = writeln!(content, "/F1 {:.2} Tf", p.font_size);
        let _ = writeln!(content, "{:.3} {:.3} {:.3} rg", p.rgb.0, p.rgb.1, p.rgb.2);
        let _ = writeln!(content, "{:.2} {:.2} Td", p.x, p.y);
        let _ = writeln!(content, "{} Tj", pdf_literal(&p.text));
        let _ = writeln!(content, "ET");
    }

    let mut objects: Vec<Vec<u8>> = Vec::new();
    objects.push(b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
    objects.push(b"<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_vec());
    let xobject = if image.is_some() {
        " /XObject << /Im1 7 0 R >>"
    } else {
        ""
    };
    objects.push(
        format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {:.2} {:.2}] /Resources << /Font << /F1 5 0 R >>{} >> /Contents 4 0 R >>",
            page.width, page.height, xobject
        )
        .into_bytes(),
    );
    objects.push(stream_object(
        &format!("<< /Length {} >>", content.len()),
        content.as_bytes(),
    ));
    objects.push(
        b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
            .to_vec(),
    );
    objects.push(
        format!(
            "<< /Producer {} /Title {} >>",
            pdf_literal(concat!("schoold ", env!("CARGO_PKG_VERSION"))),
            pdf_literal(title.unwrap_or("Certificate"))
        )
        .into_bytes(),
    );
    if let Some((info, data)) = image {
        let color_space = if info.components == 1 {
            "/DeviceGray"
        } else {
            "/DeviceRGB"
        };
        objects.push(stream_object(
            &format!(
                "<< /Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace {} /BitsPerComponent {} /Filter /DCTDecode /Length {} >>",
                info.width,
                info.height,
                color_space,
                info.bits_per_component,
                data.len()
            ),
            data,
        ));
    }

    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }
    let xref_at = out.len();
    let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for off in &offsets {
        let _ = write!(xref, "{:010} 00000 n \n", off);
    }
    let _ = write!(
        xref,
        "trailer\n<< /Size {} /Root 1 0 R /Info 6 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref_at
    );
    out.extend_from_slice(xref.as_bytes());
    out
}

fn stream_object(dict: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(dict.len() + data.len() + 32);
    body.extend_from_slice(dict.as_bytes());
    body.extend_from_slice(b"\nstream\n");
    body.extend_from_slice(data);
    body.extend_from_slice(b"\nendstream");
    body
}

pub fn serial_number(prefix: &str, year: i32, seq: i64) -> String {
    format!("{}-{}-{:05}", prefix, year, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(source: FieldSource, x: f64, y: f64) -> TemplateField {
        TemplateField {
            source,
            text: None,
            x_percent: x,
            y_percent: y,
            font_size: None,
            color: None,
            align: Align::Center,
        }
    }

    fn tiny_jpeg(width: u16, height: u16, components: u8) -> Vec<u8> {
        let mut b = vec![0xFF, 0xD8];
        // APP0 with a 16-byte payload
        b.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        b.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
        b.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        b.extend_from_slice(&height.to_be_bytes());
        b.extend_from_slice(&width.to_be_bytes());
        b.push(components);
        b.extend_from_slice(&[0u8; 9]);
        b.extend_from_slice(&[0xFF, 0xD9]);
        b
    }

    #[test]
    fn reads_jpeg_frame_size() {
        let info = jpeg_info(&tiny_jpeg(1600, 1200, 3)).expect("jpeg info");
        assert_eq!((info.width, info.height, info.components), (1600, 1200, 3));
        assert_eq!(
            jpeg_info(&tiny_jpeg(10, 10, 4)),
            Err(CertificateError::UnsupportedImage)
        );
        assert_eq!(
            jpeg_info(b"\x89PNG\r\n\x1a\n"),
            Err(CertificateError::UnsupportedImage)
        );
    }

    #[test]
    fn page_follows_image_aspect_or_a4() {
        let wide = jpeg_info(&tiny_jpeg(2000, 1000, 3)).expect("wide");
        assert_eq!(
            PageSize::for_template(Orientation::Portrait, Some(&wide)),
            PageSize {
                width: 842.0,
                height: 421.0
            }
        );
        let tall = jpeg_info(&tiny_jpeg(1000, 2000, 1)).expect("tall");
        assert_eq!(
            PageSize::for_template(Orientation::Landscape, Some(&tall)),
            PageSize {
                width: 421.0,
                height: 842.0
            }
        );
        assert_eq!(
            PageSize::for_template(Orientation::Portrait, None),
            PageSize {
                width: 595.0,
                height: 842.0
            }
        );
    }

    #[test]
    fn percent_anchor_maps_to_points_from_bottom_left() {
        let page = PageSize::for_template(Orientation::Landscape, None);
        let defaults = FieldDefaults {
            font_size: 20.0,
            rgb: (0.0, 0.0, 0.0),
        };
        let values = FieldValues {
            student_name: "AB".into(),
            ..FieldValues::default()
        };
        let mut f = field(FieldSource::StudentName, 50.0, 25.0);
        let p = &place_fields(&[f.clone()], &values, page, defaults)[0];
        // "AB" = (667 + 667) / 1000 * 20
        assert_eq!(p.width, 26.68);
        assert_eq!(p.x, 421.0 - 13.34);
        assert_eq!(p.y, 446.25 - 7.0);

        f.align = Align::Left;
        f.x_percent = 0.0;
        f.y_percent = 100.0;
        let p = &place_fields(&[f.clone()], &values, page, defaults)[0];
        assert_eq!((p.x, p.y), (0.0, -7.0));

        f.align = Align::Right;
        f.x_percent = 100.0;
        let p = &place_fields(&[f], &values, page, defaults)[0];
        assert_eq!(p.x, 842.0 - 26.68);
    }

    #[test]
    fn empty_values_are_skipped() {
        let page = PageSize::for_template(Orientation::Landscape, None);
        let defaults = FieldDefaults {
            font_size: 12.0,
            rgb: (0.0, 0.0, 0.0),
        };
        let fields = vec![
            field(FieldSource::StudentName, 50.0, 50.0),
            field(FieldSource::RegNo, 50.0, 60.0),
        ];
        let values = FieldValues {
            student_name: "Asha".into(),
            ..FieldValues::default()
        };
        assert_eq!(place_fields(&fields, &values, page, defaults).len(), 1);
    }

    #[test]
    fn field_validation() {
        assert_eq!(
            validate_fields(&[field(FieldSource::RegNo, 1.0, 1.0)]),
            Err(CertificateError::NoNameField)
        );
        assert_eq!(
            validate_fields(&[field(FieldSource::StudentName, 101.0, 1.0)]),
            Err(CertificateError::PercentOutOfRange {
                index: 0,
                axis: "xPercent"
            })
        );
        let mut bad_color = field(FieldSource::StudentName, 50.0, 50.0);
        bad_color.color = Some("red".into());
        assert_eq!(
            validate_fields(&[bad_color]),
            Err(CertificateError::BadColor { index: 0 })
        );
        let text = field(FieldSource::Text, 50.0, 50.0);
        assert_eq!(
            validate_fields(&[field(FieldSource::StudentName, 50.0, 40.0), text]),
            Err(CertificateError::MissingText { index: 1 })
        );
        assert_eq!(parse_hex_color("#ff0080"), Some((1.0, 0.0, 128.0 / 255.0)));
    }

    #[test]
    fn escapes_pdf_strings() {
        assert_eq!(pdf_literal("a(b)\\c"), "(a\\(b\\)\\\\c)");
        assert_eq!(pdf_literal("Zoë"), "(Zo\\353)");
        assert_eq!(pdf_literal("日"), "(?)");
    }

    #[test]
    fn pdf_xref_offsets_point_at_objects() {
        let jpeg = tiny_jpeg(800, 600, 3);
        let info = jpeg_info(&jpeg).expect("info");
        let page = PageSize::for_template(Orientation::Landscape, Some(&info));
        let placements = place_fields(
            &[field(FieldSource::StudentName, 50.0, 50.0)],
            &FieldValues {
                student_name: "Ravi Kumar".into(),
                ..FieldValues::default()
            },
            page,
            FieldDefaults {
                font_size: 32.0,
                rgb: (0.1, 0.1, 0.1),
            },
        );
        let pdf = render_pdf(page, Some((&info, &jpeg)), &placements, Some("Merit"));
        assert!(pdf.starts_with(b"%PDF-1.4"));
        let text = String::from_utf8_lossy(&pdf).to_string();
        assert!(text.contains("/Filter /DCTDecode"));
        assert!(text.contains("(Ravi Kumar) Tj"));
        assert!(text.trim_end().ends_with("%%EOF"));

        let xref_pos = text.rfind("startxref\n").expect("startxref");
        let xref_at: usize = text[xref_pos + 10..]
            .lines()
            .next()
            .expect("offset line")
            .parse()
            .expect("offset");
        assert!(pdf[xref_at..].starts_with(b"xref"));
        let table = String::from_utf8_lossy(&pdf[xref_at..]).to_string();
        for (i, line) in table.lines().skip(3).take(7).enumerate() {
            let off: usize = line[..10].parse().expect("xref offset");
            let expect = format!("{} 0 obj", i + 1);
            assert!(pdf[off..].starts_with(expect.as_bytes()), "object {}", i + 1);
        }
    }

    #[test]
    fn serial_is_zero_padded() {
        assert_eq!(serial_number("CERT", 2026, 7), "CERT-2026-00007");
    }
}
