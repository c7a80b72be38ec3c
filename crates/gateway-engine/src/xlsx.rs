//! Minimal xlsx codec: just enough OOXML to read a two-column input sheet
//! and to emit the result/pending workbooks. An xlsx file is a zip of XML
//! parts; cells are extracted with anchored regexes rather than a full XML
//! stack.

use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

/// A spreadsheet cell as the batch reader sees it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<row([^>]*)>(.*?)</row>").expect("static regex"));
static CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<c([^>]*?)(?:/>|>(.*?)</c>)").expect("static regex"));
static ROW_NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\br="(\d+)""#).expect("static regex"));
static CELL_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\br="([A-Za-z]+)\d+""#).expect("static regex"));
static CELL_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bt="(\w+)""#).expect("static regex"));
static VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<v[^>]*>(.*?)</v>").expect("static regex"));
static TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<t[^>]*>(.*?)</t>").expect("static regex"));
static SHARED_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<si(?:\s[^>]*)?>(.*?)</si>").expect("static regex"));

/// Reads the first worksheet into a dense row/cell grid.
///
/// Handles shared, inline and numeric cells; sparse rows and cells are
/// padded so grid positions match sheet positions.
pub(crate) fn read_sheet(data: &[u8]) -> anyhow::Result<Vec<Vec<CellValue>>> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;

    let shared = match read_part(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml),
        None => Vec::new(),
    };

    let sheet_xml = match read_part(&mut archive, "xl/worksheets/sheet1.xml")? {
        Some(xml) => xml,
        None => {
            let name = archive
                .file_names()
                .find(|name| name.starts_with("xl/worksheets/") && name.ends_with(".xml"))
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("файл не похож на xlsx: нет листов"))?;
            read_part(&mut archive, &name)?
                .ok_or_else(|| anyhow::anyhow!("файл не похож на xlsx: нет листов"))?
        }
    };

    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    for row_cap in ROW_RE.captures_iter(&sheet_xml) {
        let attrs = row_cap.get(1).map_or("", |m| m.as_str());
        let body = row_cap.get(2).map_or("", |m| m.as_str());

        let row_num = ROW_NUM_RE
            .captures(attrs)
            .and_then(|c| c[1].parse::<usize>().ok())
            .unwrap_or(rows.len() + 1);
        while rows.len() + 1 < row_num {
            rows.push(Vec::new());
        }

        let mut cells: Vec<CellValue> = Vec::new();
        for cell_cap in CELL_RE.captures_iter(body) {
            let cell_attrs = cell_cap.get(1).map_or("", |m| m.as_str());
            let cell_body = cell_cap.get(2).map_or("", |m| m.as_str());

            let col = CELL_REF_RE
                .captures(cell_attrs)
                .map(|c| column_index(&c[1]))
                .unwrap_or(cells.len());
            while cells.len() < col {
                cells.push(CellValue::Empty);
            }
            let value = parse_cell(cell_attrs, cell_body, &shared);
            if cells.len() == col {
                cells.push(value);
            } else {
                cells[col] = value;
            }
        }
        rows.push(cells);
    }
    Ok(rows)
}

fn read_part(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> anyhow::Result<Option<String>> {
    match archive.by_name(name) {
        Ok(mut file) => {
            let mut xml = String::new();
            file.read_to_string(&mut xml)?;
            Ok(Some(xml))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_shared_strings(xml: &str) -> Vec<String> {
    SHARED_ITEM_RE
        .captures_iter(xml)
        .map(|item| {
            TEXT_RE
                .captures_iter(&item[1])
                .map(|t| unescape_xml(&t[1]))
                .collect::<String>()
        })
        .collect()
}

fn parse_cell(attrs: &str, body: &str, shared: &[String]) -> CellValue {
    let cell_type = CELL_TYPE_RE.captures(attrs).map(|c| c[1].to_string());
    match cell_type.as_deref() {
        Some("s") => VALUE_RE
            .captures(body)
            .and_then(|c| c[1].trim().parse::<usize>().ok())
            .and_then(|idx| shared.get(idx))
            .map(|s| CellValue::Text(s.clone()))
            .unwrap_or(CellValue::Empty),
        Some("inlineStr") => CellValue::Text(
            TEXT_RE
                .captures_iter(body)
                .map(|t| unescape_xml(&t[1]))
                .collect(),
        ),
        Some("str") => VALUE_RE
            .captures(body)
            .map(|c| CellValue::Text(unescape_xml(&c[1])))
            .unwrap_or(CellValue::Empty),
        None | Some("n") | Some("b") => VALUE_RE
            .captures(body)
            .and_then(|c| c[1].trim().parse::<f64>().ok())
            .map(CellValue::Number)
            .unwrap_or(CellValue::Empty),
        Some(_) => CellValue::Empty,
    }
}

/// Writes a single-sheet workbook with every cell as an inline string.
pub(crate) fn write_sheet(path: &Path, sheet_name: &str, rows: &[Vec<String>]) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("[Content_Types].xml", options)?;
    zip.write_all(CONTENT_TYPES_XML.as_bytes())?;
    zip.start_file("_rels/.rels", options)?;
    zip.write_all(ROOT_RELS_XML.as_bytes())?;
    zip.start_file("xl/workbook.xml", options)?;
    zip.write_all(workbook_xml(sheet_name).as_bytes())?;
    zip.start_file("xl/_rels/workbook.xml.rels", options)?;
    zip.write_all(WORKBOOK_RELS_XML.as_bytes())?;
    zip.start_file("xl/worksheets/sheet1.xml", options)?;
    zip.write_all(worksheet_xml(rows).as_bytes())?;
    zip.finish()?;
    Ok(())
}

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

fn workbook_xml(sheet_name: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        escape_xml(sheet_name)
    )
}

fn worksheet_xml(rows: &[Vec<String>]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            xml.push_str(&format!(
                r#"<c r="{}{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                column_letters(c),
                r + 1,
                escape_xml(value)
            ));
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

fn column_letters(index: usize) -> String {
    let mut index = index;
    let mut letters = String::new();
    loop {
        letters.insert(0, (b'A' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters
}

fn column_index(letters: &str) -> usize {
    letters
        .chars()
        .fold(0usize, |acc, ch| {
            acc * 26 + (ch.to_ascii_uppercase() as usize - 'A' as usize + 1)
        })
        .saturating_sub(1)
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
