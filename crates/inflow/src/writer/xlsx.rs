//! Minimal xlsx reader.
//!
//! Reads cell values (shared strings, inline strings, numbers, booleans) from
//! every worksheet in workbook order and renders them as header-keyed records.
//! Formatting, formulas and dates-as-text are out of scope: a date cell comes
//! out as its serial number.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum XlsxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an xlsx container: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("workbook part \"{0}\" is missing")]
    MissingPart(String),

    #[error("failed to render workbook: {0}")]
    Render(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    /// Numeric cell, kept as written in the sheet.
    Number(String),
}

impl Cell {
    fn as_text(&self) -> &str {
        match self {
            Cell::Empty => "",
            Cell::Text(s) | Cell::Number(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    /// Visible rows, each padded to the same width.
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self, XlsxError> {
        let mut archive = zip::ZipArchive::new(File::open(path)?)?;
        let mut part = |name: &str| -> Result<Option<String>, XlsxError> {
            let mut file = match archive.by_name(name) {
                Ok(file) => file,
                Err(zip::result::ZipError::FileNotFound) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let mut text = String::new();
            file.read_to_string(&mut text)?;
            Ok(Some(text))
        };

        let workbook_path = part("_rels/.rels")?
            .and_then(|rels| office_document_target(&rels))
            .unwrap_or_else(|| "xl/workbook.xml".to_string());
        let base = match workbook_path.rfind('/') {
            Some(idx) => workbook_path[..=idx].to_string(),
            None => String::new(),
        };
        let rels_path = format!("{}_rels/{}.rels", base, &workbook_path[base.len()..]);

        let workbook_xml =
            part(&workbook_path)?.ok_or_else(|| XlsxError::MissingPart(workbook_path.clone()))?;
        let targets = part(&rels_path)?
            .map(|rels| relationship_targets(&rels, &base))
            .unwrap_or_default();
        let shared = match part(&format!("{}sharedStrings.xml", base))? {
            Some(xml) => shared_strings(&xml),
            None => Vec::new(),
        };

        let mut sheets = Vec::new();
        for (name, rel_id) in sheet_entries(&workbook_xml) {
            let Some(target) = targets.get(&rel_id) else {
                continue;
            };
            let xml = part(target)?.ok_or_else(|| XlsxError::MissingPart(target.clone()))?;
            sheets.push(Sheet {
                name,
                rows: sheet_rows(&xml, &shared),
            });
        }
        Ok(Self { sheets })
    }

    /// Pretty JSON: `{"sheet0": {"item": [{header: value, ...}]}}`. Empty string
    /// for a workbook without sheets.
    pub fn to_json(&self) -> Result<String, XlsxError> {
        if self.sheets.is_empty() {
            return Ok(String::new());
        }
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        JsonWorkbook(self).serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// The same tree as [`Workbook::to_json`] as XML under a `<sheets>` root.
    pub fn to_xml(&self) -> String {
        if self.sheets.is_empty() {
            return String::new();
        }
        let mut out = String::from("<sheets>\n");
        for (idx, sheet) in self.sheets.iter().enumerate() {
            out.push_str(&format!("    <sheet{}>\n", idx));
            let (keys, records) = sheet.records();
            for record in records {
                out.push_str("        <item>\n");
                for (key, cell) in keys.iter().zip(record) {
                    let value = escape_xml(cell.as_text());
                    out.push_str(&format!("            <{key}>{value}</{key}>\n"));
                }
                out.push_str("        </item>\n");
            }
            out.push_str(&format!("    </sheet{}>\n", idx));
        }
        out.push_str("</sheets>\n");
        out
    }
}

impl Sheet {
    /// Header keys from the first row and the data rows below it.
    ///
    /// Empty headers become `__EMPTY`, `__EMPTY_1`, ...; repeated headers get
    /// `_1`, `_2` suffixes. Keys are then made element-safe: an all-digit key
    /// becomes `item<N>` and whitespace becomes `_`. Blank data rows are dropped.
    pub fn records(&self) -> (Vec<String>, Vec<&[Cell]>) {
        let Some((header, data)) = self.rows.split_first() else {
            return (Vec::new(), Vec::new());
        };

        let mut keys = Vec::with_capacity(header.len());
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut empty = 0usize;
        for cell in header {
            let raw = cell.as_text().trim();
            let base = if raw.is_empty() {
                let key = if empty == 0 {
                    "__EMPTY".to_string()
                } else {
                    format!("__EMPTY_{}", empty)
                };
                empty += 1;
                key
            } else {
                raw.to_string()
            };
            let count = seen.entry(base.clone()).or_insert(0);
            let key = if *count == 0 {
                base
            } else {
                format!("{}_{}", base, count)
            };
            *count += 1;
            keys.push(safe_key(&key));
        }

        let records = data
            .iter()
            .filter(|row| row.iter().any(|c| *c != Cell::Empty))
            .map(Vec::as_slice)
            .collect();
        (keys, records)
    }
}

fn safe_key(key: &str) -> String {
    if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
        return format!("item{}", key);
    }
    key.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

struct JsonWorkbook<'a>(&'a Workbook);
struct JsonSheet<'a>(&'a Sheet);
struct JsonItems<'a> {
    keys: &'a [String],
    records: &'a [&'a [Cell]],
}
struct JsonRecord<'a> {
    keys: &'a [String],
    cells: &'a [Cell],
}

impl Serialize for JsonWorkbook<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.sheets.len()))?;
        for (idx, sheet) in self.0.sheets.iter().enumerate() {
            map.serialize_entry(&format!("sheet{}", idx), &JsonSheet(sheet))?;
        }
        map.end()
    }
}

impl Serialize for JsonSheet<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (keys, records) = self.0.records();
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(
            "item",
            &JsonItems {
                keys: &keys,
                records: &records,
            },
        )?;
        map.end()
    }
}

impl Serialize for JsonItems<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.records.len()))?;
        for cells in self.records.iter().copied() {
            seq.serialize_element(&JsonRecord {
                keys: self.keys,
                cells,
            })?;
        }
        seq.end()
    }
}

impl Serialize for JsonRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.keys.len()))?;
        for (key, cell) in self.keys.iter().zip(self.cells) {
            match cell {
                Cell::Number(raw) => match raw.parse::<serde_json::Number>() {
                    Ok(number) => map.serialize_entry(key, &number)?,
                    Err(_) => map.serialize_entry(key, raw)?,
                },
                other => map.serialize_entry(key, other.as_text())?,
            }
        }
        map.end()
    }
}

// --- XML scanning -----------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Open {
        name: &'a str,
        attrs: &'a str,
        empty: bool,
    },
    Close(&'a str),
    Text(&'a str),
    Cdata(&'a str),
}

/// Tag-level tokenizer. Enough for the machine-written parts of an xlsx file.
struct Tokens<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let src = self.src;
        loop {
            let rest = &src[self.pos..];
            if rest.is_empty() {
                return None;
            }
            if !rest.starts_with('<') {
                let end = rest.find('<').unwrap_or(rest.len());
                self.pos += end;
                return Some(Token::Text(&rest[..end]));
            }
            if let Some(body) = rest.strip_prefix("<![CDATA[") {
                let end = body.find("]]>").unwrap_or(body.len());
                self.pos += "<![CDATA[".len() + end + 3;
                self.pos = self.pos.min(src.len());
                return Some(Token::Cdata(&body[..end]));
            }
            let close = rest.find('>')?;
            self.pos += close + 1;
            let inner = &rest[1..close];
            if inner.starts_with('?') || inner.starts_with('!') {
                continue;
            }
            if let Some(name) = inner.strip_prefix('/') {
                return Some(Token::Close(local_name(name.trim())));
            }
            let (inner, empty) = match inner.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (inner, false),
            };
            let split = inner
                .find(|c: char| c.is_whitespace())
                .unwrap_or(inner.len());
            return Some(Token::Open {
                name: local_name(&inner[..split]),
                attrs: &inner[split..],
                empty,
            });
        }
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

/// Value of attribute `key` (matched on the full, possibly prefixed, name).
fn attr(attrs: &str, key: &str) -> Option<String> {
    let mut rest = attrs;
    loop {
        rest = rest.trim_start();
        let eq = rest.find('=')?;
        let name = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let quote = after.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let end = after[1..].find(quote)? + 1;
        if name == key {
            return Some(unescape_xml(&after[1..end]));
        }
        rest = &after[end + 1..];
    }
}

fn unescape_xml(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let Some(end) = rest.find(';') else {
            break;
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
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
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

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn office_document_target(rels: &str) -> Option<String> {
    Tokens::new(rels).find_map(|token| match token {
        Token::Open {
            name: "Relationship",
            attrs,
            ..
        } if attr(attrs, "Type").is_some_and(|t| t.ends_with("/officeDocument")) => {
            attr(attrs, "Target").map(|t| t.trim_start_matches('/').to_string())
        }
        _ => None,
    })
}

/// Relationship id to zip path, resolved against the workbook's folder.
fn relationship_targets(rels: &str, base: &str) -> HashMap<String, String> {
    let mut targets = HashMap::new();
    for token in Tokens::new(rels) {
        if let Token::Open {
            name: "Relationship",
            attrs,
            ..
        } = token
        {
            if let (Some(id), Some(target)) = (attr(attrs, "Id"), attr(attrs, "Target")) {
                let path = match target.strip_prefix('/') {
                    Some(absolute) => absolute.to_string(),
                    None => format!("{}{}", base, target),
                };
                targets.insert(id, path);
            }
        }
    }
    targets
}

/// `(sheet name, relationship id)` in workbook order.
fn sheet_entries(workbook: &str) -> Vec<(String, String)> {
    Tokens::new(workbook)
        .filter_map(|token| match token {
            Token::Open {
                name: "sheet",
                attrs,
                ..
            } => Some((attr(attrs, "name")?, attr(attrs, "r:id")?)),
            _ => None,
        })
        .collect()
}

fn shared_strings(xml: &str) -> Vec<String> {
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut phonetic = 0usize;

    for token in Tokens::new(xml) {
        match token {
            Token::Open { name: "si", empty, .. } => {
                if empty {
                    strings.push(String::new());
                } else {
                    current = Some(String::new());
                }
            }
            Token::Close("si") => strings.push(current.take().unwrap_or_default()),
            Token::Open { name: "rPh", empty: false, .. } => phonetic += 1,
            Token::Close("rPh") => phonetic = phonetic.saturating_sub(1),
            Token::Open { name: "t", empty: false, .. } => in_text = true,
            Token::Close("t") => in_text = false,
            Token::Text(text) if in_text && phonetic == 0 => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&unescape_xml(text));
                }
            }
            Token::Cdata(text) if in_text && phonetic == 0 => {
                if let Some(s) = current.as_mut() {
                    s.push_str(text);
                }
            }
            _ => {}
        }
    }
    strings
}

/// Last column a worksheet may address (`XFD`).
const MAX_COLUMN: usize = 16_383;

/// Column index from a cell reference such as `AB12`.
///
/// References past [`MAX_COLUMN`] are rejected.
fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut index = 0usize;
    for b in letters {
        index = index
            .checked_mul(26)?
            .checked_add(usize::from(b.to_ascii_uppercase() - b'A' + 1))?;
    }
    let index = index - 1;
    (index <= MAX_COLUMN).then_some(index)
}

fn sheet_rows(xml: &str, shared: &[String]) -> Vec<Vec<Cell>> {
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    let mut row: Option<Vec<Cell>> = None;
    let mut hidden = false;

    let mut cell_col = 0usize;
    let mut cell_type = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut in_cell = false;

    for token in Tokens::new(xml) {
        match token {
            Token::Open { name: "row", attrs, empty } => {
                hidden = matches!(attr(attrs, "hidden").as_deref(), Some("1") | Some("true"));
                if empty {
                    if !hidden {
                        rows.push(Vec::new());
                    }
                } else {
                    row = Some(Vec::new());
                }
            }
            Token::Close("row") => {
                if let Some(done) = row.take() {
                    if !hidden {
                        rows.push(done);
                    }
                }
            }
            Token::Open { name: "c", attrs, empty } => {
                let next_col = row.as_ref().map_or(0, Vec::len);
                cell_col = attr(attrs, "r")
                    .and_then(|r| column_index(&r))
                    .unwrap_or(next_col);
                cell_type = attr(attrs, "t").unwrap_or_default();
                value.clear();
                in_cell = !empty;
            }
            Token::Close("c") if in_cell => {
                in_cell = false;
                let cell = cell_value(&cell_type, &value, shared);
                if let Some(current) = row.as_mut() {
                    if current.len() <= cell_col {
                        current.resize(cell_col + 1, Cell::Empty);
                    }
                    current[cell_col] = cell;
                }
            }
            Token::Open { name: "v" | "t", empty: false, .. } if in_cell => in_value = true,
            Token::Close("v" | "t") => in_value = false,
            Token::Text(text) if in_value => value.push_str(&unescape_xml(text)),
            Token::Cdata(text) if in_value => value.push_str(text),
            _ => {}
        }
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in rows.iter_mut() {
        row.resize(width, Cell::Empty);
    }
    rows
}

fn cell_value(cell_type: &str, raw: &str, shared: &[String]) -> Cell {
    match cell_type {
        "s" => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|idx| shared.get(idx))
            .map_or(Cell::Empty, |s| Cell::Text(s.clone())),
        "b" => Cell::Text(if raw.trim() == "1" { "TRUE" } else { "FALSE" }.to_string()),
        "inlineStr" | "str" | "e" => Cell::Text(raw.to_string()),
        _ if raw.is_empty() => Cell::Empty,
        _ => Cell::Number(raw.trim().to_string()),
    }
}
