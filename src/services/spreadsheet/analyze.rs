use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use zip::ZipArchive;

use super::cell::{CellRef, CellValue, MAX_ROWS, column_letters};
use super::xml::{attr, attr_local, read_entry, resolve_entity, unescape};
use super::{ColumnHeader, RowLabel, SheetAnalyzer, SheetGrid, SheetStructure};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const DEFAULT_SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

/// Reads `.xlsx` workbooks (Office Open XML). Legacy `.xls` files are rejected.
#[derive(Debug, Clone, Default)]
pub struct XlsxSheetAnalyzer;

#[async_trait]
impl SheetAnalyzer for XlsxSheetAnalyzer {
    async fn analyze(
        &self,
        workbook: &Path,
        sheet_name: &str,
    ) -> Result<(SheetGrid, SheetStructure)> {
        let path = workbook.to_path_buf();
        let sheet_name = sheet_name.to_string();
        tokio::task::spawn_blocking(move || analyze_workbook(&path, &sheet_name))
            .await
            .context("sheet analysis task failed")?
    }
}

pub fn analyze_workbook(path: &Path, sheet_name: &str) -> Result<(SheetGrid, SheetStructure)> {
    let mut archive = open_workbook(path)?;
    let grid = read_sheet(&mut archive, sheet_name)?;
    let structure = describe_structure(&grid);
    tracing::debug!(
        "Analyzed sheet {:?}: {} cells, header row {:?}, {} labelled rows",
        sheet_name,
        grid.cells.len(),
        structure.header_row,
        structure.rows.len()
    );
    Ok((grid, structure))
}

pub(crate) fn open_workbook(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file =
        File::open(path).with_context(|| format!("cannot open workbook {}", path.display()))?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| {
        anyhow!(
            "{} is not an .xlsx workbook ({}); legacy .xls files are not supported",
            path.display(),
            e
        )
    })
}

pub fn read_sheet<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    sheet_name: &str,
) -> Result<SheetGrid> {
    let sheet_part = locate_sheet(archive, sheet_name)?;
    let rels = read_entry(archive, WORKBOOK_RELS_PART)?.unwrap_or_default();
    let shared_part = relationship_target_by_type(&rels, "/sharedStrings")?
        .map(|target| resolve_target(&target))
        .unwrap_or_else(|| DEFAULT_SHARED_STRINGS_PART.to_string());

    let shared = match read_entry(archive, &shared_part)? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };

    let xml = read_entry(archive, &sheet_part)?
        .ok_or_else(|| anyhow!("worksheet part {} is missing", sheet_part))?;

    Ok(SheetGrid {
        name: sheet_name.to_string(),
        cells: parse_sheet(&xml, &shared)?,
    })
}

/// Archive path of the worksheet called `sheet_name`, e.g. `xl/worksheets/sheet2.xml`.
pub(crate) fn locate_sheet<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    sheet_name: &str,
) -> Result<String> {
    let workbook = read_entry(archive, WORKBOOK_PART)?
        .ok_or_else(|| anyhow!("{} is missing from the workbook", WORKBOOK_PART))?;
    let sheets = list_sheets(&workbook)?;

    let rel_id = sheets
        .iter()
        .find(|(name, _)| name == sheet_name)
        .map(|(_, id)| id.clone())
        .ok_or_else(|| {
            let available: Vec<&str> = sheets.iter().map(|(name, _)| name.as_str()).collect();
            anyhow!(
                "worksheet {:?} not found; available sheets: {}",
                sheet_name,
                available.join(", ")
            )
        })?;

    let rels = read_entry(archive, WORKBOOK_RELS_PART)?
        .ok_or_else(|| anyhow!("{} is missing from the workbook", WORKBOOK_RELS_PART))?;
    let target = relationship_target_by_id(&rels, &rel_id)?
        .ok_or_else(|| anyhow!("no relationship {} for sheet {:?}", rel_id, sheet_name))?;

    Ok(resolve_target(&target))
}

/// `(name, relationship id)` for each sheet, in workbook order.
fn list_sheets(workbook_xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(workbook_xml);
    let mut sheets = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                if let (Some(name), Some(id)) = (attr(&e, b"name"), attr_local(&e, b"id")) {
                    sheets.push((name, id));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(sheets)
}

fn relationship_target_by_id(rels_xml: &str, id: &str) -> Result<Option<String>> {
    find_relationship(rels_xml, |e| attr(e, b"Id").as_deref() == Some(id))
}

fn relationship_target_by_type(rels_xml: &str, type_suffix: &str) -> Result<Option<String>> {
    find_relationship(rels_xml, |e| {
        attr(e, b"Type").is_some_and(|t| t.ends_with(type_suffix))
    })
}

fn find_relationship(
    rels_xml: &str,
    matches: impl Fn(&BytesStart<'_>) -> bool,
) -> Result<Option<String>> {
    let mut reader = Reader::from_str(rels_xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e)
                if e.local_name().as_ref() == b"Relationship" && matches(&e) =>
            {
                return Ok(attr(&e, b"Target"));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Relationship targets are relative to `xl/` unless absolute within the package.
fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target.trim_start_matches("./")),
    }
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut capture = false;
    // phonetic runs repeat the text in another script
    let mut in_phonetic = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => in_phonetic = true,
                b"t" if current.is_some() && !in_phonetic => capture = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(e) if capture => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&unescape(&String::from_utf8_lossy(e.as_ref())));
                }
            }
            Event::GeneralRef(e) if capture => {
                if let Some(s) = current.as_mut() {
                    push_entity(s, e.as_ref());
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => capture = false,
                b"rPh" => in_phonetic = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(strings)
}

fn push_entity(out: &mut String, raw: &[u8]) {
    let name = String::from_utf8_lossy(raw);
    match resolve_entity(&name) {
        Some(c) => out.push(c),
        None => {
            out.push('&');
            out.push_str(&name);
            out.push(';');
        }
    }
}

struct PendingCell {
    at: CellRef,
    kind: String,
    raw: String,
}

impl PendingCell {
    fn start(e: &BytesStart<'_>, row: u32, last_col: &mut u32) -> Self {
        let at = attr(e, b"r")
            .and_then(|r| r.parse::<CellRef>().ok())
            .unwrap_or_else(|| CellRef::new(row.max(1), *last_col + 1));
        *last_col = at.col;
        Self {
            at,
            kind: attr(e, b"t").unwrap_or_else(|| "n".to_string()),
            raw: String::new(),
        }
    }

    fn into_value(self, shared: &[String]) -> Result<Option<CellValue>> {
        let raw = self.raw;
        let value = match self.kind.as_str() {
            "s" => {
                let index: usize = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("bad shared string index in {}", self.at))?;
                let text = shared
                    .get(index)
                    .ok_or_else(|| anyhow!("shared string {} out of range in {}", index, self.at))?;
                CellValue::Text(text.clone())
            }
            "b" => CellValue::Bool(raw.trim() == "1"),
            "inlineStr" | "str" | "e" => CellValue::Text(raw),
            _ => match raw.trim() {
                "" => return Ok(None),
                trimmed => trimmed
                    .parse::<f64>()
                    .map(CellValue::Number)
                    .unwrap_or(CellValue::Text(raw)),
            },
        };

        Ok(match value {
            CellValue::Text(t) if t.trim().is_empty() => None,
            other => Some(other),
        })
    }
}

fn parse_sheet(xml: &str, shared: &[String]) -> Result<BTreeMap<CellRef, CellValue>> {
    let mut reader = Reader::from_str(xml);
    let mut cells = BTreeMap::new();
    let mut row: u32 = 0;
    let mut last_col: u32 = 0;
    let mut cell: Option<PendingCell> = None;
    let mut capture = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => {
                    row = row_number(&e, row);
                    last_col = 0;
                }
                b"c" => cell = Some(PendingCell::start(&e, row, &mut last_col)),
                b"v" | b"t" if cell.is_some() => capture = true,
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"row" => {
                    row = row_number(&e, row);
                    last_col = 0;
                }
                b"c" => {
                    // valueless (styled) cell: only advances the column
                    let _ = PendingCell::start(&e, row, &mut last_col);
                }
                _ => {}
            },
            Event::Text(e) if capture => {
                if let Some(c) = cell.as_mut() {
                    c.raw.push_str(&unescape(&String::from_utf8_lossy(e.as_ref())));
                }
            }
            Event::GeneralRef(e) if capture => {
                if let Some(c) = cell.as_mut() {
                    push_entity(&mut c.raw, e.as_ref());
                }
            }
            Event::CData(e) if capture => {
                if let Some(c) = cell.as_mut() {
                    c.raw.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    if let Some(pending) = cell.take() {
                        let at = pending.at;
                        if let Some(value) = pending.into_value(shared)? {
                            cells.insert(at, value);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(cells)
}

pub(crate) fn row_number(e: &BytesStart<'_>, previous: u32) -> u32 {
    attr(e, b"r")
        .and_then(|r| r.trim().parse().ok())
        .filter(|r| (1..=MAX_ROWS).contains(r))
        .unwrap_or_else(|| previous.saturating_add(1))
}

/// Finds the header row (first row with at least two text cells) and the label
/// of every row below it.
pub fn describe_structure(grid: &SheetGrid) -> SheetStructure {
    let mut by_row: BTreeMap<u32, Vec<(u32, &str)>> = BTreeMap::new();
    for (cell, value) in &grid.cells {
        let entry = by_row.entry(cell.row).or_default();
        if let Some(text) = value.as_text() {
            entry.push((cell.col, text.trim()));
        }
    }

    let header_row = by_row
        .iter()
        .find(|(_, texts)| texts.len() >= 2)
        .map(|(row, _)| *row);

    let columns = header_row
        .and_then(|row| by_row.get(&row))
        .map(|texts| {
            texts
                .iter()
                .map(|(col, title)| ColumnHeader {
                    column: column_letters(*col),
                    title: title.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let rows = by_row
        .iter()
        .filter(|(row, _)| header_row.is_none_or(|h| **row > h))
        .filter(|(_, texts)| !texts.is_empty())
        .map(|(row, texts)| RowLabel {
            row: *row,
            label: texts
                .iter()
                .take(2)
                .map(|(_, t)| *t)
                .collect::<Vec<_>>()
                .join(" - "),
        })
        .collect();

    SheetStructure {
        sheet_name: grid.name.clone(),
        used_range: grid
            .used_range()
            .map(|(start, end)| format!("{}:{}", start, end)),
        header_row,
        columns,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::spreadsheet::testing::ledger_workbook;

    #[test]
    fn test_analyze_ledger_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.xlsx");
        ledger_workbook(&path);

        let (grid, structure) = analyze_workbook(&path, "COA i-Kcal").unwrap();

        assert_eq!(grid.get(1, 3), Some(&CellValue::Text("Amount (IDR)".into())));
        assert_eq!(grid.get(2, 1), Some(&CellValue::Text("Cash & Bank".into())));
        assert_eq!(grid.get(2, 2), Some(&CellValue::Text("Petty cash".into())));
        assert_eq!(grid.get(2, 3), Some(&CellValue::Number(1500.5)));
        assert_eq!(grid.get(4, 3), None);

        assert_eq!(structure.header_row, Some(1));
        assert_eq!(structure.used_range.as_deref(), Some("A1:C4"));
        assert_eq!(structure.columns.len(), 3);
        assert_eq!(structure.columns[2].column, "C");
        assert_eq!(
            structure.rows,
            vec![
                RowLabel {
                    row: 2,
                    label: "Cash & Bank - Petty cash".into()
                },
                RowLabel {
                    row: 4,
                    label: "Office Supplies".into()
                },
            ]
        );
    }

    #[test]
    fn test_missing_sheet_lists_available() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.xlsx");
        ledger_workbook(&path);

        let err = analyze_workbook(&path, "Nope").unwrap_err().to_string();
        assert!(err.contains("\"Nope\""));
        assert!(err.contains("Summary, COA i-Kcal"));
    }

    #[test]
    fn test_legacy_xls_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.xls");
        std::fs::write(&path, [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]).unwrap();

        let err = analyze_workbook(&path, "COA i-Kcal").unwrap_err().to_string();
        assert!(err.contains("legacy .xls"));
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(resolve_target("worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(resolve_target("/xl/worksheets/sheet2.xml"), "xl/worksheets/sheet2.xml");
    }

    #[test]
    fn test_cells_without_reference_follow_previous() {
        let xml = r#"<worksheet><sheetData><row><c t="inlineStr"><is><t>a</t></is></c><c><v>2</v></c></row><row><c t="b"><v>1</v></c></row></sheetData></worksheet>"#;
        let cells = parse_sheet(xml, &[]).unwrap();
        assert_eq!(cells.get(&CellRef::new(1, 1)), Some(&CellValue::Text("a".into())));
        assert_eq!(cells.get(&CellRef::new(1, 2)), Some(&CellValue::Number(2.0)));
        assert_eq!(cells.get(&CellRef::new(2, 1)), Some(&CellValue::Bool(true)));
    }

    #[test]
    fn test_row_number_out_of_range() {
        let huge = BytesStart::from_content(r#"row r="4294967295""#, 3);
        assert_eq!(row_number(&huge, 5), 6);
        let past_limit = BytesStart::from_content(r#"row r="1048577""#, 3);
        assert_eq!(row_number(&past_limit, 9), 10);
        let last = BytesStart::from_content(r#"row r="1048576""#, 3);
        assert_eq!(row_number(&last, 9), MAX_ROWS);

        assert_eq!(row_number(&BytesStart::new("row"), u32::MAX), u32::MAX);
    }
}
