use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

use super::analyze::{locate_sheet, open_workbook, row_number};
use super::cell::{CellRef, CellValue};
use super::xml::{attr, prefix_of};
use super::SheetUpdater;
use crate::services::classifier::ClassifiedData;

/// Prefix of every produced artifact.
pub const OUTPUT_PREFIX: &str = "processed_";

/// Writes classified values into a copy of an `.xlsx` workbook placed next to it.
#[derive(Debug, Clone, Default)]
pub struct XlsxSheetUpdater;

#[async_trait]
impl SheetUpdater for XlsxSheetUpdater {
    async fn update(
        &self,
        workbook: &Path,
        sheet_name: &str,
        data: &ClassifiedData,
    ) -> Result<PathBuf> {
        let path = workbook.to_path_buf();
        let sheet_name = sheet_name.to_string();
        let updates = data.updates();
        tokio::task::spawn_blocking(move || update_workbook(&path, &sheet_name, &updates))
            .await
            .context("sheet update task failed")?
    }
}

/// `<dir>/processed_<stem>.xlsx` for a workbook at `<dir>/<stem>.<ext>`.
pub fn output_path_for(workbook: &Path) -> Result<PathBuf> {
    let dir = workbook
        .parent()
        .ok_or_else(|| anyhow!("workbook path has no parent directory"))?;
    let stem = workbook
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("workbook path has no usable file name"))?;
    Ok(dir.join(format!("{}{}.xlsx", OUTPUT_PREFIX, stem)))
}

/// Copies the workbook with `updates` applied to `sheet_name`.
///
/// The copy is assembled in a temporary file in the same directory and only
/// renamed into place once complete, so a failure never leaves an artifact.
pub fn update_workbook(
    workbook: &Path,
    sheet_name: &str,
    updates: &BTreeMap<CellRef, CellValue>,
) -> Result<PathBuf> {
    let output = output_path_for(workbook)?;
    let dir = output
        .parent()
        .ok_or_else(|| anyhow!("output path has no parent directory"))?;

    let mut archive = open_workbook(workbook)?;
    let sheet_part = locate_sheet(&mut archive, sheet_name)?;

    let mut sheet_xml = String::new();
    archive
        .by_name(&sheet_part)
        .with_context(|| format!("worksheet part {} is missing", sheet_part))?
        .read_to_string(&mut sheet_xml)
        .with_context(|| format!("cannot read worksheet part {}", sheet_part))?;
    let rewritten = rewrite_sheet_xml(&sheet_xml, updates)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".processing-")
        .suffix(".xlsx")
        .tempfile_in(dir)
        .context("cannot create temporary output file")?;
    {
        let mut zip = ZipWriter::new(tmp.as_file_mut());
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            if entry.name() == sheet_part {
                let name = entry.name().to_string();
                drop(entry);
                let options =
                    FileOptions::default().compression_method(CompressionMethod::Deflated);
                zip.start_file(name, options)?;
                zip.write_all(&rewritten)?;
            } else {
                zip.raw_copy_file(entry)?;
            }
        }
        zip.finish()?;
    }
    tmp.as_file().sync_all()?;

    tmp.persist_noclobber(&output)
        .map_err(|e| anyhow!("cannot write {}: {}", output.display(), e.error))?;

    tracing::info!(
        "Wrote {} cell(s) to sheet {:?} in {}",
        updates.len(),
        sheet_name,
        output.display()
    );
    Ok(output)
}

/// Streams the worksheet XML through unchanged except for the updated cells.
///
/// Existing cells are replaced in place (keeping their style), missing cells
/// and rows are inserted at their ordered position.
pub fn rewrite_sheet_xml(xml: &str, updates: &BTreeMap<CellRef, CellValue>) -> Result<Vec<u8>> {
    let mut pending: BTreeMap<u32, BTreeMap<u32, &CellValue>> = BTreeMap::new();
    for (cell, value) in updates {
        pending.entry(cell.row).or_default().insert(cell.col, value);
    }

    let mut rewriter = SheetRewriter {
        writer: Writer::new(Vec::with_capacity(xml.len() + updates.len() * 64)),
        pending,
        row_pending: BTreeMap::new(),
        current_row: None,
        last_row: 0,
        last_col: 0,
        prefix: String::new(),
    };

    let mut reader = Reader::from_str(xml);
    let mut in_sheet_data = false;
    let mut saw_sheet_data = false;
    // Some(depth) while skipping the body of a replaced cell
    let mut skipping: Option<usize> = None;

    loop {
        let event = reader.read_event()?;

        if let Some(depth) = skipping.as_mut() {
            match &event {
                Event::Start(_) => *depth += 1,
                Event::End(_) if *depth == 0 => skipping = None,
                Event::End(_) => *depth -= 1,
                Event::Eof => bail!("worksheet ended inside a cell"),
                _ => {}
            }
            continue;
        }

        match event {
            Event::Eof => break,
            Event::Start(e) => match e.local_name().as_ref() {
                b"sheetData" => {
                    rewriter.prefix = prefix_of(&e);
                    in_sheet_data = true;
                    saw_sheet_data = true;
                    rewriter.write(Event::Start(e))?;
                }
                b"row" if in_sheet_data => {
                    let row = row_number(&e, rewriter.last_row);
                    rewriter.open_row(row)?;
                    rewriter.write(Event::Start(e))?;
                }
                b"c" if rewriter.current_row.is_some() => {
                    if rewriter.visit_cell(&e)? {
                        skipping = Some(0);
                    } else {
                        rewriter.write(Event::Start(e))?;
                    }
                }
                _ => rewriter.write(Event::Start(e))?,
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"sheetData" => {
                    rewriter.prefix = prefix_of(&e);
                    saw_sheet_data = true;
                    rewriter.write(Event::Start(e.borrow()))?;
                    rewriter.flush_rows_before(u32::MAX)?;
                    rewriter.write(Event::End(e.to_end()))?;
                }
                b"row" if in_sheet_data => {
                    let row = row_number(&e, rewriter.last_row);
                    rewriter.flush_rows_before(row)?;
                    rewriter.last_row = row;
                    match rewriter.pending.remove(&row) {
                        Some(cells) => {
                            rewriter.write(Event::Start(e.borrow()))?;
                            for (col, value) in cells {
                                rewriter.write_cell(CellRef::new(row, col), value, None)?;
                            }
                            rewriter.write(Event::End(e.to_end()))?;
                        }
                        None => rewriter.write(Event::Empty(e))?,
                    }
                }
                b"c" if rewriter.current_row.is_some() => {
                    // an empty cell has no body to skip
                    if !rewriter.visit_cell(&e)? {
                        rewriter.write(Event::Empty(e))?;
                    }
                }
                _ => rewriter.write(Event::Empty(e))?,
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"row" if rewriter.current_row.is_some() => {
                    rewriter.close_row()?;
                    rewriter.write(Event::End(e))?;
                }
                b"sheetData" => {
                    rewriter.flush_rows_before(u32::MAX)?;
                    in_sheet_data = false;
                    rewriter.write(Event::End(e))?;
                }
                _ => rewriter.write(Event::End(e))?,
            },
            other => rewriter.write(other)?,
        }
    }

    if !saw_sheet_data {
        bail!("worksheet has no sheetData element");
    }
    Ok(rewriter.writer.into_inner())
}

struct SheetRewriter<'u> {
    writer: Writer<Vec<u8>>,
    /// row -> column -> value, for rows not reached yet
    pending: BTreeMap<u32, BTreeMap<u32, &'u CellValue>>,
    /// column -> value for the row currently open
    row_pending: BTreeMap<u32, &'u CellValue>,
    current_row: Option<u32>,
    last_row: u32,
    last_col: u32,
    prefix: String,
}

impl<'u> SheetRewriter<'u> {
    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer.write_event(event)?;
        Ok(())
    }

    fn name(&self, local: &str) -> String {
        format!("{}{}", self.prefix, local)
    }

    fn open_row(&mut self, row: u32) -> Result<()> {
        self.flush_rows_before(row)?;
        self.row_pending = self.pending.remove(&row).unwrap_or_default();
        self.current_row = Some(row);
        self.last_row = row;
        self.last_col = 0;
        Ok(())
    }

    fn close_row(&mut self) -> Result<()> {
        self.flush_row_cells_before(u32::MAX)?;
        self.current_row = None;
        Ok(())
    }

    /// Handles a cell start tag. Returns true when the cell was replaced and its
    /// original body must be skipped.
    fn visit_cell(&mut self, e: &BytesStart<'_>) -> Result<bool> {
        let Some(row) = self.current_row else {
            return Ok(false);
        };
        let col = attr(e, b"r")
            .and_then(|r| r.parse::<CellRef>().ok())
            .map(|cell| cell.col)
            .unwrap_or(self.last_col + 1);
        self.last_col = col;

        self.flush_row_cells_before(col)?;
        match self.row_pending.remove(&col) {
            Some(value) => {
                let style = attr(e, b"s");
                self.write_cell(CellRef::new(row, col), value, style.as_deref())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn flush_row_cells_before(&mut self, col_limit: u32) -> Result<()> {
        let Some(row) = self.current_row else {
            return Ok(());
        };
        while let Some((&col, _)) = self.row_pending.first_key_value() {
            if col >= col_limit {
                break;
            }
            if let Some((col, value)) = self.row_pending.pop_first() {
                self.write_cell(CellRef::new(row, col), value, None)?;
            }
        }
        Ok(())
    }

    fn flush_rows_before(&mut self, row_limit: u32) -> Result<()> {
        while let Some((&row, _)) = self.pending.first_key_value() {
            if row >= row_limit {
                break;
            }
            let Some((row, cells)) = self.pending.pop_first() else {
                break;
            };
            let row_name = self.name("row");
            let row_text = row.to_string();
            let mut start = BytesStart::new(row_name.clone());
            start.push_attribute(("r", row_text.as_str()));
            self.write(Event::Start(start))?;
            for (col, value) in cells {
                self.write_cell(CellRef::new(row, col), value, None)?;
            }
            self.write(Event::End(BytesEnd::new(row_name)))?;
            self.last_row = self.last_row.max(row);
        }
        Ok(())
    }

    fn write_cell(&mut self, cell: CellRef, value: &CellValue, style: Option<&str>) -> Result<()> {
        let cell_name = self.name("c");
        let reference = cell.to_string();
        let mut start = BytesStart::new(cell_name.clone());
        start.push_attribute(("r", reference.as_str()));
        if let Some(style) = style {
            start.push_attribute(("s", style));
        }

        match value {
            CellValue::Number(n) => {
                if !n.is_finite() {
                    bail!("cannot write non-finite number to {}", cell);
                }
                self.write(Event::Start(start))?;
                self.write_text_element("v", &n.to_string(), false)?;
            }
            CellValue::Bool(b) => {
                start.push_attribute(("t", "b"));
                self.write(Event::Start(start))?;
                self.write_text_element("v", if *b { "1" } else { "0" }, false)?;
            }
            CellValue::Text(text) => {
                start.push_attribute(("t", "inlineStr"));
                self.write(Event::Start(start))?;
                let is_name = self.name("is");
                self.write(Event::Start(BytesStart::new(is_name.clone())))?;
                self.write_text_element("t", text, true)?;
                self.write(Event::End(BytesEnd::new(is_name)))?;
            }
        }

        self.write(Event::End(BytesEnd::new(cell_name)))
    }

    fn write_text_element(&mut self, local: &str, text: &str, preserve: bool) -> Result<()> {
        let name = self.name(local);
        let mut start = BytesStart::new(name.clone());
        if preserve {
            start.push_attribute(("xml:space", "preserve"));
        }
        self.write(Event::Start(start))?;
        self.write(Event::Text(BytesText::new(text)))?;
        self.write(Event::End(BytesEnd::new(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::spreadsheet::analyze::analyze_workbook;
    use crate::services::spreadsheet::testing::{LEDGER_SHEET, ledger_workbook};

    fn updates(items: &[(&str, CellValue)]) -> BTreeMap<CellRef, CellValue> {
        items
            .iter()
            .map(|(r, v)| (r.parse().unwrap(), v.clone()))
            .collect()
    }

    #[test]
    fn test_rewrite_replaces_and_inserts_in_order() {
        let xml = LEDGER_SHEET;
        let out = rewrite_sheet_xml(
            xml,
            &updates(&[
                ("C2", CellValue::Number(99.0)),
                ("C4", CellValue::Text("R&D <east>".into())),
                ("B3", CellValue::Number(7.25)),
                ("D2", CellValue::Bool(true)),
                ("A9", CellValue::Text("Total".into())),
            ]),
        )
        .unwrap();
        let out = String::from_utf8(out).unwrap();

        // C2 keeps its style and loses the old value
        assert!(out.contains(r#"<c r="C2" s="3"><v>99</v></c>"#));
        assert!(!out.contains("1500.5"));
        // D2 appended after C2 within row 2
        assert!(out.contains(r#"<v>99</v></c><c r="D2" t="b"><v>1</v></c></row>"#));
        // the empty styled C4 becomes an inline string
        assert!(out.contains(
            r#"<c r="C4" s="3" t="inlineStr"><is><t xml:space="preserve">R&amp;D &lt;east&gt;</t></is></c>"#
        ));
        // row 3 inserted between rows 2 and 4
        let row3 = out.find(r#"<row r="3"><c r="B3"><v>7.25</v></c></row>"#).unwrap();
        assert!(out.find(r#"<row r="2">"#).unwrap() < row3);
        assert!(row3 < out.find(r#"<row r="4">"#).unwrap());
        // row 9 appended before sheetData closes
        assert!(out.contains(
            r#"<row r="9"><c r="A9" t="inlineStr"><is><t xml:space="preserve">Total</t></is></c></row></sheetData>"#
        ));
        // untouched content survives
        assert!(out.contains(r#"<pageMargins left="0.7""#));
    }

    #[test]
    fn test_rewrite_fills_empty_sheet_data() {
        let xml = r#"<worksheet><sheetData/></worksheet>"#;
        let out = rewrite_sheet_xml(xml, &updates(&[("B2", CellValue::Number(1.0))])).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"<worksheet><sheetData><row r="2"><c r="B2"><v>1</v></c></row></sheetData></worksheet>"#
        );
    }

    #[test]
    fn test_update_workbook_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("abc_ledger.xlsx");
        ledger_workbook(&input);

        let output = update_workbook(
            &input,
            "COA i-Kcal",
            &updates(&[("C4", CellValue::Number(250000.0))]),
        )
        .unwrap();

        assert_eq!(output, dir.path().join("processed_abc_ledger.xlsx"));
        let (grid, _) = analyze_workbook(&output, "COA i-Kcal").unwrap();
        assert_eq!(grid.get(4, 3), Some(&CellValue::Number(250000.0)));
        assert_eq!(grid.get(2, 3), Some(&CellValue::Number(1500.5)));
        // the other sheet is carried over untouched
        assert!(analyze_workbook(&output, "Summary").is_ok());
        // only the input and the output remain, no temporary files
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_update_unknown_sheet_produces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("abc_ledger.xlsx");
        ledger_workbook(&input);

        let result = update_workbook(&input, "Missing", &updates(&[("A1", CellValue::Bool(false))]));

        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_output_path_for() {
        let path = output_path_for(Path::new("/srv/uploads/0f3a_ledger.xls")).unwrap();
        assert_eq!(path, Path::new("/srv/uploads/processed_0f3a_ledger.xlsx"));
    }
}
