//! Ledger workbook access: reading a worksheet into a grid, describing its
//! layout, and writing classified values back.

pub mod analyze;
pub mod cell;
pub mod update;
mod xml;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

pub use analyze::XlsxSheetAnalyzer;
pub use cell::{CellRef, CellValue};
pub use update::XlsxSheetUpdater;

use crate::services::classifier::ClassifiedData;

/// Rows rendered into a text description; larger sheets are cut off.
const MAX_DESCRIBED_ROWS: usize = 400;

/// Cell contents of one worksheet. This is the "sheet handle" passed between stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetGrid {
    pub name: String,
    pub cells: BTreeMap<CellRef, CellValue>,
}

impl SheetGrid {
    pub fn get(&self, row: u32, col: u32) -> Option<&CellValue> {
        self.cells.get(&CellRef::new(row, col))
    }

    /// Top-left and bottom-right corners of the populated area.
    pub fn used_range(&self) -> Option<(CellRef, CellRef)> {
        let first_row = self.cells.keys().next()?.row;
        let last_row = self.cells.keys().next_back()?.row;
        let min_col = self.cells.keys().map(|c| c.col).min()?;
        let max_col = self.cells.keys().map(|c| c.col).max()?;
        Some((CellRef::new(first_row, min_col), CellRef::new(last_row, max_col)))
    }

    /// One line per populated row: `12 | A: Cash | D: 100`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut current: Option<u32> = None;
        let mut rows = 0;
        for (cell, value) in &self.cells {
            if current != Some(cell.row) {
                rows += 1;
                if rows > MAX_DESCRIBED_ROWS {
                    out.push_str("\n...");
                    break;
                }
                if current.is_some() {
                    out.push('\n');
                }
                let _ = write!(out, "{}", cell.row);
                current = Some(cell.row);
            }
            let _ = write!(out, " | {}: {}", cell.column_letters(), value);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnHeader {
    pub column: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowLabel {
    pub row: u32,
    pub label: String,
}

/// Layout of a ledger sheet: where headers are and how rows are labelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SheetStructure {
    pub sheet_name: String,
    pub used_range: Option<String>,
    pub header_row: Option<u32>,
    pub columns: Vec<ColumnHeader>,
    pub rows: Vec<RowLabel>,
}

impl SheetStructure {
    pub fn describe(&self) -> String {
        let mut out = format!("Sheet: {}\n", self.sheet_name);
        if let Some(range) = &self.used_range {
            let _ = writeln!(out, "Used range: {}", range);
        }
        match self.header_row {
            Some(row) => {
                let _ = writeln!(out, "Header row: {}", row);
                for column in &self.columns {
                    let _ = writeln!(out, "  Column {}: {}", column.column, column.title);
                }
            }
            None => out.push_str("No header row detected\n"),
        }
        let _ = writeln!(out, "Labelled rows: {}", self.rows.len());
        for label in self.rows.iter().take(MAX_DESCRIBED_ROWS) {
            let _ = writeln!(out, "  Row {}: {}", label.row, label.label);
        }
        out
    }
}

/// Reads the named worksheet and derives its structure.
#[async_trait]
pub trait SheetAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        workbook: &Path,
        sheet_name: &str,
    ) -> Result<(SheetGrid, SheetStructure)>;
}

/// Writes classified values into a copy of the workbook and returns the copy's path.
#[async_trait]
pub trait SheetUpdater: Send + Sync {
    async fn update(
        &self,
        workbook: &Path,
        sheet_name: &str,
        data: &ClassifiedData,
    ) -> Result<PathBuf>;
}
