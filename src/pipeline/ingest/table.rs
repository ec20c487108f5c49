//! CSV and spreadsheet converters.
//!
//! Exported ledgers usually carry a title block above the data. The table is
//! taken to start at the first row with at least [`MIN_TABLE_CELLS`] non-empty
//! cells; everything above it is dropped. Rows are emitted as
//! `Row N,<cell>,<cell>,...` so later stages can cite row numbers.

use std::path::Path;

use calamine::{open_workbook_auto, Reader};

use super::IngestError;

pub const MIN_TABLE_CELLS: usize = 4;

pub const NO_TABLE_CSV: &str = "[No valid table found]";
pub const NO_TABLE_XLSX: &str = "[No valid table found in Excel]";

fn non_empty_cells<S: AsRef<str>>(row: &[S]) -> usize {
    row.iter().filter(|c| !c.as_ref().trim().is_empty()).count()
}

/// Index of the first row that looks like a table row.
pub fn table_start<S: AsRef<str>>(rows: &[Vec<S>]) -> Option<usize> {
    rows.iter().position(|row| non_empty_cells(row) >= MIN_TABLE_CELLS)
}

/// Trimmed cells without trailing empties, or `None` for a blank row.
fn clean_row<S: AsRef<str>>(row: &[S]) -> Option<String> {
    let mut cells: Vec<&str> = row.iter().map(|c| c.as_ref().trim()).collect();
    while cells.last().is_some_and(|c| c.is_empty()) {
        cells.pop();
    }
    if cells.is_empty() {
        None
    } else {
        Some(cells.join(","))
    }
}

/// CSV rendering: kept rows are numbered consecutively.
pub fn render_csv_rows<S: AsRef<str>>(rows: &[Vec<S>]) -> String {
    let Some(start) = table_start(rows) else {
        return NO_TABLE_CSV.to_string();
    };
    rows[start..]
        .iter()
        .filter_map(|row| clean_row(row))
        .enumerate()
        .map(|(i, row)| format!("Row {},{row}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Spreadsheet rendering of one sheet: rows are numbered by their position
/// in the table, so a blank row still consumes a number.
pub fn render_sheet<S: AsRef<str>>(name: &str, rows: &[Vec<S>]) -> Option<String> {
    let start = table_start(rows)?;
    let lines: Vec<String> = rows[start..]
        .iter()
        .enumerate()
        .filter_map(|(i, row)| clean_row(row).map(|r| format!("Row {},{r}", i + 1)))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(format!("Sheet: {name}\n{}", lines.join("\n")))
    }
}

/// Whole-workbook rendering; sheets without a table are omitted.
pub fn render_workbook<S: AsRef<str>>(sheets: &[(String, Vec<Vec<S>>)]) -> String {
    let rendered: Vec<String> = sheets
        .iter()
        .filter_map(|(name, rows)| render_sheet(name, rows))
        .collect();
    if rendered.is_empty() {
        NO_TABLE_XLSX.to_string()
    } else {
        rendered.join("\n\n").trim().to_string()
    }
}

pub fn convert_csv(path: &Path) -> Result<String, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    Ok(render_csv_rows(&rows))
}

pub fn convert_xlsx(path: &Path) -> Result<String, IngestError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| IngestError::Spreadsheet(e.to_string()))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| IngestError::Spreadsheet(e.to_string()))?;
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(|cell| cell.to_string()).collect())
            .collect();
        sheets.push((name, rows));
    }
    Ok(render_workbook(&sheets))
}
