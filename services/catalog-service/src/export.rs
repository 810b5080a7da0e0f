// =============================================================================
// EXPORT MODULE
// =============================================================================
// Writes an ExportTable (see mapper.rs) as a CSV or XLSX file.
//
// NOTES:
// - CSV is UTF-8 with a BOM so spreadsheet programs pick the right encoding
// - XLSX keeps numbers numeric; flags are written as "да"/"нет" text so the
//   file reads back the same way a CSV does
// - Blank cells stay blank: an unset value is never written as 0
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use rust_xlsxwriter::{Format, Workbook};

use crate::mapper::{ExportCell, ExportTable};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const SHEET_NAME: &str = "Товары";

// -----------------------------------------------------------------------------
// FORMAT
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" => Ok(ExportFormat::Xlsx),
            other => Err(format!("unknown export format '{other}', expected 'csv' or 'xlsx'")),
        }
    }
}

// -----------------------------------------------------------------------------
// WRITERS
// -----------------------------------------------------------------------------

/// Write a rendered table in `format`
pub fn export(table: &ExportTable, format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Csv => write_csv(table),
        ExportFormat::Xlsx => write_xlsx(table),
    }
}

pub fn write_csv(table: &ExportTable) -> Result<Vec<u8>> {
    let mut buffer = UTF8_BOM.to_vec();
    {
        let mut writer = csv::WriterBuilder::new().from_writer(&mut buffer);
        writer
            .write_record(&table.headers)
            .context("Failed to write CSV header")?;
        for row in &table.rows {
            writer
                .write_record(row.iter().map(ExportCell::to_text))
                .context("Failed to write CSV row")?;
        }
        writer.flush().context("Failed to flush CSV writer")?;
    }
    Ok(buffer)
}

pub fn write_xlsx(table: &ExportTable) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, header) in table.headers.iter().enumerate() {
        let col = u16::try_from(col).context("Too many export columns")?;
        sheet.write_string_with_format(0, col, header, &header_format)?;
        sheet.set_column_width(col, header.chars().count().max(10) as f64)?;
    }
    sheet.set_freeze_panes(1, 0)?;

    for (idx, row) in table.rows.iter().enumerate() {
        let row_no = u32::try_from(idx + 1).context("Too many export rows")?;
        for (col, cell) in row.iter().enumerate() {
            let col = u16::try_from(col).context("Too many export columns")?;
            match cell {
                ExportCell::Empty => {}
                ExportCell::Text(text) => {
                    sheet.write_string(row_no, col, text)?;
                }
                ExportCell::Number(value) => {
                    sheet.write_number(row_no, col, *value)?;
                }
                ExportCell::Integer(value) => {
                    sheet.write_number(row_no, col, *value as f64)?;
                }
                flag @ ExportCell::Flag(_) => {
                    sheet.write_string(row_no, col, flag.to_text())?;
                }
            }
        }
    }

    workbook
        .save_to_buffer()
        .context("Failed to render XLSX workbook")
}
