//! Loads an exported spreadsheet into an untyped grid of cells.
//!
//! Workbook formats go through calamine (the container is picked from the file
//! extension). CSV exports are decoded as UTF-8, falling back to Windows-1252,
//! which is what the ERP writes on Spanish-locale desktops.

use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDateTime;
use std::path::Path;

use crate::error::ImportError;

/// A single cell value as read from the source, before any normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

impl Cell {
    pub fn text(value: &str) -> Self {
        Cell::Text(value.to_string())
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

pub type Row = Vec<Cell>;
pub type Grid = Vec<Row>;

const WORKBOOK_EXTENSIONS: &[&str] = &["xls", "xlsx", "xlsm", "xlsb", "ods"];

/// Read the whole sheet (or CSV file) at `path`.
///
/// `sheet` selects a worksheet by name; the first one is used otherwise.
pub fn load_grid(path: &Path, sheet: Option<&str>) -> Result<Grid, ImportError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if WORKBOOK_EXTENSIONS.contains(&ext.as_str()) {
        load_workbook(path, sheet)
    } else if ext == "csv" {
        let bytes = std::fs::read(path)
            .map_err(|e| ImportError::Read(format!("{}: {}", path.display(), e)))?;
        load_csv(&bytes)
    } else {
        Err(ImportError::Read(format!(
            "unsupported file extension '{}' (expected one of {:?} or csv)",
            ext, WORKBOOK_EXTENSIONS
        )))
    }
}

fn load_workbook(path: &Path, sheet: Option<&str>) -> Result<Grid, ImportError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| ImportError::Read(format!("failed to open {}: {}", path.display(), e)))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = match sheet {
        Some(wanted) => sheet_names
            .iter()
            .find(|name| name.as_str() == wanted)
            .cloned()
            .ok_or_else(|| {
                ImportError::Read(format!(
                    "sheet '{}' not found; available sheets: {:?}",
                    wanted, sheet_names
                ))
            })?,
        None => sheet_names
            .first()
            .cloned()
            .ok_or_else(|| ImportError::Read("workbook has no sheets".to_string()))?,
    };

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ImportError::Read(format!("failed to read sheet '{}': {}", sheet_name, e)))?;

    let (rows, cols) = range.get_size();
    tracing::debug!(sheet = %sheet_name, rows, cols, "loaded worksheet");

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_from_data).collect())
        .collect())
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(value) => Cell::DateTime(value),
            None => Cell::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
    }
}

/// Parse CSV bytes into a grid. Every non-blank field becomes `Cell::Text`.
pub fn load_csv(bytes: &[u8]) -> Result<Grid, ImportError> {
    let (decoded, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
    let content = if had_errors {
        encoding_rs::WINDOWS_1252.decode(bytes).0
    } else {
        decoded
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(sniff_delimiter(&content))
        .from_reader(content.as_bytes());

    let mut grid = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| ImportError::Read(format!("csv line {}: {}", line + 1, e)))?;
        grid.push(
            record
                .iter()
                .map(|field| {
                    if field.trim().is_empty() {
                        Cell::Empty
                    } else {
                        Cell::text(field)
                    }
                })
                .collect(),
        );
    }
    Ok(grid)
}

/// Spanish-locale exports use `;` because `,` is the decimal separator.
fn sniff_delimiter(content: &str) -> u8 {
    let sample = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(25)
        .fold((0usize, 0usize), |(semi, comma), line| {
            (
                semi + line.matches(';').count(),
                comma + line.matches(',').count(),
            )
        });
    if sample.0 >= sample.1 && sample.0 > 0 {
        b';'
    } else {
        b','
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_csv_semicolon_with_decimal_commas() {
        let csv = "Tipo Comprobante;Comprobante;Fecha;Total\nFACTURA;0001-1;05/03/2024;1.234,56\n";
        let grid = load_csv(csv.as_bytes()).unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[0][0], Cell::text("Tipo Comprobante"));
        assert_eq!(grid[1][3], Cell::text("1.234,56"));
    }

    #[test]
    fn test_csv_comma_delimiter() {
        let csv = "a,b,c\n1,,3\n";
        let grid = load_csv(csv.as_bytes()).unwrap();
        assert_eq!(grid[1], vec![Cell::text("1"), Cell::Empty, Cell::text("3")]);
    }

    #[test]
    fn test_csv_windows_1252_fallback() {
        // "Categoría" encoded as Windows-1252 (0xED for í)
        let bytes = b"Fecha;Categor\xeda\n01/01/2024;IMPUESTOS\n";
        let grid = load_csv(bytes).unwrap();
        assert_eq!(grid[0][1], Cell::text("Categoría"));
    }

    #[test]
    fn test_csv_utf8_bom_stripped() {
        let csv = "\u{feff}Fecha;Total\n01/01/2024;10\n";
        let grid = load_csv(csv.as_bytes()).unwrap();
        assert_eq!(grid[0][0], Cell::text("Fecha"));
    }

    #[test]
    fn test_csv_ragged_rows() {
        let csv = "Titulo\n\nTipo Comprobante;Comprobante;Fecha;Total\n";
        let grid = load_csv(csv.as_bytes()).unwrap();
        assert_eq!(grid[0].len(), 1);
        assert_eq!(grid.last().unwrap().len(), 4);
    }

    #[test]
    fn test_load_grid_from_csv_file() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "Fecha;Total").unwrap();
        writeln!(file, "01/01/2024;10").unwrap();
        let grid = load_grid(file.path(), None).unwrap();
        assert_eq!(grid.len(), 2);
    }

    #[test]
    fn test_load_grid_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        let err = load_grid(file.path(), None).unwrap_err();
        assert!(matches!(err, ImportError::Read(_)));
        assert!(err.to_string().contains("unsupported file extension"));
    }

    #[test]
    fn test_cell_is_blank() {
        assert!(Cell::Empty.is_blank());
        assert!(Cell::text("   ").is_blank());
        assert!(!Cell::Number(0.0).is_blank());
    }
}
