//! Finds the real header row of an ERP export.
//!
//! Exports carry a variable number of title rows (company name, date range,
//! filters) above the column labels, so the header position is never fixed.

use std::collections::HashSet;

use crate::grid::Row;
use crate::normalize::{cell_label, normalize_header_label};

/// How many leading rows are scanned for the header.
pub const HEADER_SCAN_ROWS: usize = 25;

/// Normalized labels of the columns every export must have.
pub const REQUIRED_HEADER_TOKENS: [&str; 4] = ["tipo comprobante", "comprobante", "fecha", "total"];

/// A row is the header once it carries this many of the required labels.
pub const MIN_HEADER_MATCHES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLocation {
    Found(usize),
    /// Nothing qualified; row 0 is assumed. Column mapping may be garbage.
    Fallback,
}

impl HeaderLocation {
    pub fn index(&self) -> usize {
        match self {
            HeaderLocation::Found(idx) => *idx,
            HeaderLocation::Fallback => 0,
        }
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, HeaderLocation::Found(_))
    }
}

/// Number of distinct required labels present in `row`.
pub fn header_matches(row: &Row) -> usize {
    row.iter()
        .map(|cell| normalize_header_label(&cell_label(cell)))
        .filter(|label| REQUIRED_HEADER_TOKENS.contains(&label.as_str()))
        .collect::<HashSet<_>>()
        .len()
}

/// First row among the leading `scan_rows` that looks like the header.
pub fn locate_header(grid: &[Row], scan_rows: usize) -> HeaderLocation {
    grid.iter()
        .take(scan_rows)
        .position(|row| header_matches(row) >= MIN_HEADER_MATCHES)
        .map(HeaderLocation::Found)
        .unwrap_or(HeaderLocation::Fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Cell;

    fn row(cells: &[&str]) -> Row {
        cells
            .iter()
            .map(|c| if c.is_empty() { Cell::Empty } else { Cell::text(c) })
            .collect()
    }

    #[test]
    fn test_header_after_title_rows() {
        let grid = vec![
            row(&["EMPRESA S.A."]),
            row(&["Comprobantes de Servicios"]),
            row(&["Desde 01/01/2024", "Hasta 31/01/2024"]),
            row(&["TIPO COMPROBANTE", "Comprobante", "Fecha", "Total", "Proveedor"]),
            row(&["FACTURA", "0001-1", "05/03/2024", "100,00", "ACME"]),
        ];
        assert_eq!(locate_header(&grid, HEADER_SCAN_ROWS), HeaderLocation::Found(3));
    }

    #[test]
    fn test_header_accents_and_spacing() {
        let grid = vec![row(&["", "  Tipo   Comprobante", "COMPROBANTE", "Fécha", "Observaciones"])];
        assert_eq!(locate_header(&grid, HEADER_SCAN_ROWS), HeaderLocation::Found(0));
    }

    #[test]
    fn test_three_of_four_is_enough() {
        let grid = vec![
            row(&["Tipo Comprobante", "Fecha"]),
            row(&["Comprobante", "Fecha", "Total"]),
        ];
        assert_eq!(locate_header(&grid, HEADER_SCAN_ROWS), HeaderLocation::Found(1));
    }

    #[test]
    fn test_duplicate_labels_count_once() {
        let r = row(&["Fecha", "Fecha", "Fecha", "Total"]);
        assert_eq!(header_matches(&r), 2);
    }

    #[test]
    fn test_fallback_when_no_header() {
        let grid = vec![row(&["a", "b"]), row(&["1", "2"])];
        let loc = locate_header(&grid, HEADER_SCAN_ROWS);
        assert_eq!(loc, HeaderLocation::Fallback);
        assert_eq!(loc.index(), 0);
        assert!(!loc.is_detected());
    }

    #[test]
    fn test_header_beyond_scan_window_ignored() {
        let mut grid: Vec<Row> = (0..30).map(|_| row(&["titulo"])).collect();
        grid.push(row(&["Tipo Comprobante", "Comprobante", "Fecha", "Total"]));
        assert_eq!(locate_header(&grid, HEADER_SCAN_ROWS), HeaderLocation::Fallback);
        assert_eq!(locate_header(&grid, 40), HeaderLocation::Found(30));
    }

    #[test]
    fn test_empty_grid() {
        assert_eq!(locate_header(&[], HEADER_SCAN_ROWS), HeaderLocation::Fallback);
    }
}
