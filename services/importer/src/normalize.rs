//! Value normalizers: locale-formatted cell content into canonical values.
//!
//! All of these are total. Garbage in yields zero, `None` or an empty string,
//! never an error; the mapper decides whether a coercion is worth reporting.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::grid::Cell;

// =============================================================================
// Decimals
// =============================================================================

/// Parse a money cell. Blank or unparsable input is zero.
pub fn parse_decimal(cell: &Cell) -> Decimal {
    parse_decimal_opt(cell).unwrap_or(Decimal::ZERO)
}

/// Like [`parse_decimal`] but tells blank/unparsable apart from a real zero.
///
/// Text is read in the Argentine export format: `.` and whitespace are
/// thousands separators, `,` is the decimal mark.
pub fn parse_decimal_opt(cell: &Cell) -> Option<Decimal> {
    match cell {
        Cell::Number(f) if f.is_finite() => Decimal::from_str(&f.to_string()).ok(),
        Cell::Text(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| *c != '.' && !c.is_whitespace())
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            Decimal::from_str(&cleaned).ok()
        }
        _ => None,
    }
}

// =============================================================================
// Dates
// =============================================================================

const ISO_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const DAY_FIRST_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y"];

/// Parse a date cell. Native datetimes pass through; text is tried as ISO,
/// then `DD/MM/YYYY` / `DD-MM-YYYY`, then a lenient day-first reading.
pub fn parse_date(cell: &Cell) -> Option<NaiveDate> {
    match cell {
        Cell::DateTime(dt) => Some(dt.date()),
        Cell::Text(s) => parse_date_text(s),
        _ => None,
    }
}

pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let s = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if s.is_empty() {
        return None;
    }

    if looks_iso(&s) {
        if let Ok(d) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
            return Some(d);
        }
        if let Some(dt) = ISO_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&s, fmt).ok())
        {
            return Some(dt.date());
        }
    }

    DAY_FIRST_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&s, fmt).ok())
        .or_else(|| parse_day_first_lenient(&s))
}

fn looks_iso(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 10 && b[..4].iter().all(u8::is_ascii_digit) && b[4] == b'-'
}

/// Last resort: `D/M/Y`, `D.M.YY`, `YYYY/M/D` with an optional trailing time.
/// Falls back to month-first only when the day-first reading is impossible.
fn parse_day_first_lenient(s: &str) -> Option<NaiveDate> {
    let date_part = s
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()
        .unwrap_or_default();

    let parts: Vec<&str> = date_part.split(['/', '-', '.']).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    let nums: Vec<u32> = parts.iter().filter_map(|p| p.parse().ok()).collect();
    if nums.len() != 3 {
        return None;
    }

    if parts[0].len() == 4 {
        return NaiveDate::from_ymd_opt(nums[0] as i32, nums[1], nums[2]);
    }

    let year = match parts[2].len() {
        1 | 2 if nums[2] < 70 => 2000 + nums[2] as i32,
        1 | 2 => 1900 + nums[2] as i32,
        4 => nums[2] as i32,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, nums[1], nums[0])
        .or_else(|| NaiveDate::from_ymd_opt(year, nums[0], nums[1]))
}

// =============================================================================
// Labels
// =============================================================================

/// Collapse cosmetic duplicates in a comma-separated category label.
///
/// `"IMPUESTOS, IMPUESTOS"` -> `"IMPUESTOS"`, `"A, B, a"` -> `"A, B"`. The first
/// spelling of each token wins and order is preserved.
pub fn normalize_category_label(raw: &str) -> String {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter(|part| seen.insert(part.to_lowercase()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Case-fold, strip diacritics and collapse whitespace: `" Categoría  Servicios"`
/// -> `"categoria servicios"`.
pub fn normalize_header_label(raw: &str) -> String {
    raw.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Cell text
// =============================================================================

/// Text rendering of any cell, used for header labels. Blank is `""`.
pub fn cell_label(cell: &Cell) -> String {
    cell_text(cell).unwrap_or_default()
}

/// Trimmed text of a cell, `None` when blank. Integral numbers lose their
/// `.0` so that a voucher number read as `1234.0` stays `"1234"`.
pub fn cell_text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Empty => None,
        Cell::Text(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Cell::Number(f) => Some(format_number(*f)),
        Cell::Bool(b) => Some(b.to_string()),
        Cell::DateTime(dt) => Some(dt.to_string()),
    }
}

fn format_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}
