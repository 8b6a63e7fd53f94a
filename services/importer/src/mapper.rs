//! Maps the rows under the located header into canonical voucher rows.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::diagnostics::{Coercion, CoercionKind, Diagnostics};
use crate::error::ImportError;
use crate::grid::{Cell, Row};
use crate::normalize::{
    cell_label, cell_text, normalize_category_label, normalize_header_label, parse_date,
    parse_decimal_opt,
};

/// Billing status stored when the export has none.
pub const DEFAULT_BILLING_STATUS: &str = "ISSUED";

/// Largest magnitude a `DECIMAL(15,2)` money column accepts.
pub fn money_limit() -> Decimal {
    Decimal::new(999_999_999_999_999, 2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    VoucherType,
    VoucherNumber,
    Date,
    PostingDate,
    ProviderName,
    Details,
    CategoryName,
    Total,
    AmountPaid,
    Balance,
    BillingStatus,
    Staff,
    DueDate,
    RegistrationDate,
    Notes,
    VoidedBy,
    VoidedAt,
}

impl Field {
    pub const REQUIRED: [Field; 4] = [Field::VoucherType, Field::VoucherNumber, Field::Date, Field::Total];

    pub fn name(&self) -> &'static str {
        match self {
            Field::VoucherType => "voucherType",
            Field::VoucherNumber => "voucherNumber",
            Field::Date => "date",
            Field::PostingDate => "postingDate",
            Field::ProviderName => "providerName",
            Field::Details => "details",
            Field::CategoryName => "categoryName",
            Field::Total => "total",
            Field::AmountPaid => "amountPaid",
            Field::Balance => "balance",
            Field::BillingStatus => "billingStatus",
            Field::Staff => "staff",
            Field::DueDate => "dueDate",
            Field::RegistrationDate => "registrationDate",
            Field::Notes => "notes",
            Field::VoidedBy => "voidedBy",
            Field::VoidedAt => "voidedAt",
        }
    }

    /// Column width in characters for text fields stored in bounded columns.
    pub fn max_chars(&self) -> Option<usize> {
        match self {
            Field::VoucherType | Field::VoucherNumber | Field::BillingStatus => Some(100),
            Field::Details => Some(500),
            Field::ProviderName | Field::CategoryName | Field::Staff | Field::VoidedBy => Some(255),
            _ => None,
        }
    }
}

/// Normalized export label -> canonical field.
pub const HEADER_LOOKUP: &[(&str, Field)] = &[
    ("tipo comprobante", Field::VoucherType),
    ("comprobante", Field::VoucherNumber),
    ("fecha", Field::Date),
    ("fecha imputacion", Field::PostingDate),
    ("proveedor", Field::ProviderName),
    ("detalles", Field::Details),
    ("categoria", Field::CategoryName),
    ("categoria servicios", Field::CategoryName),
    ("total", Field::Total),
    ("monto pagado", Field::AmountPaid),
    ("saldo", Field::Balance),
    ("estado facturacion", Field::BillingStatus),
    ("personal", Field::Staff),
    ("fecha vencimiento", Field::DueDate),
    ("fecha registro", Field::RegistrationDate),
    ("observaciones", Field::Notes),
    ("personal anula", Field::VoidedBy),
    ("fecha anula", Field::VoidedAt),
];

fn lookup_field(label: &str) -> Option<Field> {
    HEADER_LOOKUP
        .iter()
        .find(|(known, _)| *known == label)
        .map(|(_, field)| *field)
}

/// The natural key of a voucher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub voucher_type: String,
    pub voucher_number: String,
    pub date: NaiveDate,
}

/// One voucher in canonical shape, still carrying free-text reference names.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRow {
    /// 1-based line in the source sheet.
    pub source_row: usize,
    pub voucher_type: Option<String>,
    pub voucher_number: Option<String>,
    pub date: Option<NaiveDate>,
    pub posting_date: Option<NaiveDate>,
    pub provider_name: Option<String>,
    pub category_name: Option<String>,
    pub details: Option<String>,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub balance: Decimal,
    pub billing_status: String,
    pub staff: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub registration_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub voided_by: Option<String>,
    pub voided_at: Option<NaiveDate>,
}

impl CanonicalRow {
    /// `None` when any part of the key is missing; such a row cannot be stored.
    pub fn natural_key(&self) -> Option<NaturalKey> {
        Some(NaturalKey {
            voucher_type: self.voucher_type.clone()?,
            voucher_number: self.voucher_number.clone()?,
            date: self.date?,
        })
    }
}

/// Column index of each recognized field in the header row.
#[derive(Debug, Default)]
pub struct ColumnMap {
    columns: HashMap<Field, usize>,
}

impl ColumnMap {
    /// Rename header labels to canonical fields. The first column wins when two
    /// labels map to the same field. Fails when a required field is missing.
    pub fn from_header(header: &Row) -> Result<Self, ImportError> {
        let labels: Vec<String> = header
            .iter()
            .map(|cell| normalize_header_label(&cell_label(cell)))
            .collect();

        let mut columns = HashMap::new();
        for (idx, label) in labels.iter().enumerate() {
            if let Some(field) = lookup_field(label) {
                columns.entry(field).or_insert(idx);
            }
        }

        let missing: Vec<&'static str> = Field::REQUIRED
            .iter()
            .filter(|f| !columns.contains_key(f))
            .map(|f| f.name())
            .collect();
        if !missing.is_empty() {
            return Err(ImportError::MissingColumns {
                missing,
                found: labels.into_iter().filter(|l| !l.is_empty()).collect(),
            });
        }

        Ok(Self { columns })
    }

    pub fn get(&self, field: Field) -> Option<usize> {
        self.columns.get(&field).copied()
    }
}

/// Map every row after `header_idx` into a [`CanonicalRow`], preserving order.
pub fn map_rows(
    grid: &[Row],
    header_idx: usize,
    diag: &dyn Diagnostics,
) -> Result<Vec<CanonicalRow>, ImportError> {
    let header = grid.get(header_idx).cloned().unwrap_or_default();
    let columns = ColumnMap::from_header(&header)?;

    tracing::debug!(
        header_row = header_idx + 1,
        mapped = columns.columns.len(),
        "column mapping ready"
    );

    Ok(grid
        .iter()
        .enumerate()
        .skip(header_idx + 1)
        .filter(|(_, row)| !row.iter().all(Cell::is_blank))
        .map(|(idx, row)| {
            RowReader {
                row,
                columns: &columns,
                line: idx + 1,
                diag,
            }
            .read()
        })
        .collect())
}

struct RowReader<'a> {
    row: &'a Row,
    columns: &'a ColumnMap,
    line: usize,
    diag: &'a dyn Diagnostics,
}

impl RowReader<'_> {
    fn cell(&self, field: Field) -> &Cell {
        const EMPTY: &Cell = &Cell::Empty;
        self.columns
            .get(field)
            .and_then(|idx| self.row.get(idx))
            .unwrap_or(EMPTY)
    }

    fn text(&self, field: Field) -> Option<String> {
        let value = cell_text(self.cell(field))?;
        Some(self.fit(field, value))
    }

    fn fit(&self, field: Field, value: String) -> String {
        match field.max_chars() {
            Some(max) if value.chars().count() > max => {
                self.diag.coerced(Coercion {
                    row: self.line,
                    column: field.name(),
                    raw: value.clone(),
                    kind: CoercionKind::Truncated { max_chars: max },
                });
                value.chars().take(max).collect()
            }
            _ => value,
        }
    }

    fn date(&self, field: Field) -> Option<NaiveDate> {
        let cell = self.cell(field);
        let parsed = parse_date(cell);
        if parsed.is_none() && !cell.is_blank() {
            self.diag.coerced(Coercion {
                row: self.line,
                column: field.name(),
                raw: cell_label(cell),
                kind: CoercionKind::DateToNull,
            });
        }
        parsed
    }

    fn money(&self, field: Field) -> Decimal {
        let cell = self.cell(field);
        match parse_decimal_opt(cell) {
            Some(value) => self.in_range(field, value, || cell_label(cell)),
            None => {
                if !cell.is_blank() {
                    self.diag.coerced(Coercion {
                        row: self.line,
                        column: field.name(),
                        raw: cell_label(cell),
                        kind: CoercionKind::DecimalToZero,
                    });
                }
                Decimal::ZERO
            }
        }
    }

    fn in_range(&self, field: Field, value: Decimal, raw: impl FnOnce() -> String) -> Decimal {
        if value.round_dp(2).abs() <= money_limit() {
            return value;
        }
        self.diag.coerced(Coercion {
            row: self.line,
            column: field.name(),
            raw: raw(),
            kind: CoercionKind::OutOfRange,
        });
        Decimal::ZERO
    }

    fn read(&self) -> CanonicalRow {
        let total = self.money(Field::Total);
        let amount_paid = self.money(Field::AmountPaid);
        // a source "Saldo" column is never trusted
        let balance = self.in_range(Field::Balance, total - amount_paid, || {
            format!("{total} - {amount_paid}")
        });

        let details = self.text(Field::Details);
        let category_name = self
            .text(Field::CategoryName)
            .or_else(|| details.as_deref().map(normalize_category_label))
            .filter(|name| !name.is_empty())
            .map(|name| self.fit(Field::CategoryName, name));

        CanonicalRow {
            source_row: self.line,
            voucher_type: self.text(Field::VoucherType),
            voucher_number: self.text(Field::VoucherNumber),
            date: self.date(Field::Date),
            posting_date: self.date(Field::PostingDate),
            provider_name: self.text(Field::ProviderName),
            category_name,
            details,
            total,
            amount_paid,
            balance,
            billing_status: self
                .text(Field::BillingStatus)
                .unwrap_or_else(|| DEFAULT_BILLING_STATUS.to_string()),
            staff: self.text(Field::Staff),
            due_date: self.date(Field::DueDate),
            registration_date: self.date(Field::RegistrationDate),
            notes: self.text(Field::Notes),
            voided_by: self.text(Field::VoidedBy),
            voided_at: self.date(Field::VoidedAt),
        }
    }
}
