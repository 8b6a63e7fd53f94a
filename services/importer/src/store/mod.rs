//! Persistence seam.
//!
//! A run talks to its store only through [`VoucherStore`] and the transaction
//! handle it hands out. Dropping a [`StoreTx`] without calling `commit` rolls
//! the transaction back.

pub mod memory;
pub mod mysql;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fmt;

use crate::error::StoreError;
use crate::mapper::{CanonicalRow, NaturalKey};
use crate::schema::{CATEGORIES_TABLE, PROVIDERS_TABLE};

/// Which reference table a name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Provider,
    Category,
}

impl ReferenceKind {
    pub fn table(&self) -> &'static str {
        match self {
            ReferenceKind::Provider => PROVIDERS_TABLE,
            ReferenceKind::Category => CATEGORIES_TABLE,
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKind::Provider => f.write_str("provider"),
            ReferenceKind::Category => f.write_str("category"),
        }
    }
}

/// A voucher ready to be written: complete key, references resolved to ids.
#[derive(Debug, Clone, PartialEq)]
pub struct VoucherRecord {
    pub voucher_type: String,
    pub voucher_number: String,
    pub date: NaiveDate,
    pub posting_date: Option<NaiveDate>,
    pub provider_id: Option<u64>,
    pub category_id: Option<u64>,
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

impl VoucherRecord {
    pub fn new(
        key: NaturalKey,
        row: &CanonicalRow,
        provider_id: Option<u64>,
        category_id: Option<u64>,
    ) -> Self {
        Self {
            voucher_type: key.voucher_type,
            voucher_number: key.voucher_number,
            date: key.date,
            posting_date: row.posting_date,
            provider_id,
            category_id,
            details: row.details.clone(),
            total: row.total,
            amount_paid: row.amount_paid,
            balance: row.balance,
            billing_status: row.billing_status.clone(),
            staff: row.staff.clone(),
            due_date: row.due_date,
            registration_date: row.registration_date,
            notes: row.notes.clone(),
            voided_by: row.voided_by.clone(),
            voided_at: row.voided_at,
        }
    }

    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            voucher_type: self.voucher_type.clone(),
            voucher_number: self.voucher_number.clone(),
            date: self.date,
        }
    }
}

#[async_trait]
pub trait VoucherStore: Send + Sync {
    type Tx: StoreTx;

    /// Create missing tables. Returns the tables that were created.
    async fn ensure_schema(&self) -> Result<Vec<&'static str>, StoreError>;

    /// Every live (not soft-deleted) `(name, id)` pair of one reference table.
    async fn load_references(&self, kind: ReferenceKind)
        -> Result<Vec<(String, u64)>, StoreError>;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

#[async_trait]
pub trait StoreTx: Send {
    /// Exact-match lookup of a live reference row.
    async fn find_reference(
        &mut self,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<Option<u64>, StoreError>;

    /// Insert a reference row and return its id.
    async fn insert_reference(&mut self, kind: ReferenceKind, name: &str)
        -> Result<u64, StoreError>;

    /// Insert or overwrite vouchers by natural key. Returns rows affected as the
    /// backend counts them (1 per insert, 2 per changed update).
    async fn upsert_vouchers(&mut self, rows: &[VoucherRecord]) -> Result<u64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}
