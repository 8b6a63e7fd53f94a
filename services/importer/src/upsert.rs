//! Batched, idempotent voucher upserts.
//!
//! Rows are sorted by natural key so concurrent importers take row locks in the
//! same order, then written in fixed-size batches, one transaction each. A
//! batch that hits lock contention is rolled back and retried whole with
//! exponential backoff; any other failure stops the run. Batches committed
//! before a failure stay committed.

use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::diagnostics::{Coercion, CoercionKind, Diagnostics};
use crate::error::{ImportError, StoreError};
use crate::mapper::{CanonicalRow, NaturalKey};
use crate::resolver::ReferenceResolver;
use crate::store::{ReferenceKind, StoreTx, VoucherRecord, VoucherStore};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    /// Total tries per batch, the first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(8),
        }
    }
}

/// Wait after the `attempt`-th failed try (1-based): `base * 2^(attempt-1)`,
/// capped at `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct UpsertSummary {
    /// Rows written by committed batches.
    pub upserted: usize,
    /// Rows dropped for an incomplete natural key.
    pub skipped: usize,
    pub batches: usize,
    pub rows_affected: u64,
    /// Lock-contention retries across all batches.
    pub retries: u32,
}

pub struct BatchUpsertEngine<'a, S: VoucherStore> {
    store: &'a S,
    resolver: &'a mut ReferenceResolver,
    settings: BatchSettings,
    diag: &'a dyn Diagnostics,
}

impl<'a, S: VoucherStore> BatchUpsertEngine<'a, S> {
    pub fn new(
        store: &'a S,
        resolver: &'a mut ReferenceResolver,
        settings: BatchSettings,
        diag: &'a dyn Diagnostics,
    ) -> Self {
        Self {
            store,
            resolver,
            settings,
            diag,
        }
    }

    pub async fn run(&mut self, rows: Vec<CanonicalRow>) -> Result<UpsertSummary, ImportError> {
        let mut summary = UpsertSummary::default();

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            match row.natural_key() {
                Some(key) => keyed.push((key, row)),
                None => {
                    summary.skipped += 1;
                    self.diag.coerced(Coercion {
                        row: row.source_row,
                        column: "naturalKey",
                        raw: format!(
                            "{} | {} | {}",
                            row.voucher_type.as_deref().unwrap_or(""),
                            row.voucher_number.as_deref().unwrap_or(""),
                            row.date.map(|d| d.to_string()).unwrap_or_default()
                        ),
                        kind: CoercionKind::IncompleteKey,
                    });
                }
            }
        }

        keyed.sort_by(|(a, _), (b, _)| lock_order(a).cmp(&lock_order(b)));

        let total = keyed.len();
        let batch_size = self.settings.batch_size.max(1);
        for (idx, chunk) in keyed.chunks(batch_size).enumerate() {
            let batch = idx + 1;
            let (affected, retries) = self.commit_batch(batch, chunk, summary.upserted).await?;
            summary.upserted += chunk.len();
            summary.batches += 1;
            summary.rows_affected += affected;
            summary.retries += retries;
            info!(
                batch,
                committed = summary.upserted,
                total,
                "batch committed"
            );
        }

        Ok(summary)
    }

    /// Run one batch to completion. Returns rows affected and retries used.
    async fn commit_batch(
        &mut self,
        batch: usize,
        rows: &[(NaturalKey, CanonicalRow)],
        committed: usize,
    ) -> Result<(u64, u32), ImportError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_batch(rows).await {
                Ok((affected, unresolved)) => {
                    self.resolver.commit_batch();
                    for event in unresolved {
                        self.diag.coerced(event);
                    }
                    return Ok((affected, attempt - 1));
                }
                Err(err) => {
                    self.resolver.discard_batch();
                    if !err.is_transient() {
                        return Err(ImportError::BatchFailed {
                            batch,
                            attempts: attempt,
                            committed,
                            source: err,
                        });
                    }
                    if attempt >= max_attempts {
                        return Err(ImportError::RetriesExhausted {
                            batch,
                            attempts: attempt,
                            committed,
                            source: err,
                        });
                    }
                    let delay = backoff_delay(
                        attempt,
                        self.settings.backoff_base,
                        self.settings.backoff_cap,
                    );
                    warn!(
                        batch,
                        attempt,
                        max_attempts,
                        error = %err,
                        "lock contention; retrying batch after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// One try of a batch inside a fresh transaction. Unresolved-reference
    /// events are returned rather than reported so that a retried batch does
    /// not report them twice.
    async fn try_batch(
        &mut self,
        rows: &[(NaturalKey, CanonicalRow)],
    ) -> Result<(u64, Vec<Coercion>), StoreError> {
        let mut tx = self.store.begin().await?;
        let mut records = Vec::with_capacity(rows.len());
        let mut unresolved = Vec::new();

        for (key, row) in rows {
            let provider_id = match row.provider_name.as_deref() {
                Some(name) => self.resolver.resolve_provider(&mut tx, name).await?,
                None => None,
            };
            let category_id = match row.category_name.as_deref() {
                Some(label) => self.resolver.resolve_category(&mut tx, label).await?,
                None => None,
            };
            for (kind, name) in self.resolver.take_unresolved() {
                unresolved.push(Coercion {
                    row: row.source_row,
                    column: match kind {
                        ReferenceKind::Provider => "providerName",
                        ReferenceKind::Category => "categoryName",
                    },
                    raw: name,
                    kind: CoercionKind::UnresolvedReference,
                });
            }
            records.push(VoucherRecord::new(key.clone(), row, provider_id, category_id));
        }

        let affected = tx.upsert_vouchers(&records).await?;
        tx.commit().await?;
        Ok((affected, unresolved))
    }
}

fn lock_order(key: &NaturalKey) -> (&str, chrono::NaiveDate, &str) {
    (key.voucher_type.as_str(), key.date, key.voucher_number.as_str())
}
