//! In-process backend with MySQL-like semantics.
//!
//! Used for `--dry-run` and by the test suite. A transaction works on a private
//! copy of the committed state and publishes it on commit. Faults (lock
//! contention, a concurrent writer inserting the same reference name) can be
//! injected to exercise the retry and race paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::{ReferenceKind, StoreTx, VoucherRecord, VoucherStore};
use crate::error::StoreError;
use crate::mapper::NaturalKey;
use crate::schema::TABLES;
use crate::store::mysql::ER_LOCK_WAIT_TIMEOUT;

#[derive(Debug, Error)]
#[error("{0}")]
struct MemoryError(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRow {
    pub id: u64,
    pub name: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredVoucher {
    pub id: u64,
    pub record: VoucherRecord,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    schema_ready: bool,
    references: HashMap<ReferenceKind, Vec<ReferenceRow>>,
    vouchers: BTreeMap<NaturalKey, StoredVoucher>,
    next_voucher_id: u64,
}

impl MemoryState {
    fn rows(&self, kind: ReferenceKind) -> &[ReferenceRow] {
        self.references.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn next_reference_id(&self, kind: ReferenceKind) -> u64 {
        self.rows(kind).iter().map(|r| r.id).max().unwrap_or(0) + 1
    }

    fn push_reference(&mut self, kind: ReferenceKind, row: ReferenceRow) {
        self.references.entry(kind).or_default().push(row);
    }

    fn has_reference_id(&self, kind: ReferenceKind, id: u64) -> bool {
        self.rows(kind).iter().any(|r| r.id == id)
    }
}

#[derive(Debug, Default)]
struct Faults {
    healthy_upserts: u32,
    lock_failures: u32,
    broken_upserts: u32,
    races: Vec<(ReferenceKind, String)>,
    upsert_calls: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a committed reference row, as if written by an earlier run.
    pub fn seed_reference(&self, kind: ReferenceKind, name: &str, deleted: bool) -> u64 {
        let mut state = lock(&self.state);
        let id = state.next_reference_id(kind);
        state.push_reference(
            kind,
            ReferenceRow {
                id,
                name: name.to_string(),
                deleted,
            },
        );
        id
    }

    /// The next `n` voucher upserts fail with a lock-wait timeout.
    pub fn fail_next_upserts(&self, n: u32) {
        self.fail_upserts_after(0, n);
    }

    /// Let `healthy` upserts through, then fail the following `n` with a
    /// lock-wait timeout.
    pub fn fail_upserts_after(&self, healthy: u32, n: u32) {
        let mut faults = lock(&self.faults);
        faults.healthy_upserts = healthy;
        faults.lock_failures = n;
    }

    /// The next voucher upsert fails with a non-retryable error.
    pub fn break_next_upsert(&self) {
        lock(&self.faults).broken_upserts += 1;
    }

    /// Another writer commits `name` right before this store's next insert of it.
    pub fn race_on_insert(&self, kind: ReferenceKind, name: &str) {
        lock(&self.faults).races.push((kind, name.to_string()));
    }

    /// Voucher upsert statements attempted, failed ones included.
    pub fn upsert_attempts(&self) -> u32 {
        lock(&self.faults).upsert_calls
    }

    pub fn voucher_count(&self) -> usize {
        lock(&self.state).vouchers.len()
    }

    pub fn voucher(&self, key: &NaturalKey) -> Option<StoredVoucher> {
        lock(&self.state).vouchers.get(key).cloned()
    }

    pub fn vouchers(&self) -> Vec<StoredVoucher> {
        lock(&self.state).vouchers.values().cloned().collect()
    }

    pub fn references(&self, kind: ReferenceKind) -> Vec<ReferenceRow> {
        lock(&self.state).rows(kind).to_vec()
    }
}

#[async_trait]
impl VoucherStore for MemoryStore {
    type Tx = MemoryTx;

    async fn ensure_schema(&self) -> Result<Vec<&'static str>, StoreError> {
        let mut state = lock(&self.state);
        if state.schema_ready {
            return Ok(Vec::new());
        }
        state.schema_ready = true;
        Ok(TABLES.iter().map(|t| t.name).collect())
    }

    async fn load_references(
        &self,
        kind: ReferenceKind,
    ) -> Result<Vec<(String, u64)>, StoreError> {
        Ok(lock(&self.state)
            .rows(kind)
            .iter()
            .filter(|r| !r.deleted)
            .map(|r| (r.name.clone(), r.id))
            .collect())
    }

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let staged = lock(&self.state).clone();
        Ok(MemoryTx {
            store: self.clone(),
            staged,
        })
    }
}

pub struct MemoryTx {
    store: MemoryStore,
    staged: MemoryState,
}

impl MemoryTx {
    /// Commit `name` on behalf of a concurrent writer, visible to this tx too.
    fn commit_concurrent_insert(&mut self, kind: ReferenceKind, name: &str) {
        let mut shared = lock(&self.store.state);
        let id = shared
            .next_reference_id(kind)
            .max(self.staged.next_reference_id(kind));
        let row = ReferenceRow {
            id,
            name: name.to_string(),
            deleted: false,
        };
        shared.push_reference(kind, row.clone());
        self.staged.push_reference(kind, row);
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_reference(
        &mut self,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<Option<u64>, StoreError> {
        Ok(self
            .staged
            .rows(kind)
            .iter()
            .find(|r| !r.deleted && r.name == name)
            .map(|r| r.id))
    }

    async fn insert_reference(
        &mut self,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<u64, StoreError> {
        let raced = {
            let mut faults = lock(&self.store.faults);
            match faults.races.iter().position(|(k, n)| *k == kind && n == name) {
                Some(idx) => {
                    faults.races.remove(idx);
                    true
                }
                None => false,
            }
        };
        if raced {
            self.commit_concurrent_insert(kind, name);
        }

        if self.staged.rows(kind).iter().any(|r| r.name == name) {
            return Err(StoreError::UniqueViolation(format!(
                "Duplicate entry '{}' for key '{}.name'",
                name,
                kind.table()
            )));
        }

        let id = self.staged.next_reference_id(kind);
        self.staged.push_reference(
            kind,
            ReferenceRow {
                id,
                name: name.to_string(),
                deleted: false,
            },
        );
        Ok(id)
    }

    async fn upsert_vouchers(&mut self, rows: &[VoucherRecord]) -> Result<u64, StoreError> {
        {
            let mut faults = lock(&self.store.faults);
            faults.upsert_calls += 1;
            if faults.broken_upserts > 0 {
                faults.broken_upserts -= 1;
                return Err(StoreError::backend(MemoryError(
                    "connection reset by peer".to_string(),
                )));
            }
            if faults.healthy_upserts > 0 {
                faults.healthy_upserts -= 1;
            } else if faults.lock_failures > 0 {
                faults.lock_failures -= 1;
                return Err(StoreError::LockContention {
                    code: ER_LOCK_WAIT_TIMEOUT,
                    message: "Lock wait timeout exceeded; try restarting transaction".to_string(),
                });
            }
        }

        for row in rows {
            let references = [
                (ReferenceKind::Provider, row.provider_id),
                (ReferenceKind::Category, row.category_id),
            ];
            for (kind, id) in references {
                if let Some(id) = id {
                    if !self.staged.has_reference_id(kind, id) {
                        return Err(StoreError::backend(MemoryError(format!(
                            "foreign key violation: {} id {} does not exist",
                            kind, id
                        ))));
                    }
                }
            }
        }

        let mut affected = 0;
        for row in rows {
            let key = row.key();
            match self.staged.vouchers.get_mut(&key) {
                Some(existing) if existing.record == *row => {}
                Some(existing) => {
                    existing.record = row.clone();
                    affected += 2;
                }
                None => {
                    self.staged.next_voucher_id += 1;
                    let id = self.staged.next_voucher_id;
                    self.staged.vouchers.insert(
                        key,
                        StoredVoucher {
                            id,
                            record: row.clone(),
                        },
                    );
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let MemoryTx { store, staged } = self;
        *lock(&store.state) = staged;
        Ok(())
    }
}
