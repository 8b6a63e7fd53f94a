//! Hook for data-level problems that do not stop a run.
//!
//! Coercions never change an outcome (a bad amount is still zero, a bad date is
//! still null); they only make the loss visible.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoercionKind {
    /// Unparsable amount stored as zero.
    DecimalToZero,
    /// Amount too large for its money column, stored as zero.
    OutOfRange,
    /// Unparsable date stored as null.
    DateToNull,
    /// Text cut to the column width.
    Truncated { max_chars: usize },
    /// Row not imported because voucher type, number or date is missing.
    IncompleteKey,
    /// Reference name exists only as a soft-deleted row; field left null.
    UnresolvedReference,
}

impl fmt::Display for CoercionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoercionKind::DecimalToZero => f.write_str("amount coerced to 0"),
            CoercionKind::OutOfRange => f.write_str("amount out of range, coerced to 0"),
            CoercionKind::DateToNull => f.write_str("date coerced to null"),
            CoercionKind::Truncated { max_chars } => write!(f, "text truncated to {max_chars} chars"),
            CoercionKind::IncompleteKey => f.write_str("row skipped, incomplete natural key"),
            CoercionKind::UnresolvedReference => f.write_str("reference left null"),
        }
    }
}

/// One coerced value. `row` is the 1-based line in the source sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coercion {
    pub row: usize,
    pub column: &'static str,
    pub raw: String,
    pub kind: CoercionKind,
}

pub trait Diagnostics: Send + Sync {
    fn coerced(&self, event: Coercion);

    /// Events seen so far.
    fn count(&self) -> usize;
}

/// Logs every coercion at `warn`.
#[derive(Debug, Default)]
pub struct TracingDiagnostics {
    count: AtomicUsize,
}

impl Diagnostics for TracingDiagnostics {
    fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn coerced(&self, event: Coercion) {
        self.count.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            row = event.row,
            column = event.column,
            raw = %event.raw,
            "{}",
            event.kind
        );
    }
}

/// Keeps every coercion in memory.
#[derive(Debug, Default)]
pub struct CollectingDiagnostics {
    events: Mutex<Vec<Coercion>>,
}

impl CollectingDiagnostics {
    pub fn events(&self) -> Vec<Coercion> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Coercion>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Diagnostics for CollectingDiagnostics {
    fn coerced(&self, event: Coercion) {
        self.lock().push(event);
    }

    fn count(&self) -> usize {
        self.lock().len()
    }
}
