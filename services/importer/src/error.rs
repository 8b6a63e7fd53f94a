//! Error taxonomy for the importer.
//!
//! `StoreError` is what a persistence backend reports; `ImportError` is what a run
//! reports, tagged with the stage that failed.

use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock-wait timeout or deadlock. Safe to retry the whole transaction.
    #[error("lock contention (code {code}): {message}")]
    LockContention { code: u16, message: String },

    /// A unique key rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("database error: {0}")]
    Backend(#[source] BoxError),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockContention { .. })
    }
}

/// Stage of a run, used to tell the operator where an import stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Mapping,
    Schema,
    BatchCommit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Read => "read",
            Stage::Mapping => "mapping",
            Stage::Schema => "schema",
            Stage::BatchCommit => "batch commit",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("could not read spreadsheet: {0}")]
    Read(String),

    #[error("no header row found in the first {scanned} rows")]
    HeaderNotFound { scanned: usize },

    #[error("missing required columns {missing:?}; columns found: {found:?}")]
    MissingColumns {
        missing: Vec<&'static str>,
        found: Vec<String>,
    },

    #[error("could not ensure schema: {0}")]
    Schema(#[source] StoreError),

    #[error("could not preload reference names: {0}")]
    Seed(#[source] StoreError),

    #[error("batch {batch} failed on attempt {attempts} ({committed} rows committed before it): {source}")]
    BatchFailed {
        batch: usize,
        attempts: u32,
        committed: usize,
        #[source]
        source: StoreError,
    },

    #[error("batch {batch} still locked after {attempts} attempts ({committed} rows committed before it): {source}")]
    RetriesExhausted {
        batch: usize,
        attempts: u32,
        committed: usize,
        #[source]
        source: StoreError,
    },
}

impl ImportError {
    pub fn stage(&self) -> Stage {
        match self {
            ImportError::Read(_) => Stage::Read,
            ImportError::HeaderNotFound { .. } | ImportError::MissingColumns { .. } => {
                Stage::Mapping
            }
            ImportError::Schema(_) | ImportError::Seed(_) => Stage::Schema,
            ImportError::BatchFailed { .. } | ImportError::RetriesExhausted { .. } => {
                Stage::BatchCommit
            }
        }
    }

    /// Rows durably committed before the run stopped.
    pub fn committed(&self) -> usize {
        match self {
            ImportError::BatchFailed { committed, .. }
            | ImportError::RetriesExhausted { committed, .. } => *committed,
            _ => 0,
        }
    }
}
