//! Importer Service - Loads ERP service voucher exports into MySQL
//!
//! Responsibilities:
//! - Read .xls/.xlsx/.ods/.csv exports into an untyped grid
//! - Locate the header row below the report title block
//! - Map Spanish column labels to canonical voucher fields
//! - Create missing tables and reference rows (providers, categories)
//! - Upsert vouchers by natural key in retried, lock-ordered batches
//!
//! Re-importing the same file is idempotent: the natural key
//! (voucher type, number, date) decides insert vs. overwrite.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod grid;
pub mod header;
pub mod mapper;
pub mod normalize;
pub mod pipeline;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod upsert;

pub use error::{ImportError, Stage, StoreError};
pub use pipeline::{import_grid, ImportOptions, ImportReport};
