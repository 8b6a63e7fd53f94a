//! One import run: header detection, mapping, schema, references, upsert.
//!
//! Header and column problems are found before the store is touched, so a
//! file that cannot be mapped never writes anything.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::diagnostics::Diagnostics;
use crate::error::ImportError;
use crate::grid::Row;
use crate::header::{locate_header, HeaderLocation, HEADER_SCAN_ROWS};
use crate::mapper::{map_rows, CanonicalRow};
use crate::resolver::{ReferenceCache, ReferenceResolver};
use crate::store::{ReferenceKind, VoucherStore};
use crate::upsert::{BatchSettings, BatchUpsertEngine};

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub header_scan_rows: usize,
    /// Fail instead of assuming row 0 when no header is detected.
    pub strict_header: bool,
    /// Preload every live reference name before the first batch.
    pub seed_cache: bool,
    pub batch: BatchSettings,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            header_scan_rows: HEADER_SCAN_ROWS,
            strict_header: false,
            seed_cache: true,
            batch: BatchSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    /// Data rows below the header.
    pub rows_read: usize,
    /// 1-based sheet line of the header row.
    pub header_row: usize,
    pub header_detected: bool,
    pub tables_created: Vec<&'static str>,
    pub upserted: usize,
    pub skipped: usize,
    pub batches: usize,
    pub retries: u32,
    pub providers_created: usize,
    pub categories_created: usize,
    pub coercions: usize,
}

/// Locate the header and map every data row. Touches no store.
pub fn prepare_rows(
    grid: &[Row],
    options: &ImportOptions,
    diag: &dyn Diagnostics,
) -> Result<(HeaderLocation, Vec<CanonicalRow>), ImportError> {
    let location = locate_header(grid, options.header_scan_rows);
    match location {
        HeaderLocation::Found(idx) => info!(header_row = idx + 1, "header detected"),
        HeaderLocation::Fallback if options.strict_header => {
            return Err(ImportError::HeaderNotFound {
                scanned: options.header_scan_rows.min(grid.len()),
            });
        }
        HeaderLocation::Fallback => warn!(
            scanned = options.header_scan_rows.min(grid.len()),
            "no header detected, assuming row 1"
        ),
    }

    let rows = map_rows(grid, location.index(), diag)?;
    Ok((location, rows))
}

/// Import an already loaded grid into `store`.
pub async fn import_grid<S: VoucherStore>(
    store: &S,
    grid: &[Row],
    options: &ImportOptions,
    diag: &dyn Diagnostics,
    run_id: Uuid,
) -> Result<ImportReport, ImportError> {
    let (location, rows) = prepare_rows(grid, options, diag)?;
    let rows_read = rows.len();
    info!(rows = rows_read, "rows mapped");

    let tables_created = store.ensure_schema().await.map_err(ImportError::Schema)?;

    let cache = if options.seed_cache {
        ReferenceCache::preload(store)
            .await
            .map_err(ImportError::Seed)?
    } else {
        ReferenceCache::default()
    };
    let mut resolver = ReferenceResolver::new(cache);

    let summary = BatchUpsertEngine::new(store, &mut resolver, options.batch.clone(), diag)
        .run(rows)
        .await?;

    Ok(ImportReport {
        run_id,
        rows_read,
        header_row: location.index() + 1,
        header_detected: location.is_detected(),
        tables_created,
        upserted: summary.upserted,
        skipped: summary.skipped,
        batches: summary.batches,
        retries: summary.retries,
        providers_created: resolver.created(ReferenceKind::Provider),
        categories_created: resolver.created(ReferenceKind::Category),
        coercions: diag.count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{CoercionKind, CollectingDiagnostics};
    use crate::grid::{load_csv, Cell};
    use crate::mapper::NaturalKey;
    use crate::store::memory::MemoryStore;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const EXPORT: &str = "\
EMPRESA DEMO S.A.;;;;;;
Comprobantes de servicios;;;;;;
;;;;;;
Tipo Comprobante;Comprobante;Fecha;Proveedor;Detalles;Total;Monto Pagado
FACTURA;0001-100;05/03/2024;ACME SRL;Luz, Agua, luz;1.234,56;234,56
FACTURA;0001-101;06/03/2024;ACME SRL;Internet;500,00;
RECIBO;R-9;xx/03/2024;Otro;Gas;10,00;
NOTA CREDITO;NC-1;07/03/2024;;;-50,00;
";

    fn grid() -> Vec<Row> {
        load_csv(EXPORT.as_bytes()).unwrap()
    }

    fn key(t: &str, n: &str, y: i32, m: u32, d: u32) -> NaturalKey {
        NaturalKey {
            voucher_type: t.to_string(),
            voucher_number: n.to_string(),
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_import_csv_export() {
        let store = MemoryStore::new();
        let diag = CollectingDiagnostics::default();
        let report = import_grid(&store, &grid(), &ImportOptions::default(), &diag, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(report.header_row, 4);
        assert!(report.header_detected);
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.upserted, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.batches, 1);
        assert_eq!(report.tables_created.len(), 3);
        assert_eq!(report.providers_created, 1);
        assert_eq!(report.categories_created, 2);

        let first = store.voucher(&key("FACTURA", "0001-100", 2024, 3, 5)).unwrap();
        assert_eq!(first.record.total, Decimal::from_str("1234.56").unwrap());
        assert_eq!(first.record.balance, Decimal::from_str("1000.00").unwrap());
        assert_eq!(first.record.billing_status, "ISSUED");
        let categories = store.references(ReferenceKind::Category);
        assert!(categories.iter().any(|c| c.name == "Luz, Agua"));

        let credit = store.voucher(&key("NOTA CREDITO", "NC-1", 2024, 3, 7)).unwrap();
        assert_eq!(credit.record.provider_id, None);
        assert_eq!(credit.record.category_id, None);
        assert_eq!(credit.record.total, Decimal::from(-50));

        // bad date on the RECIBO row, then its incomplete key
        let kinds: Vec<_> = diag.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![CoercionKind::DateToNull, CoercionKind::IncompleteKey]);
        assert_eq!(report.coercions, 2);
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let store = MemoryStore::new();
        let diag = CollectingDiagnostics::default();
        let options = ImportOptions::default();
        import_grid(&store, &grid(), &options, &diag, Uuid::new_v4())
            .await
            .unwrap();
        let before = store.vouchers();

        let report = import_grid(&store, &grid(), &options, &diag, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(store.vouchers(), before);
        assert!(report.tables_created.is_empty());
        assert_eq!(report.providers_created, 0);
        assert_eq!(report.categories_created, 0);
    }

    #[tokio::test]
    async fn test_missing_columns_write_nothing() {
        let store = MemoryStore::new();
        let diag = CollectingDiagnostics::default();
        let grid = load_csv(b"Tipo Comprobante;Comprobante;Fecha\nFACTURA;1;01/01/2024\n").unwrap();

        let err = import_grid(&store, &grid, &ImportOptions::default(), &diag, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::MissingColumns { .. }));
        // schema was never touched
        assert_eq!(store.ensure_schema().await.unwrap().len(), 3);
        assert_eq!(store.voucher_count(), 0);
    }

    #[test]
    fn test_strict_header_fails_without_header() {
        let diag = CollectingDiagnostics::default();
        let grid = vec![vec![Cell::text("hola")], vec![Cell::text("mundo")]];
        let options = ImportOptions {
            strict_header: true,
            ..ImportOptions::default()
        };
        let err = prepare_rows(&grid, &options, &diag).unwrap_err();
        assert!(matches!(err, ImportError::HeaderNotFound { scanned: 2 }));
    }

    #[test]
    fn test_fallback_header_reports_missing_columns() {
        let diag = CollectingDiagnostics::default();
        let grid = vec![
            vec![Cell::text("Reporte"), Cell::text("Fecha")],
            vec![Cell::text("FACTURA"), Cell::text("01/01/2024")],
        ];
        let err = prepare_rows(&grid, &ImportOptions::default(), &diag).unwrap_err();
        assert!(matches!(err, ImportError::MissingColumns { .. }));
        assert_eq!(err.stage(), crate::error::Stage::Mapping);
    }
}
