//! Physical MySQL schema for service vouchers and their reference tables.
//!
//! Tables are created on demand, in dependency order, and existing tables are
//! never altered. Reference names and the text parts of the voucher natural
//! key use a binary collation so that "ACME" and "Acme" stay distinct rows,
//! matching how names are cached and keys are compared in memory.

use sqlx::MySqlPool;
use tracing::info;

use crate::error::StoreError;
use crate::store::mysql::classify;

pub const CATEGORIES_TABLE: &str = "service_categories";
pub const PROVIDERS_TABLE: &str = "service_providers";
pub const VOUCHERS_TABLE: &str = "service_vouchers";

#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub ddl: &'static str,
}

const CATEGORIES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS service_categories (
    id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
    name VARCHAR(255) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL,
    description VARCHAR(500) NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    deleted_at TIMESTAMP NULL DEFAULT NULL,
    UNIQUE KEY uq_service_categories_name (name)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

const PROVIDERS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS service_providers (
    id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
    name VARCHAR(255) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL,
    legal_name VARCHAR(255) NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    deleted_at TIMESTAMP NULL DEFAULT NULL,
    UNIQUE KEY uq_service_providers_name (name)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

const VOUCHERS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS service_vouchers (
    id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
    voucher_type VARCHAR(100) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL,
    voucher_number VARCHAR(100) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL,
    voucher_date DATE NOT NULL,
    posting_date DATE NULL,
    provider_id BIGINT UNSIGNED NULL,
    category_id BIGINT UNSIGNED NULL,
    details VARCHAR(500) NULL,
    total DECIMAL(15,2) NOT NULL DEFAULT 0,
    amount_paid DECIMAL(15,2) NOT NULL DEFAULT 0,
    balance DECIMAL(15,2) NOT NULL DEFAULT 0,
    billing_status VARCHAR(100) NOT NULL DEFAULT 'ISSUED',
    staff VARCHAR(255) NULL,
    due_date DATE NULL,
    registration_date DATE NULL,
    notes TEXT NULL,
    voided_by VARCHAR(255) NULL,
    voided_at DATE NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    deleted_at TIMESTAMP NULL DEFAULT NULL,
    UNIQUE KEY uq_service_vouchers_natural (voucher_type, voucher_number, voucher_date),
    KEY idx_service_vouchers_provider (provider_id),
    KEY idx_service_vouchers_category (category_id),
    CONSTRAINT fk_service_vouchers_provider FOREIGN KEY (provider_id) REFERENCES service_providers (id),
    CONSTRAINT fk_service_vouchers_category FOREIGN KEY (category_id) REFERENCES service_categories (id)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

/// Every table, referenced tables first.
pub const TABLES: [TableDef; 3] = [
    TableDef {
        name: CATEGORIES_TABLE,
        ddl: CATEGORIES_DDL,
    },
    TableDef {
        name: PROVIDERS_TABLE,
        ddl: PROVIDERS_DDL,
    },
    TableDef {
        name: VOUCHERS_TABLE,
        ddl: VOUCHERS_DDL,
    },
];

/// Insert column order for `service_vouchers`.
pub const VOUCHER_COLUMNS: [&str; 17] = [
    "voucher_type",
    "voucher_number",
    "voucher_date",
    "posting_date",
    "provider_id",
    "category_id",
    "details",
    "total",
    "amount_paid",
    "balance",
    "billing_status",
    "staff",
    "due_date",
    "registration_date",
    "notes",
    "voided_by",
    "voided_at",
];

/// Columns overwritten when a voucher's natural key already exists.
pub fn update_columns() -> impl Iterator<Item = &'static str> {
    VOUCHER_COLUMNS.into_iter().skip(3)
}

/// Create whichever tables are missing. Returns the names created.
pub async fn ensure_mysql_schema(pool: &MySqlPool) -> Result<Vec<&'static str>, StoreError> {
    let mut created = Vec::new();

    for table in TABLES.iter() {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ? LIMIT 1",
        )
        .bind(table.name)
        .fetch_optional(pool)
        .await
        .map_err(classify)?;

        if exists.is_some() {
            continue;
        }

        sqlx::query(table.ddl)
            .execute(pool)
            .await
            .map_err(classify)?;
        info!(table = table.name, "created table");
        created.push(table.name);
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::Field;

    fn column_width(ddl: &str, column: &str) -> Option<usize> {
        let line = ddl
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with(&format!("{column} ")))?;
        let start = line.find("VARCHAR(")? + "VARCHAR(".len();
        let end = line[start..].find(')')? + start;
        line[start..end].parse().ok()
    }

    #[test]
    fn test_tables_in_dependency_order() {
        let names: Vec<_> = TABLES.iter().map(|t| t.name).collect();
        assert_eq!(names, vec![CATEGORIES_TABLE, PROVIDERS_TABLE, VOUCHERS_TABLE]);
        for table in TABLES.iter() {
            assert!(table.ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table.name)));
        }
    }

    #[test]
    fn test_text_widths_match_mapper() {
        let cases = [
            ("voucher_type", Field::VoucherType),
            ("voucher_number", Field::VoucherNumber),
            ("details", Field::Details),
            ("billing_status", Field::BillingStatus),
            ("staff", Field::Staff),
            ("voided_by", Field::VoidedBy),
        ];
        for (column, field) in cases {
            assert_eq!(column_width(VOUCHERS_DDL, column), field.max_chars(), "{column}");
        }
        assert_eq!(
            column_width(PROVIDERS_DDL, "name"),
            Field::ProviderName.max_chars()
        );
        assert_eq!(
            column_width(CATEGORIES_DDL, "name"),
            Field::CategoryName.max_chars()
        );
    }

    #[test]
    fn test_natural_key_is_unique() {
        assert!(VOUCHERS_DDL
            .contains("UNIQUE KEY uq_service_vouchers_natural (voucher_type, voucher_number, voucher_date)"));
    }

    #[test]
    fn test_key_and_name_columns_compare_bytes() {
        let binary = |ddl: &str, column: &str| {
            ddl.lines()
                .map(str::trim)
                .find(|l| l.starts_with(&format!("{column} ")))
                .is_some_and(|l| l.contains("COLLATE utf8mb4_bin"))
        };
        assert!(binary(VOUCHERS_DDL, "voucher_type"));
        assert!(binary(VOUCHERS_DDL, "voucher_number"));
        assert!(binary(PROVIDERS_DDL, "name"));
        assert!(binary(CATEGORIES_DDL, "name"));
        assert!(!binary(VOUCHERS_DDL, "details"));
    }

    #[test]
    fn test_money_columns_match_mapper_limit() {
        for column in ["total", "amount_paid", "balance"] {
            assert!(
                VOUCHERS_DDL
                    .lines()
                    .any(|l| l.trim().starts_with(&format!("{column} DECIMAL(15,2) "))),
                "{column}"
            );
        }
        assert_eq!(crate::mapper::money_limit().to_string(), "9999999999999.99");
    }

    #[test]
    fn test_every_insert_column_exists() {
        for column in VOUCHER_COLUMNS {
            assert!(
                VOUCHERS_DDL.lines().any(|l| l.trim().starts_with(&format!("{column} "))),
                "{column}"
            );
        }
    }

    #[test]
    fn test_update_columns_exclude_natural_key() {
        let cols: Vec<_> = update_columns().collect();
        assert_eq!(cols.len(), 14);
        assert!(!cols.contains(&"voucher_type"));
        assert!(!cols.contains(&"voucher_date"));
        assert_eq!(cols[0], "posting_date");
    }
}
