//! MySQL backend.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder, Transaction};

use super::{ReferenceKind, StoreTx, VoucherRecord, VoucherStore};
use crate::error::StoreError;
use crate::schema::{self, VOUCHERS_TABLE, VOUCHER_COLUMNS};

/// `ER_LOCK_WAIT_TIMEOUT`
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
/// `ER_LOCK_DEADLOCK`
pub const ER_LOCK_DEADLOCK: u16 = 1213;
/// `ER_DUP_ENTRY`
pub const ER_DUP_ENTRY: u16 = 1062;

/// Map a driver error onto the store taxonomy.
pub(crate) fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
            match mysql.number() {
                code @ (ER_LOCK_WAIT_TIMEOUT | ER_LOCK_DEADLOCK) => {
                    return StoreError::LockContention {
                        code,
                        message: mysql.message().to_string(),
                    }
                }
                ER_DUP_ENTRY => return StoreError::UniqueViolation(mysql.message().to_string()),
                _ => {}
            }
        }
    }
    StoreError::backend(err)
}

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Open a pool whose sessions wait `lock_wait_timeout_secs` on row locks and
    /// run at READ COMMITTED.
    pub async fn connect(
        options: MySqlConnectOptions,
        max_connections: u32,
        lock_wait_timeout_secs: u64,
    ) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    let timeout =
                        format!("SET SESSION innodb_lock_wait_timeout = {lock_wait_timeout_secs}");
                    sqlx::query(&timeout).execute(&mut *conn).await?;
                    sqlx::query("SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(classify)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl VoucherStore for MySqlStore {
    type Tx = MySqlTx;

    async fn ensure_schema(&self) -> Result<Vec<&'static str>, StoreError> {
        schema::ensure_mysql_schema(&self.pool).await
    }

    async fn load_references(
        &self,
        kind: ReferenceKind,
    ) -> Result<Vec<(String, u64)>, StoreError> {
        let sql = format!(
            "SELECT name, id FROM {} WHERE deleted_at IS NULL",
            kind.table()
        );
        sqlx::query_as::<_, (String, u64)>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)
    }

    async fn begin(&self) -> Result<MySqlTx, StoreError> {
        let tx = self.pool.begin().await.map_err(classify)?;
        Ok(MySqlTx { tx })
    }
}

pub struct MySqlTx {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl StoreTx for MySqlTx {
    async fn find_reference(
        &mut self,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<Option<u64>, StoreError> {
        let sql = format!(
            "SELECT id FROM {} WHERE name = ? AND deleted_at IS NULL LIMIT 1",
            kind.table()
        );
        sqlx::query_scalar::<_, u64>(&sql)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)
    }

    async fn insert_reference(
        &mut self,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<u64, StoreError> {
        let sql = format!("INSERT INTO {} (name) VALUES (?)", kind.table());
        let result = sqlx::query(&sql)
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(result.last_insert_id())
    }

    async fn upsert_vouchers(&mut self, rows: &[VoucherRecord]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<MySql> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            VOUCHERS_TABLE,
            VOUCHER_COLUMNS.join(", ")
        ));
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.voucher_type.clone())
                .push_bind(row.voucher_number.clone())
                .push_bind(row.date)
                .push_bind(row.posting_date)
                .push_bind(row.provider_id)
                .push_bind(row.category_id)
                .push_bind(row.details.clone())
                .push_bind(row.total)
                .push_bind(row.amount_paid)
                .push_bind(row.balance)
                .push_bind(row.billing_status.clone())
                .push_bind(row.staff.clone())
                .push_bind(row.due_date)
                .push_bind(row.registration_date)
                .push_bind(row.notes.clone())
                .push_bind(row.voided_by.clone())
                .push_bind(row.voided_at);
        });
        builder.push(" ON DUPLICATE KEY UPDATE ");
        builder.push(
            schema::update_columns()
                .map(|c| format!("{c} = VALUES({c})"))
                .collect::<Vec<_>>()
                .join(", "),
        );

        let result = builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(classify)
    }
}
