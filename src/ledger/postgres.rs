//! PostgreSQL Ledger Store
//!
//! Every handle owns exactly one pooled connection for its whole life:
//! [`PgConn`] in auto-commit mode, [`PgTx`] inside `BEGIN ... COMMIT`.
//! Row locks come from the `UPDATE` in `add_account_balance` and are held by
//! Postgres until the transaction ends.
//!
//! Dropping a query future does not stop the statement on the server. A
//! transaction therefore carries its backend pid, so a cancelled scope can
//! interrupt a statement parked on a row lock instead of waiting it out, and
//! a deadline is pushed down as `lock_timeout`/`statement_timeout`.

use std::ops::DerefMut;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, warn};

use super::error::{LedgerError, is_foreign_key_violation, is_statement_timeout};
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use super::store::{LedgerStore, Queries, Transactional};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

/// Ledger store backed by a shared, bounded connection pool
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// One connection, used either directly or inside a transaction.
pub struct PgHandle<C> {
    conn: C,
    backend: Option<Backend>,
}

/// Server process serving a transaction, reachable from a second connection
struct Backend {
    pool: PgPool,
    pid: i32,
}

/// Auto-commit connection
pub type PgConn = PgHandle<PoolConnection<Postgres>>;

/// Connection inside an open transaction
pub type PgTx = PgHandle<Transaction<'static, Postgres>>;

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Conn = PgConn;
    type Tx = PgTx;

    async fn acquire(&self) -> Result<PgConn, LedgerError> {
        let conn = self.pool.acquire().await?;
        Ok(PgHandle {
            conn,
            backend: None,
        })
    }

    async fn begin(&self) -> Result<PgTx, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let pid = sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await?;
        debug!(pid, "Transaction started");
        Ok(PgHandle {
            conn: tx,
            backend: Some(Backend {
                pool: self.pool.clone(),
                pid,
            }),
        })
    }
}

#[async_trait]
impl Transactional for PgTx {
    async fn commit(self) -> Result<(), LedgerError> {
        self.conn.commit().await?;
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        match self.conn.rollback().await {
            Ok(()) => {
                debug!("Transaction rolled back");
                Ok(())
            }
            // The interrupted statement's error arrives ahead of ROLLBACK.
            // Dropping the transaction queues ROLLBACK again and the pool
            // flushes it before the connection is reused.
            Err(e) if is_statement_timeout(&e) => {
                debug!(error = %e, "Interrupted statement drained, rollback left to the pool");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_timeout(&mut self, remaining: Duration) -> Result<(), LedgerError> {
        // 0 disables both timeouts in Postgres
        let ms = remaining.as_millis().max(1);
        let sql = format!("SET LOCAL lock_timeout = {ms}; SET LOCAL statement_timeout = {ms}");
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(&sql)).await?;
        Ok(())
    }

    async fn interrupt(&mut self) {
        let Some(backend) = &self.backend else {
            return;
        };
        // An idle backend ignores the request, so a statement that already
        // finished is unaffected.
        match sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
            .bind(backend.pid)
            .fetch_one(&backend.pool)
            .await
        {
            Ok(signalled) => {
                debug!(pid = backend.pid, signalled, "Interrupted in-flight statement")
            }
            Err(e) => {
                warn!(pid = backend.pid, error = %e, "Failed to interrupt in-flight statement")
            }
        }
    }
}

#[async_trait]
impl<C> Queries for PgHandle<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn create_account(
        &mut self,
        params: &CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, 0, $2) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&params.owner)
        .bind(&params.currency)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::not_found("account", id))
    }

    async fn list_accounts(
        &mut self,
        params: &ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(&params.owner)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(accounts)
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError> {
        // Single statement: the increment happens under the row lock.
        sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = balance + $2 WHERE id = $1 \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(params.id)
        .bind(params.amount)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::not_found("account", params.id))
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), LedgerError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("account", id));
        }
        Ok(())
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError> {
        sqlx::query_as::<_, Transfer>(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) \
             VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| {
            missing_account(
                e,
                &[
                    ("to_account_id", params.to_account_id),
                    ("from_account_id", params.from_account_id),
                ],
            )
        })
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::not_found("transfer", id))
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let transfers = sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $2 \
             ORDER BY id LIMIT $3 OFFSET $4"
        ))
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(transfers)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError> {
        sqlx::query_as::<_, Entry>(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(params.account_id)
        .bind(params.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| missing_account(e, &[("account_id", params.account_id)]))
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::not_found("entry", id))
    }

    async fn list_entries(
        &mut self,
        params: ListEntriesParams,
    ) -> Result<Vec<Entry>, LedgerError> {
        let entries = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(params.account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(entries)
    }

    async fn sum_entries(&mut self, account_id: i64) -> Result<i64, LedgerError> {
        let sum = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM entries WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(sum)
    }
}

/// Map a foreign-key violation on an insert to `NotFound` for the account it
/// names. `columns` pairs each referencing column with the id that was bound.
fn missing_account(e: sqlx::Error, columns: &[(&str, i64)]) -> LedgerError {
    if !is_foreign_key_violation(&e) {
        return e.into();
    }

    let constraint = match &e {
        sqlx::Error::Database(db) => db.constraint().unwrap_or_default().to_string(),
        _ => String::new(),
    };

    let id = columns
        .iter()
        .find(|(column, _)| constraint.contains(column))
        .or_else(|| columns.last())
        .map(|(_, id)| *id)
        .unwrap_or_default();

    LedgerError::not_found("account", id)
}
