//! Ledger Store capability set
//!
//! The store is split the way a connection pool is used:
//! - [`Queries`]: single-row primitives run on one connection
//! - [`Transactional`]: a connection inside an open transaction
//! - [`LedgerStore`]: hands out auto-commit connections and transactions
//!
//! [`with_transaction`] is the only way the ledger itself opens a
//! transaction: commit on `Ok`, rollback on `Err` or cancellation.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error};

use super::context::RequestContext;
use super::error::LedgerError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};

/// Single-statement primitives.
///
/// Every method is atomic on its own. `add_account_balance` is a single
/// read-modify-write on the row and takes the row lock for the rest of the
/// enclosing transaction.
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, params: &CreateAccountParams)
    -> Result<Account, LedgerError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError>;

    /// Accounts of one owner ordered by id
    async fn list_accounts(
        &mut self,
        params: &ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError>;

    /// Apply a signed delta and return the updated row.
    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError>;

    async fn delete_account(&mut self, id: i64) -> Result<(), LedgerError>;

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError>;

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError>;

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError>;

    async fn list_entries(&mut self, params: ListEntriesParams)
    -> Result<Vec<Entry>, LedgerError>;

    /// Sum of every entry amount recorded for the account (0 if none)
    async fn sum_entries(&mut self, account_id: i64) -> Result<i64, LedgerError>;
}

/// A connection inside an open transaction.
///
/// Dropping it without calling either method discards its writes.
#[async_trait]
pub trait Transactional: Queries + Sized {
    async fn commit(self) -> Result<(), LedgerError>;

    async fn rollback(self) -> Result<(), LedgerError>;

    /// Bound every later statement, lock waits included, by `remaining`.
    ///
    /// Stores whose waits end as soon as the future is dropped keep the
    /// default.
    async fn set_timeout(&mut self, _remaining: Duration) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Stop a statement that is still running after its future was dropped.
    ///
    /// Called before rollback when the scope was cancelled. Best effort.
    async fn interrupt(&mut self) {}
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Conn: Queries + 'static;
    type Tx: Transactional + 'static;

    /// Auto-commit connection for single-statement operations
    async fn acquire(&self) -> Result<Self::Conn, LedgerError>;

    /// Open a transaction on a dedicated connection
    async fn begin(&self) -> Result<Self::Tx, LedgerError>;
}

/// Run `f` as one all-or-nothing unit.
///
/// - `Ok` from `f`: commit. A commit failure becomes `CommitFailed`.
/// - `Err` from `f`, or `ctx` firing: rollback, then return the error.
///   If the rollback itself fails, both errors are returned in
///   `RollbackFailed`.
///
/// When `ctx` has a deadline the store is told to enforce it too, so a
/// statement parked on a row lock does not outlive the scope. Commit and
/// rollback are not subject to `ctx`.
pub async fn with_transaction<S, T, F>(
    store: &S,
    ctx: &RequestContext,
    f: F,
) -> Result<T, LedgerError>
where
    S: LedgerStore + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
{
    let mut tx = ctx.run(store.begin()).await?;
    if let Some(remaining) = ctx.remaining() {
        ctx.run(tx.set_timeout(remaining)).await?;
    }

    match ctx.run(f(&mut tx)).await {
        Ok(value) => {
            tx.commit().await.map_err(|e| {
                error!(error = %e, "Failed to commit transaction");
                LedgerError::CommitFailed(Box::new(e))
            })?;
            Ok(value)
        }
        Err(cause) => {
            debug!(error = %cause, "Rolling back transaction");
            if matches!(cause, LedgerError::Cancelled(_)) {
                tx.interrupt().await;
            }
            match tx.rollback().await {
                Ok(()) => Err(cause),
                Err(rollback) => {
                    error!(error = %cause, rollback_error = %rollback, "Rollback failed");
                    Err(LedgerError::RollbackFailed {
                        cause: Box::new(cause),
                        rollback: Box::new(rollback),
                    })
                }
            }
        }
    }
}
