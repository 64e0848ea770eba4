//! In-memory Ledger Store
//!
//! Behaves like the PostgreSQL store where it matters to the ledger:
//! - per-account row locks, taken by balance updates and deletes inside a
//!   transaction and held until the transaction ends
//! - writes stay private to their transaction until commit (read committed)
//! - ids come from sequences and are not reused after a rollback
//! - foreign keys and the `(owner, currency)` uniqueness rule are enforced
//!
//! Faults can be injected to exercise rollback paths.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::{debug, trace};

use super::error::LedgerError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use super::store::{LedgerStore, Queries, Transactional};

/// Committed state
#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

#[derive(Default)]
struct Faults {
    balance_update: Mutex<HashSet<i64>>,
    commit: AtomicBool,
    rollback: AtomicBool,
}

struct Inner {
    tables: Mutex<Tables>,
    row_locks: DashMap<i64, Arc<RowLock<()>>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    tx_counter: AtomicU64,
    faults: Faults,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, id: i64) -> Arc<RowLock<()>> {
        self.row_locks
            .entry(id)
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .value()
            .clone()
    }
}

/// Full committed state, for before/after comparisons
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub accounts: Vec<Account>,
    pub entries: Vec<Entry>,
    pub transfers: Vec<Transfer>,
}

impl LedgerSnapshot {
    pub fn account(&self, id: i64) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }
}

#[derive(Clone)]
pub struct MemoryLedgerStore {
    inner: Arc<Inner>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                row_locks: DashMap::new(),
                account_seq: AtomicI64::new(1),
                entry_seq: AtomicI64::new(1),
                transfer_seq: AtomicI64::new(1),
                tx_counter: AtomicU64::new(1),
                faults: Faults::default(),
            }),
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let tables = self.inner.tables();
        LedgerSnapshot {
            accounts: tables.accounts.values().cloned().collect(),
            entries: tables.entries.clone(),
            transfers: tables.transfers.clone(),
        }
    }

    /// Fail the next balance update on `account_id` (one-shot)
    pub fn fail_next_balance_update(&self, account_id: i64) {
        self.inner
            .faults
            .balance_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_id);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.inner.faults.commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.inner.faults.rollback.store(fail, Ordering::SeqCst);
    }

    fn open(&self) -> MemoryTx {
        MemoryTx {
            inner: self.inner.clone(),
            tx_id: self.inner.tx_counter.fetch_add(1, Ordering::SeqCst),
            locks: BTreeMap::new(),
            deltas: BTreeMap::new(),
            created: BTreeMap::new(),
            deleted: BTreeSet::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Conn = MemoryConn;
    type Tx = MemoryTx;

    async fn acquire(&self) -> Result<MemoryConn, LedgerError> {
        Ok(MemoryConn {
            store: self.clone(),
        })
    }

    async fn begin(&self) -> Result<MemoryTx, LedgerError> {
        let tx = self.open();
        debug!(tx_id = tx.tx_id, "Transaction started");
        Ok(tx)
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Open transaction. Dropping it releases its row locks and discards its writes.
pub struct MemoryTx {
    inner: Arc<Inner>,
    tx_id: u64,
    locks: BTreeMap<i64, OwnedMutexGuard<()>>,
    deltas: BTreeMap<i64, i64>,
    created: BTreeMap<i64, Account>,
    deleted: BTreeSet<i64>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

impl MemoryTx {
    /// Account as this transaction sees it
    fn view_account(&self, tables: &Tables, id: i64) -> Option<Account> {
        if self.deleted.contains(&id) {
            return None;
        }
        let mut account = self
            .created
            .get(&id)
            .or_else(|| tables.accounts.get(&id))
            .cloned()?;
        // The delta was range-checked against this base under the row lock
        account.balance = account
            .balance
            .saturating_add(self.deltas.get(&id).copied().unwrap_or_default());
        Some(account)
    }

    fn visible_accounts(&self, tables: &Tables) -> Vec<Account> {
        let ids: BTreeSet<i64> = tables
            .accounts
            .keys()
            .chain(self.created.keys())
            .copied()
            .collect();
        ids.into_iter()
            .filter_map(|id| self.view_account(tables, id))
            .collect()
    }

    fn visible_entries<'a>(&'a self, tables: &'a Tables) -> impl Iterator<Item = &'a Entry> {
        tables.entries.iter().chain(self.entries.iter())
    }

    fn visible_transfers<'a>(
        &'a self,
        tables: &'a Tables,
    ) -> impl Iterator<Item = &'a Transfer> {
        tables.transfers.iter().chain(self.transfers.iter())
    }

    async fn lock_row(&mut self, id: i64) {
        if self.locks.contains_key(&id) {
            return;
        }
        let lock = self.inner.row_lock(id);
        trace!(tx_id = self.tx_id, account_id = id, "Waiting for row lock");
        let guard = lock.lock_owned().await;
        trace!(tx_id = self.tx_id, account_id = id, "Row lock acquired");
        self.locks.insert(id, guard);
    }

    /// Publish every write atomically. Constraint checks run first, so a
    /// failure leaves the committed state untouched.
    fn apply(self) -> Result<(), LedgerError> {
        let inner = self.inner.clone();
        let mut tables = inner.tables();

        for account in self.created.values() {
            let taken = tables.accounts.values().any(|a| {
                !self.deleted.contains(&a.id)
                    && a.owner == account.owner
                    && a.currency == account.currency
            });
            if taken {
                return Err(duplicate_account(account));
            }
        }

        let exists = |id: i64| {
            !self.deleted.contains(&id)
                && (self.created.contains_key(&id) || tables.accounts.contains_key(&id))
        };
        for entry in &self.entries {
            if !exists(entry.account_id) {
                return Err(LedgerError::Conflict(format!(
                    "entry {} references missing account {}",
                    entry.id, entry.account_id
                )));
            }
        }
        for transfer in &self.transfers {
            for id in [transfer.from_account_id, transfer.to_account_id] {
                if !exists(id) {
                    return Err(LedgerError::Conflict(format!(
                        "transfer {} references missing account {}",
                        transfer.id, id
                    )));
                }
            }
        }
        for id in &self.deleted {
            if has_history(&tables, *id) {
                return Err(account_has_history(*id));
            }
        }

        let mut balances = Vec::with_capacity(self.deltas.len());
        for (id, delta) in &self.deltas {
            let base = self.created.get(id).or_else(|| tables.accounts.get(id));
            if let Some(base) = base {
                let balance = base.balance.checked_add(*delta).ok_or_else(out_of_range)?;
                balances.push((*id, balance));
            }
        }

        for (id, account) in &self.created {
            tables.accounts.insert(*id, account.clone());
        }
        for (id, balance) in balances {
            if let Some(account) = tables.accounts.get_mut(&id) {
                account.balance = balance;
            }
        }
        for id in &self.deleted {
            tables.accounts.remove(id);
        }
        tables.entries.extend(self.entries.iter().cloned());
        tables.transfers.extend(self.transfers.iter().cloned());

        // Row locks are released when `self` drops, after the tables guard.
        drop(tables);
        Ok(())
    }
}

#[async_trait]
impl Transactional for MemoryTx {
    async fn commit(self) -> Result<(), LedgerError> {
        let tx_id = self.tx_id;
        if self.inner.faults.commit.load(Ordering::SeqCst) {
            return Err(LedgerError::TransientStore(
                "injected commit failure".to_string(),
            ));
        }
        self.apply()?;
        debug!(tx_id, "Transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        let tx_id = self.tx_id;
        if self.inner.faults.rollback.load(Ordering::SeqCst) {
            return Err(LedgerError::TransientStore(
                "injected rollback failure".to_string(),
            ));
        }
        drop(self);
        debug!(tx_id, "Transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(
        &mut self,
        params: &CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        let tables = self.inner.tables();
        let taken = self
            .visible_accounts(&tables)
            .iter()
            .any(|a| a.owner == params.owner && a.currency == params.currency);
        drop(tables);

        let account = Account {
            id: self.inner.account_seq.fetch_add(1, Ordering::SeqCst),
            owner: params.owner.clone(),
            balance: 0,
            currency: params.currency.clone(),
            created_at: Utc::now(),
        };
        if taken {
            return Err(duplicate_account(&account));
        }
        self.created.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        let tables = self.inner.tables();
        self.view_account(&tables, id)
            .ok_or_else(|| LedgerError::not_found("account", id))
    }

    async fn list_accounts(
        &mut self,
        params: &ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError> {
        let tables = self.inner.tables();
        let accounts = self
            .visible_accounts(&tables)
            .into_iter()
            .filter(|a| a.owner == params.owner);
        Ok(paginate(accounts, params.limit, params.offset))
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError> {
        self.lock_row(params.id).await;

        let injected = self
            .inner
            .faults
            .balance_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&params.id);
        if injected {
            return Err(LedgerError::TransientStore(format!(
                "injected failure updating account {}",
                params.id
            )));
        }

        let tables = self.inner.tables();
        let mut account = self
            .view_account(&tables, params.id)
            .ok_or_else(|| LedgerError::not_found("account", params.id))?;
        drop(tables);

        account.balance = account
            .balance
            .checked_add(params.amount)
            .ok_or_else(out_of_range)?;
        let delta = self.deltas.entry(params.id).or_default();
        *delta = delta.checked_add(params.amount).ok_or_else(out_of_range)?;
        Ok(account)
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), LedgerError> {
        self.lock_row(id).await;

        let tables = self.inner.tables();
        if self.view_account(&tables, id).is_none() {
            return Err(LedgerError::not_found("account", id));
        }
        let referenced = has_history(&tables, id)
            || self.entries.iter().any(|e| e.account_id == id)
            || self
                .transfers
                .iter()
                .any(|t| t.from_account_id == id || t.to_account_id == id);
        drop(tables);

        if referenced {
            return Err(account_has_history(id));
        }
        if self.created.remove(&id).is_none() {
            self.deleted.insert(id);
        }
        self.deltas.remove(&id);
        Ok(())
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError> {
        if params.amount <= 0 {
            return Err(LedgerError::Validation(
                "transfer amount must be positive".to_string(),
            ));
        }
        let tables = self.inner.tables();
        for id in [params.from_account_id, params.to_account_id] {
            if self.view_account(&tables, id).is_none() {
                return Err(LedgerError::not_found("account", id));
            }
        }
        drop(tables);

        let transfer = Transfer {
            id: self.inner.transfer_seq.fetch_add(1, Ordering::SeqCst),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        let tables = self.inner.tables();
        self.visible_transfers(&tables)
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("transfer", id))
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let tables = self.inner.tables();
        let mut transfers: Vec<Transfer> = self
            .visible_transfers(&tables)
            .filter(|t| {
                t.from_account_id == params.from_account_id
                    || t.to_account_id == params.to_account_id
            })
            .cloned()
            .collect();
        transfers.sort_by_key(|t| t.id);
        Ok(paginate(transfers, params.limit, params.offset))
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError> {
        let tables = self.inner.tables();
        if self.view_account(&tables, params.account_id).is_none() {
            return Err(LedgerError::not_found("account", params.account_id));
        }
        drop(tables);

        let entry = Entry {
            id: self.inner.entry_seq.fetch_add(1, Ordering::SeqCst),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        let tables = self.inner.tables();
        self.visible_entries(&tables)
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("entry", id))
    }

    async fn list_entries(
        &mut self,
        params: ListEntriesParams,
    ) -> Result<Vec<Entry>, LedgerError> {
        let tables = self.inner.tables();
        let mut entries: Vec<Entry> = self
            .visible_entries(&tables)
            .filter(|e| e.account_id == params.account_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(paginate(entries, params.limit, params.offset))
    }

    async fn sum_entries(&mut self, account_id: i64) -> Result<i64, LedgerError> {
        let tables = self.inner.tables();
        self.visible_entries(&tables)
            .filter(|e| e.account_id == account_id)
            .try_fold(0i64, |sum, e| sum.checked_add(e.amount))
            .ok_or_else(out_of_range)
    }
}

// ============================================================================
// Auto-commit connection
// ============================================================================

/// Each call runs in its own transaction and commits immediately.
pub struct MemoryConn {
    store: MemoryLedgerStore,
}

impl MemoryConn {
    async fn autocommit<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: for<'t> FnOnce(&'t mut MemoryTx) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
        T: Send,
    {
        let mut tx = self.store.open();
        let value = op(&mut tx).await?;
        tx.apply()?;
        Ok(value)
    }
}

#[async_trait]
impl Queries for MemoryConn {
    async fn create_account(
        &mut self,
        params: &CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        let params = params.clone();
        self.autocommit(move |tx| Box::pin(async move { tx.create_account(&params).await }))
            .await
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        self.autocommit(move |tx| tx.get_account(id)).await
    }

    async fn list_accounts(
        &mut self,
        params: &ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError> {
        let params = params.clone();
        self.autocommit(move |tx| Box::pin(async move { tx.list_accounts(&params).await }))
            .await
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError> {
        self.autocommit(move |tx| tx.add_account_balance(params)).await
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), LedgerError> {
        self.autocommit(move |tx| tx.delete_account(id)).await
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError> {
        self.autocommit(move |tx| tx.create_transfer(params)).await
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        self.autocommit(move |tx| tx.get_transfer(id)).await
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError> {
        self.autocommit(move |tx| tx.list_transfers(params)).await
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError> {
        self.autocommit(move |tx| tx.create_entry(params)).await
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        self.autocommit(move |tx| tx.get_entry(id)).await
    }

    async fn list_entries(
        &mut self,
        params: ListEntriesParams,
    ) -> Result<Vec<Entry>, LedgerError> {
        self.autocommit(move |tx| tx.list_entries(params)).await
    }

    async fn sum_entries(&mut self, account_id: i64) -> Result<i64, LedgerError> {
        self.autocommit(move |tx| tx.sum_entries(account_id)).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn paginate<T>(items: impl IntoIterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or_default();
    let limit = usize::try_from(limit).unwrap_or_default();
    items.into_iter().skip(offset).take(limit).collect()
}

fn has_history(tables: &Tables, id: i64) -> bool {
    tables.entries.iter().any(|e| e.account_id == id)
        || tables
            .transfers
            .iter()
            .any(|t| t.from_account_id == id || t.to_account_id == id)
}

/// Same wording Postgres uses for SQLSTATE 22003 on a BIGINT
fn out_of_range() -> LedgerError {
    LedgerError::Validation("bigint out of range".to_string())
}

fn duplicate_account(account: &Account) -> LedgerError {
    LedgerError::Conflict(format!(
        "account for owner '{}' in {} already exists",
        account.owner, account.currency
    ))
}

fn account_has_history(id: i64) -> LedgerError {
    LedgerError::Conflict(format!("account {} is referenced by journal rows", id))
}
