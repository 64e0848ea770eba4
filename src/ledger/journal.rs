//! Entry Journal read side
//!
//! Entries and transfers are append-only. This module only reads them, plus a
//! reconciliation check that replays the journal against the stored balance.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::error::LedgerError;
use super::models::{Entry, ListEntriesParams, ListTransfersParams, Transfer};
use super::store::{LedgerStore, Queries};

/// Stored balance compared with the sum of the account's journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub account_id: i64,
    pub balance: i64,
    pub journal_sum: i64,
}

impl Reconciliation {
    /// Balance change that did not go through a journal entry, saturating
    /// at the `i64` bounds
    pub fn drift(&self) -> i64 {
        self.balance.saturating_sub(self.journal_sum)
    }

    pub fn is_balanced(&self) -> bool {
        self.balance == self.journal_sum
    }
}

pub struct Journal<S> {
    store: Arc<S>,
}

impl<S> Clone for Journal<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LedgerStore> Journal<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn get_entry(&self, id: i64) -> Result<Entry, LedgerError> {
        self.store.acquire().await?.get_entry(id).await
    }

    pub async fn list_entries(
        &self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, LedgerError> {
        self.store
            .acquire()
            .await?
            .list_entries(ListEntriesParams {
                account_id,
                limit,
                offset,
            })
            .await
    }

    pub async fn get_transfer(&self, id: i64) -> Result<Transfer, LedgerError> {
        self.store.acquire().await?.get_transfer(id).await
    }

    /// Transfers with `account_id` on either side
    pub async fn list_transfers(
        &self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transfer>, LedgerError> {
        self.store
            .acquire()
            .await?
            .list_transfers(ListTransfersParams {
                from_account_id: account_id,
                to_account_id: account_id,
                limit,
                offset,
            })
            .await
    }

    /// Compare the account balance with the sum of its entries.
    ///
    /// Both reads happen on the same connection. A transfer committing
    /// between them can make a healthy account look drifted, so callers
    /// should re-check before acting on a non-zero drift.
    pub async fn reconcile(&self, account_id: i64) -> Result<Reconciliation, LedgerError> {
        let mut conn = self.store.acquire().await?;
        let account = conn.get_account(account_id).await?;
        let journal_sum = conn.sum_entries(account_id).await?;

        let report = Reconciliation {
            account_id,
            balance: account.balance,
            journal_sum,
        };
        if !report.is_balanced() {
            warn!(
                account_id,
                balance = report.balance,
                journal_sum,
                drift = report.drift(),
                "Account balance does not match journal"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::context::RequestContext;
    use crate::ledger::memory::MemoryLedgerStore;
    use crate::ledger::models::{AddAccountBalanceParams, CreateAccountParams, TransferParams};
    use crate::ledger::transfer::TransferOrchestrator;

    async fn open(store: &MemoryLedgerStore, owner: &str) -> i64 {
        let mut conn = store.acquire().await.unwrap();
        conn.create_account(&CreateAccountParams {
            owner: owner.to_string(),
            currency: "EUR".to_string(),
        })
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_journal_follows_transfers() {
        let store = Arc::new(MemoryLedgerStore::new());
        let a = open(&store, "alice").await;
        let b = open(&store, "bob").await;
        let c = open(&store, "carol").await;
        let orchestrator = TransferOrchestrator::new(store.clone());
        let ctx = RequestContext::new();

        for (from, to, amount) in [(a, b, 10), (b, c, 4), (c, a, 1)] {
            orchestrator
                .transfer(
                    &ctx,
                    TransferParams {
                        from_account_id: from,
                        to_account_id: to,
                        amount,
                    },
                )
                .await
                .unwrap();
        }

        let journal = Journal::new(store.clone());
        let entries = journal.list_entries(b, 10, 0).await.unwrap();
        assert_eq!(
            entries.iter().map(|e| e.amount).collect::<Vec<_>>(),
            vec![10, -4]
        );

        let transfers = journal.list_transfers(a, 10, 0).await.unwrap();
        assert_eq!(transfers.len(), 2);
        let first = journal.get_transfer(transfers[0].id).await.unwrap();
        assert_eq!(first, transfers[0]);

        for id in [a, b, c] {
            assert!(journal.reconcile(id).await.unwrap().is_balanced());
        }
    }

    #[tokio::test]
    async fn test_reconcile_detects_out_of_band_change() {
        let store = Arc::new(MemoryLedgerStore::new());
        let a = open(&store, "alice").await;

        store
            .acquire()
            .await
            .unwrap()
            .add_account_balance(AddAccountBalanceParams { id: a, amount: 25 })
            .await
            .unwrap();

        let report = Journal::new(store).reconcile(a).await.unwrap();
        assert_eq!(report.drift(), 25);
        assert!(!report.is_balanced());
    }

    #[tokio::test]
    async fn test_journal_sum_overflow_is_reported_not_panicked() {
        let store = Arc::new(MemoryLedgerStore::new());
        let a = open(&store, "alice").await;
        let b = open(&store, "bob").await;
        let c = open(&store, "carol").await;

        store
            .acquire()
            .await
            .unwrap()
            .add_account_balance(AddAccountBalanceParams {
                id: a,
                amount: i64::MAX,
            })
            .await
            .unwrap();

        // Two maximal debits: a ends at -i64::MAX, its entries sum past i64::MIN
        let orchestrator = TransferOrchestrator::new(store.clone());
        for to in [b, c] {
            orchestrator
                .transfer(
                    &RequestContext::new(),
                    TransferParams {
                        from_account_id: a,
                        to_account_id: to,
                        amount: i64::MAX,
                    },
                )
                .await
                .unwrap();
        }

        let err = Journal::new(store).reconcile(a).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_drift_saturates() {
        let report = Reconciliation {
            account_id: 1,
            balance: i64::MAX,
            journal_sum: -1,
        };
        assert_eq!(report.drift(), i64::MAX);
        assert!(!report.is_balanced());
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let journal = Journal::new(Arc::new(MemoryLedgerStore::new()));
        assert!(matches!(
            journal.get_entry(1).await,
            Err(LedgerError::NotFound { entity: "entry", .. })
        ));
        assert!(matches!(
            journal.reconcile(1).await,
            Err(LedgerError::NotFound { entity: "account", .. })
        ));
    }
}
