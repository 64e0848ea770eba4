//! Transfer properties against the in-memory store
//!
//! Balance arithmetic, all-or-nothing rollback, lock ordering and
//! cancellation, exercised through the public API only.

use std::sync::Arc;
use std::time::Duration;

use ledger_core::ledger::LedgerSnapshot;
use ledger_core::ledger::models::{AddAccountBalanceParams, CreateAccountParams};
use ledger_core::ledger::store::{LedgerStore, Queries, Transactional, with_transaction};
use ledger_core::ledger::transfer::apply_balance_deltas;
use ledger_core::{
    CancelReason, Journal, LedgerError, MemoryLedgerStore, OverdraftPolicy, RequestContext,
    TransferOrchestrator, TransferParams,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

async fn open(store: &MemoryLedgerStore, owner: &str, balance: i64) -> i64 {
    let mut conn = store.acquire().await.unwrap();
    let account = conn
        .create_account(&CreateAccountParams {
            owner: owner.to_string(),
            currency: "USD".to_string(),
        })
        .await
        .unwrap();
    conn.add_account_balance(AddAccountBalanceParams {
        id: account.id,
        amount: balance,
    })
    .await
    .unwrap();
    account.id
}

fn params(from: i64, to: i64, amount: i64) -> TransferParams {
    TransferParams {
        from_account_id: from,
        to_account_id: to,
        amount,
    }
}

fn balance(snapshot: &LedgerSnapshot, id: i64) -> i64 {
    snapshot.account(id).unwrap().balance
}

struct Harness {
    store: Arc<MemoryLedgerStore>,
    orchestrator: TransferOrchestrator<MemoryLedgerStore>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let orchestrator = TransferOrchestrator::new(store.clone());
        Self {
            store,
            orchestrator,
        }
    }

    async fn transfer(&self, from: i64, to: i64, amount: i64) -> Result<(), LedgerError> {
        self.orchestrator
            .transfer(&RequestContext::new(), params(from, to, amount))
            .await
            .map(|_| ())
    }
}

// ============================================================================
// Example scenarios
// ============================================================================

#[tokio::test]
async fn transfer_between_two_accounts() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 1000).await;
    let b = open(&h.store, "bob", 500).await;

    let result = h
        .orchestrator
        .transfer(&RequestContext::new(), params(a, b, 300))
        .await
        .unwrap();

    assert_eq!(result.transfer.from_account_id, a);
    assert_eq!(result.transfer.to_account_id, b);
    assert_eq!(result.from_account.balance, 700);
    assert_eq!(result.to_account.balance, 800);
    assert_eq!(result.from_entry.account_id, a);
    assert_eq!(result.from_entry.amount, -300);
    assert_eq!(result.to_entry.account_id, b);
    assert_eq!(result.to_entry.amount, 300);

    let snapshot = h.store.snapshot();
    assert_eq!(balance(&snapshot, a), 700);
    assert_eq!(balance(&snapshot, b), 800);
    assert_eq!(snapshot.transfers, vec![result.transfer.clone()]);
    assert_eq!(snapshot.entries.len(), 2);
}

#[tokio::test]
async fn result_follows_direction_when_source_has_higher_id() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 1000).await;
    let b = open(&h.store, "bob", 500).await;
    assert!(b > a);

    // Locks are taken a then b, but the result still reads source first
    let result = h
        .orchestrator
        .transfer(&RequestContext::new(), params(b, a, 200))
        .await
        .unwrap();

    assert_eq!(result.from_account.id, b);
    assert_eq!(result.from_account.balance, 300);
    assert_eq!(result.to_account.id, a);
    assert_eq!(result.to_account.balance, 1200);
    assert_eq!(result.from_entry.account_id, b);
    assert_eq!(result.from_entry.amount, -200);
    assert_eq!(result.to_entry.account_id, a);
    assert_eq!(result.to_entry.amount, 200);
}

#[tokio::test]
async fn transfer_to_missing_account_changes_nothing() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 1000).await;
    let before = h.store.snapshot();

    let err = h.transfer(a, 999, 10).await.unwrap_err();

    assert!(matches!(err, LedgerError::NotFound { id: 999, .. }));
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn transfer_from_missing_account_changes_nothing() {
    let h = Harness::new();
    let b = open(&h.store, "bob", 0).await;
    let before = h.store.snapshot();

    let err = h.transfer(777, b, 10).await.unwrap_err();

    assert!(matches!(err, LedgerError::NotFound { id: 777, .. }));
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn zero_amount_is_rejected_before_the_store() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 1000).await;
    let b = open(&h.store, "bob", 500).await;
    let before = h.store.snapshot();

    for amount in [0, -1] {
        let err = h.transfer(a, b, amount).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
    assert_eq!(h.store.snapshot(), before);

    // No transfer id was consumed by the rejected requests
    let result = h
        .orchestrator
        .transfer(&RequestContext::new(), params(a, b, 1))
        .await
        .unwrap();
    assert_eq!(result.transfer.id, 1);
}

// ============================================================================
// Journal invariants
// ============================================================================

#[tokio::test]
async fn every_transfer_writes_one_transfer_and_two_entries() {
    let h = Harness::new();
    let ids = [
        open(&h.store, "a", 0).await,
        open(&h.store, "b", 0).await,
        open(&h.store, "c", 0).await,
    ];

    let moves = [(0, 1, 40), (1, 2, 15), (2, 0, 5), (0, 2, 7), (1, 0, 3)];
    for (from, to, amount) in moves {
        h.transfer(ids[from], ids[to], amount).await.unwrap();
    }

    let snapshot = h.store.snapshot();
    assert_eq!(snapshot.transfers.len(), moves.len());
    assert_eq!(snapshot.entries.len(), 2 * moves.len());

    // Transfers run one after another, so each one's legs are adjacent in the journal
    for (transfer, legs) in snapshot.transfers.iter().zip(snapshot.entries.chunks(2)) {
        assert_eq!(legs[0].account_id, transfer.from_account_id);
        assert_eq!(legs[0].amount, -transfer.amount);
        assert_eq!(legs[1].account_id, transfer.to_account_id);
        assert_eq!(legs[1].amount, transfer.amount);
    }

    // Total money is conserved and every account matches its journal
    let total: i64 = snapshot.accounts.iter().map(|a| a.balance).sum();
    assert_eq!(total, 0);
    let journal = Journal::new(h.store.clone());
    for id in ids {
        assert!(journal.reconcile(id).await.unwrap().is_balanced());
    }
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn failure_on_second_balance_update_rolls_back_everything() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 1000).await;
    let b = open(&h.store, "bob", 500).await;
    let before = h.store.snapshot();

    // a < b, so a's row is updated first and b's update fails
    h.store.fail_next_balance_update(b);
    let err = h.transfer(a, b, 300).await.unwrap_err();

    assert!(matches!(err, LedgerError::TransientStore(_)));
    assert_eq!(h.store.snapshot(), before);

    // The store is usable again afterwards
    h.transfer(a, b, 300).await.unwrap();
    assert_eq!(balance(&h.store.snapshot(), a), 700);
}

#[tokio::test]
async fn rollback_failure_reports_both_errors() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 1000).await;
    let b = open(&h.store, "bob", 500).await;
    let before = h.store.snapshot();

    h.store.fail_next_balance_update(a);
    h.store.set_fail_rollback(true);
    let err = h.transfer(b, a, 10).await.unwrap_err();
    h.store.set_fail_rollback(false);

    match &err {
        LedgerError::RollbackFailed { cause, rollback } => {
            assert!(matches!(**cause, LedgerError::TransientStore(_)));
            assert!(rollback.to_string().contains("rollback"));
        }
        other => panic!("expected RollbackFailed, got {other:?}"),
    }
    assert!(err.is_transaction_error());
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn commit_failure_is_a_transaction_error_with_unknown_outcome() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 1000).await;
    let b = open(&h.store, "bob", 500).await;
    let before = h.store.snapshot();

    h.store.set_fail_commit(true);
    let err = h.transfer(a, b, 10).await.unwrap_err();
    h.store.set_fail_commit(false);

    assert!(matches!(err, LedgerError::CommitFailed(_)));
    assert_eq!(err.code(), "TRANSACTION_ERROR");
    assert!(err.outcome_unknown());
    assert!(!err.is_retryable());
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn overdraft_rejection_rolls_back() {
    let store = Arc::new(MemoryLedgerStore::new());
    let a = open(&store, "alice", 50).await;
    let b = open(&store, "bob", 0).await;
    let before = store.snapshot();

    let orchestrator =
        TransferOrchestrator::new(store.clone()).with_overdraft_policy(OverdraftPolicy::Reject);
    let err = orchestrator
        .transfer(&RequestContext::new(), params(a, b, 60))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    assert_eq!(store.snapshot(), before);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposite_direction_transfers_never_deadlock() {
    const N: usize = 50;
    let h = Harness::new();
    let a = open(&h.store, "alice", 10_000).await;
    let b = open(&h.store, "bob", 10_000).await;

    let mut handles = Vec::with_capacity(N);
    for i in 0..N {
        let orchestrator = h.orchestrator.clone();
        let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
        handles.push(tokio::spawn(async move {
            orchestrator
                .transfer(&RequestContext::new(), params(from, to, 10))
                .await
        }));
    }

    let results = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(handles))
        .await
        .expect("transfers deadlocked");
    for result in results {
        result.unwrap().unwrap();
    }

    let snapshot = h.store.snapshot();
    assert_eq!(balance(&snapshot, a), 10_000);
    assert_eq!(balance(&snapshot, b), 10_000);
    assert_eq!(snapshot.transfers.len(), N);
    assert_eq!(snapshot.entries.len(), 2 * N);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_account_updates_in_any_order_never_deadlock() {
    let store = Arc::new(MemoryLedgerStore::new());
    let ids = [
        open(&store, "a", 0).await,
        open(&store, "b", 0).await,
        open(&store, "c", 0).await,
        open(&store, "d", 0).await,
    ];

    let mut handles = Vec::new();
    for i in 0..40 {
        let store = store.clone();
        // Rotate the listed order so callers disagree about which row comes first
        let mut deltas: Vec<(i64, i64)> = ids.iter().map(|&id| (id, 1)).collect();
        deltas.rotate_left(i % ids.len());
        handles.push(tokio::spawn(async move {
            with_transaction(store.as_ref(), &RequestContext::new(), move |tx| {
                Box::pin(async move {
                    apply_balance_deltas(tx, &deltas).await?;
                    Ok::<_, LedgerError>(())
                })
            })
            .await
        }));
    }

    let results = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(handles))
        .await
        .expect("multi-account updates deadlocked");
    for result in results {
        result.unwrap().unwrap();
    }

    let snapshot = store.snapshot();
    for id in ids {
        assert_eq!(balance(&snapshot, id), 40);
    }
}

#[tokio::test]
async fn disjoint_pairs_do_not_wait_for_each_other() {
    let h = Harness::new();
    let a = open(&h.store, "a", 100).await;
    let b = open(&h.store, "b", 100).await;
    let c = open(&h.store, "c", 100).await;
    let d = open(&h.store, "d", 100).await;

    // Another transaction holds a's row lock
    let mut holder = h.store.begin().await.unwrap();
    holder
        .add_account_balance(AddAccountBalanceParams { id: a, amount: 0 })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), h.transfer(c, d, 10))
        .await
        .expect("disjoint transfer was blocked")
        .unwrap();

    // a -> b has to wait for the holder
    let blocked = tokio::time::timeout(Duration::from_millis(100), h.transfer(a, b, 10)).await;
    assert!(blocked.is_err());

    holder.commit().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), h.transfer(a, b, 10))
        .await
        .expect("transfer still blocked after commit")
        .unwrap();

    let snapshot = h.store.snapshot();
    assert_eq!(balance(&snapshot, a), 90);
    assert_eq!(balance(&snapshot, b), 110);
    assert_eq!(balance(&snapshot, c), 90);
    assert_eq!(balance(&snapshot, d), 110);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancellation_while_waiting_for_a_lock_rolls_back() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 100).await;
    let b = open(&h.store, "bob", 100).await;
    let before = h.store.snapshot();

    let mut holder = h.store.begin().await.unwrap();
    holder
        .add_account_balance(AddAccountBalanceParams { id: b, amount: 0 })
        .await
        .unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = h
        .orchestrator
        .transfer(&RequestContext::with_cancellation(token), params(a, b, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled(CancelReason::Cancelled)));
    assert!(!err.is_retryable());

    holder.rollback().await.unwrap();
    assert_eq!(h.store.snapshot(), before);

    // a's row lock was released by the rollback
    tokio::time::timeout(Duration::from_secs(1), h.transfer(a, b, 10))
        .await
        .expect("row lock leaked by cancelled transfer")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn deadline_while_waiting_for_a_lock_rolls_back() {
    let store = Arc::new(MemoryLedgerStore::new());
    let a = open(&store, "alice", 100).await;
    let b = open(&store, "bob", 100).await;
    let before = store.snapshot();

    let mut holder = store.begin().await.unwrap();
    holder
        .add_account_balance(AddAccountBalanceParams { id: b, amount: 0 })
        .await
        .unwrap();

    let orchestrator =
        TransferOrchestrator::new(store.clone()).with_timeout(Duration::from_millis(200));
    let err = orchestrator
        .transfer(&RequestContext::new(), params(a, b, 10))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LedgerError::Cancelled(CancelReason::DeadlineExceeded)
    ));
    assert!(err.is_retryable());
    drop(holder);
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn already_cancelled_context_touches_nothing() {
    let h = Harness::new();
    let a = open(&h.store, "alice", 100).await;
    let b = open(&h.store, "bob", 100).await;
    let before = h.store.snapshot();

    let token = CancellationToken::new();
    token.cancel();
    let err = h
        .orchestrator
        .transfer(&RequestContext::with_cancellation(token), params(a, b, 10))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "CANCELLED");
    assert_eq!(h.store.snapshot(), before);
}
