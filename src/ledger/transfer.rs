//! Transfer Orchestrator
//!
//! Moves money between two accounts as one atomic unit: the transfer record,
//! both journal entries and both balance updates commit together or not at
//! all. The orchestrator keeps no state of its own; all coordination happens
//! through the store's row locks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::context::RequestContext;
use super::error::LedgerError;
use super::models::{
    Account, AddAccountBalanceParams, CreateEntryParams, TransferParams, TransferResult,
};
use super::store::{LedgerStore, Queries, with_transaction};

/// What to do when a transfer would leave the source balance negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverdraftPolicy {
    /// Negative balances are allowed
    #[default]
    Allow,
    /// Abort the transfer with `InsufficientFunds`
    Reject,
}

/// Merge `(account_id, delta)` pairs into one delta per account, in
/// ascending id order.
///
/// Every multi-account write goes through this ordering so that two
/// transactions touching the same rows always lock them in the same order.
pub fn lock_order(deltas: &[(i64, i64)]) -> Result<BTreeMap<i64, i64>, LedgerError> {
    let mut merged: BTreeMap<i64, i64> = BTreeMap::new();
    for &(account_id, delta) in deltas {
        let slot = merged.entry(account_id).or_default();
        *slot = slot.checked_add(delta).ok_or_else(|| {
            LedgerError::Validation(format!("delta overflow on account {}", account_id))
        })?;
    }
    Ok(merged)
}

/// Apply balance deltas in ascending account id order.
///
/// Returns the updated rows keyed by account id.
pub async fn apply_balance_deltas<Q>(
    q: &mut Q,
    deltas: &[(i64, i64)],
) -> Result<BTreeMap<i64, Account>, LedgerError>
where
    Q: Queries + ?Sized,
{
    let ordered = lock_order(deltas)?;
    let mut updated = BTreeMap::new();
    for (id, amount) in ordered {
        let account = q
            .add_account_balance(AddAccountBalanceParams { id, amount })
            .await?;
        updated.insert(id, account);
    }
    Ok(updated)
}

/// Reject malformed requests before touching the store.
pub fn validate_transfer(params: &TransferParams) -> Result<(), LedgerError> {
    if params.amount <= 0 {
        return Err(LedgerError::Validation(format!(
            "amount must be positive, got {}",
            params.amount
        )));
    }
    if params.from_account_id <= 0 {
        return Err(LedgerError::Validation(format!(
            "invalid from_account_id: {}",
            params.from_account_id
        )));
    }
    if params.to_account_id <= 0 {
        return Err(LedgerError::Validation(format!(
            "invalid to_account_id: {}",
            params.to_account_id
        )));
    }
    if params.from_account_id == params.to_account_id {
        return Err(LedgerError::Validation(
            "source and destination accounts must differ".to_string(),
        ));
    }
    Ok(())
}

pub struct TransferOrchestrator<S> {
    store: Arc<S>,
    overdraft: OverdraftPolicy,
    timeout: Option<Duration>,
}

impl<S> Clone for TransferOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            overdraft: self.overdraft,
            timeout: self.timeout,
        }
    }
}

impl<S: LedgerStore> TransferOrchestrator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            overdraft: OverdraftPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_overdraft_policy(mut self, policy: OverdraftPolicy) -> Self {
        self.overdraft = policy;
        self
    }

    /// Upper bound on one transfer, applied on top of the caller's context.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute one transfer.
    ///
    /// # Errors
    /// - `Validation`: bad amount or ids, nothing touched
    /// - `NotFound`: either account is missing, everything rolled back
    /// - `InsufficientFunds`: only under `OverdraftPolicy::Reject`
    /// - `Cancelled`: the context fired, everything rolled back
    /// - store and transaction errors as reported by the store
    pub async fn transfer(
        &self,
        ctx: &RequestContext,
        params: TransferParams,
    ) -> Result<TransferResult, LedgerError> {
        validate_transfer(&params)?;

        let ctx = match self.timeout {
            Some(timeout) => ctx.clone().with_timeout(timeout),
            None => ctx.clone(),
        };

        let from = params.from_account_id;
        let to = params.to_account_id;
        let amount = params.amount;
        let overdraft = self.overdraft;

        debug!(
            from_account_id = from,
            to_account_id = to,
            amount,
            "Transfer started"
        );

        let result = with_transaction(self.store.as_ref(), &ctx, move |tx| {
            Box::pin(async move {
                let transfer = tx.create_transfer(params.into()).await?;

                let from_entry = tx
                    .create_entry(CreateEntryParams {
                        account_id: from,
                        amount: -amount,
                    })
                    .await?;
                let to_entry = tx
                    .create_entry(CreateEntryParams {
                        account_id: to,
                        amount,
                    })
                    .await?;

                let mut updated = apply_balance_deltas(tx, &[(from, -amount), (to, amount)]).await?;
                let from_account = updated
                    .remove(&from)
                    .ok_or_else(|| LedgerError::not_found("account", from))?;
                let to_account = updated
                    .remove(&to)
                    .ok_or_else(|| LedgerError::not_found("account", to))?;

                if overdraft == OverdraftPolicy::Reject && from_account.balance < 0 {
                    return Err(LedgerError::InsufficientFunds {
                        account_id: from,
                        balance: from_account.balance,
                    });
                }

                Ok(TransferResult {
                    transfer,
                    from_account,
                    to_account,
                    from_entry,
                    to_entry,
                })
            })
        })
        .await;

        match &result {
            Ok(r) => info!(
                transfer_id = r.transfer.id,
                from_account_id = from,
                to_account_id = to,
                amount,
                "Transfer committed"
            ),
            Err(e) => warn!(
                from_account_id = from,
                to_account_id = to,
                amount,
                error = %e,
                code = e.code(),
                "Transfer failed"
            ),
        }

        result
    }
}
