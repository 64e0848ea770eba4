//! Ledger row types and operation parameters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A balance-holding account.
///
/// `balance` is in the smallest currency unit and only ever changes through
/// the store's delta-apply primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Ownership check for the calling layer
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }
}

/// One immutable journal line: a signed balance change on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Record of money moved from one account to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Store parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListAccountsParams {
    pub owner: String,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAccountBalanceParams {
    pub id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEntriesParams {
    pub account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Transfers where `from_account_id` is the source OR `to_account_id` is the
/// destination. Pass the same id twice to see both directions of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListTransfersParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

// ============================================================================
// Transfer request / result
// ============================================================================

/// Validated transfer request handed over by the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl From<TransferParams> for CreateTransferParams {
    fn from(p: TransferParams) -> Self {
        Self {
            from_account_id: p.from_account_id,
            to_account_id: p.to_account_id,
            amount: p.amount,
        }
    }
}

/// Everything a committed transfer produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_ownership() {
        let account = Account {
            id: 1,
            owner: "alice".to_string(),
            balance: 0,
            currency: "USD".to_string(),
            created_at: Utc::now(),
        };
        assert!(account.is_owned_by("alice"));
        assert!(!account.is_owned_by("bob"));
    }

    #[test]
    fn test_transfer_result_serializes_all_parts() {
        let now = Utc::now();
        let account = |id, balance| Account {
            id,
            owner: "alice".to_string(),
            balance,
            currency: "USD".to_string(),
            created_at: now,
        };
        let result = TransferResult {
            transfer: Transfer {
                id: 1,
                from_account_id: 1,
                to_account_id: 2,
                amount: 300,
                created_at: now,
            },
            from_account: account(1, 700),
            to_account: account(2, 800),
            from_entry: Entry {
                id: 1,
                account_id: 1,
                amount: -300,
                created_at: now,
            },
            to_entry: Entry {
                id: 2,
                account_id: 2,
                amount: 300,
                created_at: now,
            },
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["transfer"]["amount"], 300);
        assert_eq!(json["from_account"]["balance"], 700);
        assert_eq!(json["to_entry"]["amount"], 300);
    }
}
