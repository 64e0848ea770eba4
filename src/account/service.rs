//! Account Service
//!
//! Account lifecycle on top of the ledger store. Every operation is a single
//! auto-commit statement; none of them opens a transaction.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::validation::{Currency, Owner, PageRequest, validate_account_id};
use crate::config::PaginationConfig;
use crate::ledger::models::{AddAccountBalanceParams, CreateAccountParams, ListAccountsParams};
use crate::ledger::{Account, LedgerError, LedgerStore, Queries};
use crate::workers::{PayloadSendVerifyEmail, TaskDistributor};

pub struct AccountService<S> {
    store: Arc<S>,
    tasks: Arc<dyn TaskDistributor>,
    pagination: PaginationConfig,
}

impl<S> Clone for AccountService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            tasks: self.tasks.clone(),
            pagination: self.pagination,
        }
    }
}

impl<S: LedgerStore> AccountService<S> {
    pub fn new(
        store: Arc<S>,
        tasks: Arc<dyn TaskDistributor>,
        pagination: PaginationConfig,
    ) -> Self {
        Self {
            store,
            tasks,
            pagination,
        }
    }

    /// Open a zero-balance account.
    ///
    /// An owner holds at most one account per currency; a second one is a
    /// `Conflict`. On success a verification email task is queued for the
    /// owner; failing to queue it is logged and does not fail the call.
    pub async fn create_account(
        &self,
        owner: &str,
        currency: &str,
    ) -> Result<Account, LedgerError> {
        let owner = Owner::new(owner)?;
        let currency: Currency = currency.parse()?;

        let account = self
            .store
            .acquire()
            .await?
            .create_account(&CreateAccountParams {
                owner: owner.as_str().to_string(),
                currency: currency.to_string(),
            })
            .await?;

        info!(
            account_id = account.id,
            owner = %account.owner,
            currency = %account.currency,
            "Account created"
        );

        let payload = PayloadSendVerifyEmail {
            username: owner.into_string(),
        };
        match self.tasks.distribute_send_verify_email(&payload) {
            Ok(task_id) => {
                debug!(account_id = account.id, task_id = %task_id, "Verify email queued")
            }
            Err(e) => {
                warn!(account_id = account.id, error = %e, "Failed to queue verify email")
            }
        }

        Ok(account)
    }

    pub async fn get_account(&self, id: i64) -> Result<Account, LedgerError> {
        let id = validate_account_id(id)?;
        self.store.acquire().await?.get_account(id).await
    }

    /// One page of the owner's accounts, ordered by id
    pub async fn list_accounts(
        &self,
        owner: &str,
        page_id: i32,
        page_size: i32,
    ) -> Result<Vec<Account>, LedgerError> {
        let owner = Owner::new(owner)?;
        let page = PageRequest::new(page_id, page_size, &self.pagination)?;

        self.store
            .acquire()
            .await?
            .list_accounts(&ListAccountsParams {
                owner: owner.into_string(),
                limit: page.limit(),
                offset: page.offset(),
            })
            .await
    }

    /// Apply a signed delta outside any transfer. No journal entry is written.
    pub async fn adjust_balance(&self, id: i64, amount: i64) -> Result<Account, LedgerError> {
        let id = validate_account_id(id)?;
        let account = self
            .store
            .acquire()
            .await?
            .add_account_balance(AddAccountBalanceParams { id, amount })
            .await?;

        info!(
            account_id = id,
            amount,
            balance = account.balance,
            "Account balance adjusted"
        );
        Ok(account)
    }

    /// Remove an account. Accounts with journal history cannot be removed.
    pub async fn delete_account(&self, id: i64) -> Result<(), LedgerError> {
        let id = validate_account_id(id)?;
        self.store.acquire().await?.delete_account(id).await?;
        info!(account_id = id, "Account deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::ledger::MemoryLedgerStore;
    use crate::workers::TaskError;

    /// Records dispatched payloads, optionally failing every dispatch
    #[derive(Default)]
    struct MockDistributor {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    impl TaskDistributor for MockDistributor {
        fn distribute_send_verify_email(
            &self,
            payload: &PayloadSendVerifyEmail,
        ) -> Result<Uuid, TaskError> {
            if self.fail {
                return Err(TaskError::QueueFull);
            }
            self.sent.lock().unwrap().push(payload.username.clone());
            Ok(Uuid::new_v4())
        }
    }

    fn service(tasks: Arc<MockDistributor>) -> AccountService<MemoryLedgerStore> {
        AccountService::new(
            Arc::new(MemoryLedgerStore::new()),
            tasks,
            PaginationConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_create_dispatches_verify_email() {
        let tasks = Arc::new(MockDistributor::default());
        let svc = service(tasks.clone());

        let account = svc.create_account("alice", "USD").await.unwrap();
        assert_eq!(account.owner, "alice");
        assert_eq!(account.currency, "USD");
        assert_eq!(account.balance, 0);
        assert_eq!(*tasks.sent.lock().unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_failure_does_not_fail_create() {
        let tasks = Arc::new(MockDistributor {
            fail: true,
            ..Default::default()
        });
        let svc = service(tasks);
        assert!(svc.create_account("alice", "EUR").await.is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let tasks = Arc::new(MockDistributor::default());
        let svc = service(tasks.clone());

        let err = svc.create_account("alice", "XYZ").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err = svc.create_account("", "USD").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(tasks.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_account_per_currency() {
        let svc = service(Arc::new(MockDistributor::default()));
        svc.create_account("alice", "USD").await.unwrap();
        svc.create_account("alice", "CAD").await.unwrap();

        let err = svc.create_account("alice", "USD").await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_adjust_get_delete() {
        let svc = service(Arc::new(MockDistributor::default()));
        let account = svc.create_account("bob", "INR").await.unwrap();

        let updated = svc.adjust_balance(account.id, 250).await.unwrap();
        assert_eq!(updated.balance, 250);
        let updated = svc.adjust_balance(account.id, -300).await.unwrap();
        assert_eq!(updated.balance, -50);
        assert_eq!(svc.get_account(account.id).await.unwrap().balance, -50);

        svc.delete_account(account.id).await.unwrap();
        assert!(matches!(
            svc.get_account(account.id).await,
            Err(LedgerError::NotFound { .. })
        ));
        assert!(matches!(
            svc.delete_account(account.id).await,
            Err(LedgerError::NotFound { .. })
        ));
        assert!(matches!(
            svc.adjust_balance(account.id, 1).await,
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_id() {
        let svc = service(Arc::new(MockDistributor::default()));
        let err = svc.get_account(0).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_list_pages() {
        let svc = service(Arc::new(MockDistributor::default()));
        for currency in ["USD", "EUR", "CAD", "INR"] {
            svc.create_account("carol", currency).await.unwrap();
        }
        svc.create_account("dave", "USD").await.unwrap();

        let page = svc.list_accounts("carol", 1, 5).await.unwrap();
        assert_eq!(page.len(), 4);
        assert!(page.iter().all(|a| a.is_owned_by("carol")));
        assert!(page.windows(2).all(|w| w[0].id < w[1].id));

        assert!(svc.list_accounts("carol", 2, 5).await.unwrap().is_empty());

        let err = svc.list_accounts("carol", 1, 4).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err = svc.list_accounts("carol", 0, 5).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
