//! Ledger core
//!
//! Account balances, the append-only entry journal and atomic two-account
//! transfers.
//!
//! # Write path
//!
//! ```text
//! transfer(ctx, params)
//!   └─ with_transaction ─┬─ INSERT transfer
//!                        ├─ INSERT entry (-amount, source)
//!                        ├─ INSERT entry (+amount, destination)
//!                        └─ UPDATE balances, ascending account id
//! ```
//!
//! # Invariants
//!
//! 1. **All-or-nothing**: transfer, both entries and both balance updates
//!    commit together or not at all
//! 2. **Lock order**: balance rows are always locked in ascending id order
//! 3. **Journal**: the entries of an account sum to its balance unless the
//!    balance was adjusted outside a transfer

pub mod context;
pub mod error;
pub mod journal;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;
pub mod transfer;


// Re-exports for convenience
pub use context::RequestContext;
pub use error::{CancelReason, LedgerError};
pub use journal::{Journal, Reconciliation};
pub use memory::{LedgerSnapshot, MemoryLedgerStore};
pub use models::{Account, Entry, Transfer, TransferParams, TransferResult};
pub use postgres::PgLedgerStore;
pub use store::{LedgerStore, Queries, Transactional, with_transaction};
pub use transfer::{OverdraftPolicy, TransferOrchestrator};
