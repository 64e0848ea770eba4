//! Ledger Core - accounts, journal and atomic transfers
//!
//! # Modules
//!
//! - [`ledger`] - Store capability set, PostgreSQL and in-memory stores,
//!   transfer orchestrator and journal
//! - [`account`] - Account lifecycle service and input validation
//! - [`workers`] - Fire-and-forget background tasks
//! - [`config`] - YAML configuration
//! - [`db`] - Connection pool and schema bootstrap
//! - [`logging`] - Tracing subscriber setup

pub mod account;
pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod workers;

// Convenient re-exports at crate root
pub use account::AccountService;
pub use config::AppConfig;
pub use db::Database;
pub use ledger::{
    Account, CancelReason, Entry, Journal, LedgerError, LedgerStore, MemoryLedgerStore,
    OverdraftPolicy, PgLedgerStore, RequestContext, Transfer, TransferOrchestrator,
    TransferParams, TransferResult,
};
