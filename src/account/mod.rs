//! Account management module
//!
//! Lifecycle of accounts: open, read, list, adjust and delete.

pub mod service;
pub mod validation;

// Re-export commonly used types
pub use service::AccountService;
pub use validation::{Currency, Owner, PageRequest, ValidationError};
