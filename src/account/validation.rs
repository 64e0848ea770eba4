//! Input validation for account operations
//!
//! Validated types for currency, owner and paging. Fields are private so a
//! value can only be obtained through `new()`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::PaginationConfig;
use crate::ledger::LedgerError;

// ============================================================================
// Validation Errors
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Unsupported currency: '{0}'")]
    UnsupportedCurrency(String),

    #[error("Owner must not be empty")]
    EmptyOwner,

    #[error("Invalid length for {field}: expected {min}-{max}, got {actual}")]
    InvalidLength {
        field: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("Page id must be at least 1, got {0}")]
    InvalidPageId(i32),

    #[error("Page size must be within {min}-{max}, got {actual}")]
    InvalidPageSize { min: i32, max: i32, actual: i32 },

    #[error("Invalid account id: {0}")]
    InvalidAccountId(i64),
}

impl From<ValidationError> for LedgerError {
    fn from(e: ValidationError) -> Self {
        LedgerError::Validation(e.to_string())
    }
}

// ============================================================================
// Currency
// ============================================================================

/// Supported account currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Cad,
    Inr,
}

impl Currency {
    pub const ALL: [Currency; 4] = [Currency::Usd, Currency::Eur, Currency::Cad, Currency::Inr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Cad => "CAD",
            Currency::Inr => "INR",
        }
    }
}

impl FromStr for Currency {
    type Err = ValidationError;

    /// Exact, case-sensitive match
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ValidationError::UnsupportedCurrency(s.to_string()))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Owner
// ============================================================================

/// Opaque owner identity, as handed over by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(String);

impl Owner {
    pub const MAX_LEN: usize = 255;

    /// # Errors
    /// `EmptyOwner` for blank input, `InvalidLength` above `MAX_LEN` bytes
    pub fn new(owner: &str) -> Result<Self, ValidationError> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(ValidationError::EmptyOwner);
        }
        if owner.len() > Self::MAX_LEN {
            return Err(ValidationError::InvalidLength {
                field: "owner",
                min: 1,
                max: Self::MAX_LEN,
                actual: owner.len(),
            });
        }
        Ok(Self(owner.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Owner {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// PageRequest
// ============================================================================

/// One page of a listing. `page_id` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page_id: i32,
    page_size: i32,
}

impl PageRequest {
    pub fn new(
        page_id: i32,
        page_size: i32,
        bounds: &PaginationConfig,
    ) -> Result<Self, ValidationError> {
        if page_id < 1 {
            return Err(ValidationError::InvalidPageId(page_id));
        }
        if page_size < bounds.min_page_size || page_size > bounds.max_page_size {
            return Err(ValidationError::InvalidPageSize {
                min: bounds.min_page_size,
                max: bounds.max_page_size,
                actual: page_size,
            });
        }
        Ok(Self { page_id, page_size })
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    pub fn offset(&self) -> i64 {
        (i64::from(self.page_id) - 1) * i64::from(self.page_size)
    }
}

pub fn validate_account_id(id: i64) -> Result<i64, ValidationError> {
    if id < 1 {
        return Err(ValidationError::InvalidAccountId(id));
    }
    Ok(id)
}
