//! Error types for the settlement engine

use market_ledger::MarketStatus;
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
///
/// Storage-shaped failures (`NotFound`, `DuplicatePosition`,
/// `StorageConflict`, `InsufficientBalance`) arrive wrapped from the
/// ledger crate; the variants here cover lifecycle and request guards.
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error (storage, balances, uniqueness)
    #[error("ledger error: {0}")]
    Ledger(#[from] market_ledger::Error),

    /// Requesting user may not administer this market
    #[error("unauthorized: {user_id} does not administer market {market_id}")]
    Unauthorized {
        /// User that made the request
        user_id: String,
        /// Market the request targeted
        market_id: Uuid,
    },

    /// Illegal lifecycle transition
    #[error("invalid state: market {market_id} is {status}")]
    InvalidState {
        /// Market the request targeted
        market_id: Uuid,
        /// Status that made the transition illegal
        status: MarketStatus,
    },

    /// Bet-time guard: market is not open for betting
    #[error("market not active: {0}")]
    MarketNotActive(Uuid),

    /// Bet-time guard: betting window has closed
    #[error("market expired: {0}")]
    MarketExpired(Uuid),

    /// Non-positive or malformed stake/duration
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this failure is a concurrency race the caller may retry
    /// idempotently (never true for bet placement paths; see the bet
    /// flow, which compensates internally instead)
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Ledger(market_ledger::Error::StorageConflict(_))
        )
    }
}
