//! Error types for the market ledger

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// User record absent
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Market record absent
    #[error("market not found: {0}")]
    MarketNotFound(Uuid),

    /// Position record absent
    #[error("position not found: {0}")]
    PositionNotFound(Uuid),

    /// Uniqueness violation: one position per (user, market)
    #[error("duplicate position for user {user_id} on market {market_id}")]
    DuplicatePosition {
        /// User that already holds a position
        user_id: String,
        /// Market the position is on
        market_id: Uuid,
    },

    /// Debit would take the balance negative
    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance {
        /// Balance at the time of the failed debit
        balance: Decimal,
        /// Amount the debit required
        required: Decimal,
    },

    /// Lost a version-guarded update race; safe to retry read-modify-write
    #[error("storage conflict: {0}")]
    StorageConflict(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Storage error (RocksDB)
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
