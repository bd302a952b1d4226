//! StakeRail Market Ledger
//!
//! Record storage and balance-transaction discipline for the market
//! settlement engine.
//!
//! # Architecture
//!
//! - **Single source of truth**: the [`store::LedgerStore`] owns all
//!   mutable state; callers re-read before acting and never cache records
//!   across requests
//! - **Version-guarded writes**: every record carries a version; updates
//!   are conditional, so concurrent writers lose races instead of
//!   clobbering each other
//! - **Two backends**: in-memory for tests, RocksDB for production,
//!   selected by configuration
//!
//! # Invariants
//!
//! - Balances never go negative: every debit re-validates under
//!   compare-and-swap
//! - At most one position per (user, market): enforced by the store's
//!   uniqueness index, not by application-level checks
//! - Market volume counters are monotonic and `total == yes + no`
//! - Trend history is append-only

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod balance;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

// Re-exports
pub use balance::Balances;
pub use config::{StoreBackend, StoreConfig};
pub use error::{Error, Result};
pub use store::{open_store, LedgerStore, MemoryStore, RocksStore};
pub use types::{
    BetSide, Market, MarketStatus, Position, StreamId, TrendPoint, User, UserId, UserStats,
};

/// Install a global `tracing` subscriber driven by `RUST_LOG`
///
/// Intended for process entry points embedding the engine; a no-op if a
/// subscriber is already installed.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
