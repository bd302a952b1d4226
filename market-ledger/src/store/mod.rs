//! Ledger Store abstraction
//!
//! A single capability set (get, insert-unique, version-guarded
//! conditional update, append-only) with two interchangeable backends:
//!
//! - [`MemoryStore`] for tests and embedders that want no disk state
//! - [`RocksStore`] for durable production storage
//!
//! The backend is selected by configuration, never by runtime feature
//! detection. The store is the sole source of truth: callers re-read
//! current state before acting and never cache records across requests.
//!
//! # Atomicity contract
//!
//! - `insert_*` fails if the key already exists; `insert_position`
//!   additionally enforces the one-position-per-(user, market) constraint
//!   and reports a violation as `Error::DuplicatePosition`.
//! - `update_*` succeeds only if the stored record's `version` equals
//!   `expected_version`; the record is persisted with
//!   `expected_version + 1` (the new version is returned, the caller's
//!   copy is stale afterwards). A mismatch is `Error::StorageConflict`.
//! - `append_trend` is append-only; trend points are never mutated.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::{
    config::{StoreBackend, StoreConfig},
    error::Result,
    types::{Market, Position, StreamId, TrendPoint, User, UserId},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Durable record storage the engine relies on for atomicity
pub trait LedgerStore: Send + Sync {
    /// Insert a new user; fails with `StorageConflict` if the id exists
    fn insert_user(&self, user: &User) -> Result<()>;

    /// Get user by id
    fn get_user(&self, id: &UserId) -> Result<Option<User>>;

    /// Conditionally update a user record; returns the new version
    fn update_user(&self, user: &User, expected_version: u64) -> Result<u64>;

    /// Insert a new market; fails with `StorageConflict` if the id exists
    fn insert_market(&self, market: &Market) -> Result<()>;

    /// Get market by id
    fn get_market(&self, id: Uuid) -> Result<Option<Market>>;

    /// Conditionally update a market record; returns the new version
    fn update_market(&self, market: &Market, expected_version: u64) -> Result<u64>;

    /// All markets currently in `Active` status
    fn active_markets(&self) -> Result<Vec<Market>>;

    /// Insert a new position, enforcing (user, market) uniqueness
    fn insert_position(&self, position: &Position) -> Result<()>;

    /// Get position by id
    fn get_position(&self, id: Uuid) -> Result<Option<Position>>;

    /// Get the single position a user holds on a market, if any
    fn position_for(&self, market_id: Uuid, user_id: &UserId) -> Result<Option<Position>>;

    /// All positions on a market
    fn positions_for_market(&self, market_id: Uuid) -> Result<Vec<Position>>;

    /// Conditionally update a position record; returns the new version
    fn update_position(&self, position: &Position, expected_version: u64) -> Result<u64>;

    /// Remove a position only if its version still matches
    ///
    /// Used by the bet rollback path; a `StorageConflict` here means
    /// settlement annotated the position first and it must stand.
    fn remove_position(&self, id: Uuid, expected_version: u64) -> Result<()>;

    /// Append one trend point
    fn append_trend(&self, point: &TrendPoint) -> Result<()>;

    /// Trend points for a stream in ascending time order
    ///
    /// `since` drops older points; a nonzero `limit` keeps only the most
    /// recent `limit` points.
    fn trend_for_stream(
        &self,
        stream_id: &StreamId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TrendPoint>>;

    /// Wipe all trend history for a stream (new-market chart baseline)
    fn clear_trend(&self, stream_id: &StreamId) -> Result<()>;
}

/// Open the store backend named by configuration
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn LedgerStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("Opened in-memory ledger store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Rocks => {
            let store = RocksStore::open(config)?;
            Ok(Arc::new(store))
        }
    }
}
