//! In-memory store backend
//!
//! Backs tests and ephemeral deployments. Concurrency-correct, not merely
//! test-grade: the uniqueness constraint and the version-guarded updates
//! hold under concurrent callers, so the engine's race handling can be
//! exercised against this backend directly.

use crate::{
    error::{Error, Result},
    store::LedgerStore,
    types::{Market, MarketStatus, Position, StreamId, TrendPoint, User, UserId},
};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use uuid::Uuid;

/// DashMap-backed store
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<UserId, User>,
    markets: DashMap<Uuid, Market>,
    positions: DashMap<Uuid, Position>,
    /// (market, user) -> position id; entry occupancy is the uniqueness
    /// constraint
    position_index: DashMap<(Uuid, UserId), Uuid>,
    trend: DashMap<StreamId, Vec<TrendPoint>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn insert_user(&self, user: &User) -> Result<()> {
        match self.users.entry(user.user_id.clone()) {
            Entry::Occupied(_) => Err(Error::StorageConflict(format!(
                "user {} already exists",
                user.user_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(user.clone());
                Ok(())
            }
        }
    }

    fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self.users.get(id).map(|u| u.value().clone()))
    }

    fn update_user(&self, user: &User, expected_version: u64) -> Result<u64> {
        let mut entry = self
            .users
            .get_mut(&user.user_id)
            .ok_or_else(|| Error::UserNotFound(user.user_id.to_string()))?;

        if entry.version != expected_version {
            return Err(Error::StorageConflict(format!(
                "user {} at version {}, expected {}",
                user.user_id, entry.version, expected_version
            )));
        }

        let mut updated = user.clone();
        updated.version = expected_version + 1;
        *entry = updated;
        Ok(expected_version + 1)
    }

    fn insert_market(&self, market: &Market) -> Result<()> {
        match self.markets.entry(market.market_id) {
            Entry::Occupied(_) => Err(Error::StorageConflict(format!(
                "market {} already exists",
                market.market_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(market.clone());
                Ok(())
            }
        }
    }

    fn get_market(&self, id: Uuid) -> Result<Option<Market>> {
        Ok(self.markets.get(&id).map(|m| m.value().clone()))
    }

    fn update_market(&self, market: &Market, expected_version: u64) -> Result<u64> {
        let mut entry = self
            .markets
            .get_mut(&market.market_id)
            .ok_or(Error::MarketNotFound(market.market_id))?;

        if entry.version != expected_version {
            return Err(Error::StorageConflict(format!(
                "market {} at version {}, expected {}",
                market.market_id, entry.version, expected_version
            )));
        }

        let mut updated = market.clone();
        updated.version = expected_version + 1;
        *entry = updated;
        Ok(expected_version + 1)
    }

    fn active_markets(&self) -> Result<Vec<Market>> {
        Ok(self
            .markets
            .iter()
            .filter(|m| m.status == MarketStatus::Active)
            .map(|m| m.value().clone())
            .collect())
    }

    fn insert_position(&self, position: &Position) -> Result<()> {
        let key = (position.market_id, position.user_id.clone());
        match self.position_index.entry(key) {
            Entry::Occupied(_) => Err(Error::DuplicatePosition {
                user_id: position.user_id.to_string(),
                market_id: position.market_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(position.position_id);
                self.positions.insert(position.position_id, position.clone());
                Ok(())
            }
        }
    }

    fn get_position(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.positions.get(&id).map(|p| p.value().clone()))
    }

    fn position_for(&self, market_id: Uuid, user_id: &UserId) -> Result<Option<Position>> {
        let id = match self.position_index.get(&(market_id, user_id.clone())) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_position(id)
    }

    fn positions_for_market(&self, market_id: Uuid) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .iter()
            .filter(|p| p.market_id == market_id)
            .map(|p| p.value().clone())
            .collect())
    }

    fn update_position(&self, position: &Position, expected_version: u64) -> Result<u64> {
        let mut entry = self
            .positions
            .get_mut(&position.position_id)
            .ok_or(Error::PositionNotFound(position.position_id))?;

        if entry.version != expected_version {
            return Err(Error::StorageConflict(format!(
                "position {} at version {}, expected {}",
                position.position_id, entry.version, expected_version
            )));
        }

        let mut updated = position.clone();
        updated.version = expected_version + 1;
        *entry = updated;
        Ok(expected_version + 1)
    }

    fn remove_position(&self, id: Uuid, expected_version: u64) -> Result<()> {
        if let Some((_, removed)) = self
            .positions
            .remove_if(&id, |_, p| p.version == expected_version)
        {
            self.position_index
                .remove(&(removed.market_id, removed.user_id.clone()));
            return Ok(());
        }

        if self.positions.contains_key(&id) {
            Err(Error::StorageConflict(format!(
                "position {} changed since it was read",
                id
            )))
        } else {
            Err(Error::PositionNotFound(id))
        }
    }

    fn append_trend(&self, point: &TrendPoint) -> Result<()> {
        self.trend
            .entry(point.stream_id.clone())
            .or_default()
            .push(point.clone());
        Ok(())
    }

    fn trend_for_stream(
        &self,
        stream_id: &StreamId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TrendPoint>> {
        let mut points: Vec<TrendPoint> = match self.trend.get(stream_id) {
            Some(points) => points
                .iter()
                .filter(|p| since.map_or(true, |s| p.recorded_at >= s))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        if limit > 0 && points.len() > limit {
            points.drain(..points.len() - limit);
        }
        Ok(points)
    }

    fn clear_trend(&self, stream_id: &StreamId) -> Result<()> {
        self.trend.remove(stream_id);
        Ok(())
    }
}
