//! Durable store backend on RocksDB
//!
//! # Column Families
//!
//! - `users` - user records (key: user id)
//! - `markets` - market records (key: market uuid)
//! - `positions` - position records (key: position uuid)
//! - `position_index` - uniqueness index (key: market uuid || '|' || user id,
//!   value: position uuid)
//! - `trend` - append-only volume snapshots (key: stream id || '|' ||
//!   big-endian timestamp || market uuid, so prefix scans come back in
//!   time order)
//!
//! Conditional updates and unique inserts are read-check-write sequences
//! serialized by a single write lock; plain reads never take it.

use crate::{
    config::StoreConfig,
    error::{Error, Result},
    store::LedgerStore,
    types::{Market, MarketStatus, Position, StreamId, TrendPoint, User, UserId, UserStats},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_USERS: &str = "users";
const CF_MARKETS: &str = "markets";
const CF_POSITIONS: &str = "positions";
const CF_POSITION_INDEX: &str = "position_index";
const CF_TREND: &str = "trend";

/// Key separator; ids never contain it
const SEP: u8 = b'|';

/// On-disk user record
///
/// The legacy variant carries the historical dual balance columns
/// (`mock_balance` preferred over `usdc_balance`); it is collapsed to the
/// canonical single-balance record once, when the store is opened.
#[derive(Debug, Serialize, Deserialize)]
enum StoredUser {
    /// Pre-redesign dual-column record
    Legacy {
        user_id: UserId,
        mock_balance: Option<Decimal>,
        usdc_balance: Option<Decimal>,
        stats: UserStats,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: u64,
    },
    /// Canonical single-balance record
    Current(User),
}

impl StoredUser {
    /// Collapse to the canonical record; true if a migration happened
    fn into_user(self) -> (User, bool) {
        match self {
            StoredUser::Current(user) => (user, false),
            StoredUser::Legacy {
                user_id,
                mock_balance,
                usdc_balance,
                stats,
                created_at,
                updated_at,
                version,
            } => {
                let balance = mock_balance.or(usdc_balance).unwrap_or(Decimal::ZERO);
                (
                    User {
                        user_id,
                        balance,
                        stats,
                        created_at,
                        updated_at,
                        version,
                    },
                    true,
                )
            }
        }
    }
}

/// RocksDB-backed store
pub struct RocksStore {
    db: Arc<DB>,

    /// Serializes read-check-write sequences so conditional update and
    /// unique insert are atomic
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create the database, migrating legacy records
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_USERS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_MARKETS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_POSITIONS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_POSITION_INDEX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_TREND, Self::cf_options_trend()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = %path.display(), "Opened RocksDB ledger store");

        let store = Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        };
        store.migrate_legacy_users()?;

        Ok(store)
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        // Records are read on every request, favor decode speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_trend() -> Options {
        let mut opts = Options::default();
        // Append-heavy history, favor compression ratio
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("column family {} not found", name)))
    }

    // Key helpers

    fn index_key(market_id: Uuid, user_id: &UserId) -> Vec<u8> {
        let mut key = market_id.as_bytes().to_vec();
        key.push(SEP);
        key.extend_from_slice(user_id.as_str().as_bytes());
        key
    }

    fn market_index_prefix(market_id: Uuid) -> Vec<u8> {
        let mut key = market_id.as_bytes().to_vec();
        key.push(SEP);
        key
    }

    fn trend_key(point: &TrendPoint) -> Vec<u8> {
        let mut key = point.stream_id.as_str().as_bytes().to_vec();
        key.push(SEP);
        key.extend_from_slice(&Self::ts_nanos(point.recorded_at).to_be_bytes());
        key.extend_from_slice(point.market_id.as_bytes());
        key
    }

    fn trend_prefix(stream_id: &StreamId) -> Vec<u8> {
        let mut key = stream_id.as_str().as_bytes().to_vec();
        key.push(SEP);
        key
    }

    fn ts_nanos(at: DateTime<Utc>) -> i64 {
        at.timestamp_nanos_opt().unwrap_or(0)
    }

    /// Collapse legacy dual-balance user records, once, at open
    fn migrate_legacy_users(&self) -> Result<()> {
        let cf = self.cf_handle(CF_USERS)?;
        let mut migrated = 0usize;

        let mut rewrites: Vec<(Box<[u8]>, User)> = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let stored: StoredUser = bincode::deserialize(&value)?;
            let (user, was_legacy) = stored.into_user();
            if was_legacy {
                rewrites.push((key, user));
            }
        }

        for (key, user) in rewrites {
            let value = bincode::serialize(&StoredUser::Current(user))?;
            self.db.put_cf(cf, key, value)?;
            migrated += 1;
        }

        if migrated > 0 {
            tracing::info!(migrated, "Collapsed legacy dual-balance user records");
        }
        Ok(())
    }

    // Typed get helpers

    fn read_user(&self, id: &UserId) -> Result<Option<User>> {
        let cf = self.cf_handle(CF_USERS)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(value) => {
                let stored: StoredUser = bincode::deserialize(&value)?;
                Ok(Some(stored.into_user().0))
            }
            None => Ok(None),
        }
    }

    fn read_market(&self, id: Uuid) -> Result<Option<Market>> {
        let cf = self.cf_handle(CF_MARKETS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn read_position(&self, id: Uuid) -> Result<Option<Position>> {
        let cf = self.cf_handle(CF_POSITIONS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }
}

impl LedgerStore for RocksStore {
    fn insert_user(&self, user: &User) -> Result<()> {
        let _guard = self.write_lock.lock();

        if self.read_user(&user.user_id)?.is_some() {
            return Err(Error::StorageConflict(format!(
                "user {} already exists",
                user.user_id
            )));
        }

        let cf = self.cf_handle(CF_USERS)?;
        let value = bincode::serialize(&StoredUser::Current(user.clone()))?;
        self.db.put_cf(cf, user.user_id.as_str().as_bytes(), value)?;
        tracing::debug!(user_id = %user.user_id, "User record created");
        Ok(())
    }

    fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        self.read_user(id)
    }

    fn update_user(&self, user: &User, expected_version: u64) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let current = self
            .read_user(&user.user_id)?
            .ok_or_else(|| Error::UserNotFound(user.user_id.to_string()))?;
        if current.version != expected_version {
            return Err(Error::StorageConflict(format!(
                "user {} at version {}, expected {}",
                user.user_id, current.version, expected_version
            )));
        }

        let mut updated = user.clone();
        updated.version = expected_version + 1;
        let cf = self.cf_handle(CF_USERS)?;
        let value = bincode::serialize(&StoredUser::Current(updated))?;
        self.db.put_cf(cf, user.user_id.as_str().as_bytes(), value)?;
        Ok(expected_version + 1)
    }

    fn insert_market(&self, market: &Market) -> Result<()> {
        let _guard = self.write_lock.lock();

        if self.read_market(market.market_id)?.is_some() {
            return Err(Error::StorageConflict(format!(
                "market {} already exists",
                market.market_id
            )));
        }

        let cf = self.cf_handle(CF_MARKETS)?;
        let value = bincode::serialize(market)?;
        self.db.put_cf(cf, market.market_id.as_bytes(), value)?;
        tracing::debug!(market_id = %market.market_id, "Market record created");
        Ok(())
    }

    fn get_market(&self, id: Uuid) -> Result<Option<Market>> {
        self.read_market(id)
    }

    fn update_market(&self, market: &Market, expected_version: u64) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let current = self
            .read_market(market.market_id)?
            .ok_or(Error::MarketNotFound(market.market_id))?;
        if current.version != expected_version {
            return Err(Error::StorageConflict(format!(
                "market {} at version {}, expected {}",
                market.market_id, current.version, expected_version
            )));
        }

        let mut updated = market.clone();
        updated.version = expected_version + 1;
        let cf = self.cf_handle(CF_MARKETS)?;
        let value = bincode::serialize(&updated)?;
        self.db.put_cf(cf, market.market_id.as_bytes(), value)?;
        Ok(expected_version + 1)
    }

    fn active_markets(&self) -> Result<Vec<Market>> {
        let cf = self.cf_handle(CF_MARKETS)?;
        let mut markets = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let market: Market = bincode::deserialize(&value)?;
            if market.status == MarketStatus::Active {
                markets.push(market);
            }
        }
        Ok(markets)
    }

    fn insert_position(&self, position: &Position) -> Result<()> {
        let _guard = self.write_lock.lock();

        let cf_index = self.cf_handle(CF_POSITION_INDEX)?;
        let index_key = Self::index_key(position.market_id, &position.user_id);
        if self.db.get_cf(cf_index, &index_key)?.is_some() {
            return Err(Error::DuplicatePosition {
                user_id: position.user_id.to_string(),
                market_id: position.market_id,
            });
        }

        // Position and its uniqueness index land atomically
        let cf_positions = self.cf_handle(CF_POSITIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf_positions,
            position.position_id.as_bytes(),
            bincode::serialize(position)?,
        );
        batch.put_cf(cf_index, &index_key, position.position_id.as_bytes());
        self.db.write(batch)?;

        tracing::debug!(
            position_id = %position.position_id,
            market_id = %position.market_id,
            user_id = %position.user_id,
            "Position record created"
        );
        Ok(())
    }

    fn get_position(&self, id: Uuid) -> Result<Option<Position>> {
        self.read_position(id)
    }

    fn position_for(&self, market_id: Uuid, user_id: &UserId) -> Result<Option<Position>> {
        let cf_index = self.cf_handle(CF_POSITION_INDEX)?;
        let index_key = Self::index_key(market_id, user_id);
        match self.db.get_cf(cf_index, &index_key)? {
            Some(value) => {
                let bytes: [u8; 16] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("malformed position index value".to_string()))?;
                self.read_position(Uuid::from_bytes(bytes))
            }
            None => Ok(None),
        }
    }

    fn positions_for_market(&self, market_id: Uuid) -> Result<Vec<Position>> {
        let cf_index = self.cf_handle(CF_POSITION_INDEX)?;
        let prefix = Self::market_index_prefix(market_id);

        let mut positions = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf_index, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let bytes: [u8; 16] = value
                .as_ref()
                .try_into()
                .map_err(|_| Error::Storage("malformed position index value".to_string()))?;
            if let Some(position) = self.read_position(Uuid::from_bytes(bytes))? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    fn update_position(&self, position: &Position, expected_version: u64) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let current = self
            .read_position(position.position_id)?
            .ok_or(Error::PositionNotFound(position.position_id))?;
        if current.version != expected_version {
            return Err(Error::StorageConflict(format!(
                "position {} at version {}, expected {}",
                position.position_id, current.version, expected_version
            )));
        }

        let mut updated = position.clone();
        updated.version = expected_version + 1;
        let cf = self.cf_handle(CF_POSITIONS)?;
        let value = bincode::serialize(&updated)?;
        self.db.put_cf(cf, position.position_id.as_bytes(), value)?;
        Ok(expected_version + 1)
    }

    fn remove_position(&self, id: Uuid, expected_version: u64) -> Result<()> {
        let _guard = self.write_lock.lock();

        let current = self
            .read_position(id)?
            .ok_or(Error::PositionNotFound(id))?;
        if current.version != expected_version {
            return Err(Error::StorageConflict(format!(
                "position {} changed since it was read",
                id
            )));
        }

        let cf_positions = self.cf_handle(CF_POSITIONS)?;
        let cf_index = self.cf_handle(CF_POSITION_INDEX)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_positions, id.as_bytes());
        batch.delete_cf(
            cf_index,
            Self::index_key(current.market_id, &current.user_id),
        );
        self.db.write(batch)?;
        Ok(())
    }

    fn append_trend(&self, point: &TrendPoint) -> Result<()> {
        let cf = self.cf_handle(CF_TREND)?;
        let value = bincode::serialize(point)?;
        self.db.put_cf(cf, Self::trend_key(point), value)?;
        Ok(())
    }

    fn trend_for_stream(
        &self,
        stream_id: &StreamId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TrendPoint>> {
        let cf = self.cf_handle(CF_TREND)?;
        let prefix = Self::trend_prefix(stream_id);

        // Seek straight to the time bound; keys are timestamp-ordered
        let mut start = prefix.clone();
        if let Some(since) = since {
            start.extend_from_slice(&Self::ts_nanos(since).to_be_bytes());
        }

        let mut points = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            points.push(bincode::deserialize(&value)?);
        }

        if limit > 0 && points.len() > limit {
            points.drain(..points.len() - limit);
        }
        Ok(points)
    }

    fn clear_trend(&self, stream_id: &StreamId) -> Result<()> {
        let cf = self.cf_handle(CF_TREND)?;
        let prefix = Self::trend_prefix(stream_id);

        let mut batch = WriteBatch::default();
        let mut wiped = 0usize;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf, key);
            wiped += 1;
        }
        self.db.write(batch)?;

        if wiped > 0 {
            tracing::debug!(stream_id = %stream_id, wiped, "Trend history wiped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use crate::types::BetSide;
    use tempfile::TempDir;

    fn test_config() -> (StoreConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::Rocks,
            data_dir: temp_dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        (config, temp_dir)
    }

    fn test_user(id: &str) -> User {
        User::new(UserId::new(id), Decimal::new(100000, 2), Utc::now())
    }

    fn test_market() -> Market {
        let now = Utc::now();
        Market::new(
            StreamId::new("stream-1"),
            UserId::new("admin"),
            "question?",
            now + chrono::Duration::minutes(5),
            now,
        )
    }

    fn test_position(market_id: Uuid, user: &str) -> Position {
        Position::new(
            market_id,
            UserId::new(user),
            BetSide::Yes,
            Decimal::new(10000, 2),
            Decimal::new(200, 2),
            Decimal::new(50, 2),
            Decimal::new(20000, 2),
            Utc::now(),
        )
    }

    #[test]
    fn test_user_roundtrip_and_conflict() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();

        let user = test_user("alice");
        store.insert_user(&user).unwrap();
        assert!(store.insert_user(&user).is_err());

        let got = store.get_user(&user.user_id).unwrap().unwrap();
        assert_eq!(got.balance, user.balance);

        let mut updated = got.clone();
        updated.balance = Decimal::new(5000, 2);
        assert_eq!(store.update_user(&updated, 0).unwrap(), 1);

        // Stale version rejected
        let err = store.update_user(&updated, 0).unwrap_err();
        assert!(matches!(err, Error::StorageConflict(_)));
    }

    #[test]
    fn test_position_uniqueness_and_index_scan() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();

        let market = test_market();
        store.insert_market(&market).unwrap();

        let p1 = test_position(market.market_id, "alice");
        store.insert_position(&p1).unwrap();

        let err = store
            .insert_position(&test_position(market.market_id, "alice"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePosition { .. }));

        store
            .insert_position(&test_position(market.market_id, "bob"))
            .unwrap();

        // A position on a different market must not leak into the scan
        let other = test_market();
        store.insert_market(&other).unwrap();
        store
            .insert_position(&test_position(other.market_id, "carol"))
            .unwrap();

        let positions = store.positions_for_market(market.market_id).unwrap();
        assert_eq!(positions.len(), 2);

        let found = store
            .position_for(market.market_id, &UserId::new("alice"))
            .unwrap()
            .unwrap();
        assert_eq!(found.position_id, p1.position_id);
    }

    #[test]
    fn test_remove_position_version_guard() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();

        let market = test_market();
        let p = test_position(market.market_id, "alice");
        store.insert_position(&p).unwrap();

        let mut annotated = p.clone();
        annotated.is_winner = Some(true);
        store.update_position(&annotated, 0).unwrap();

        let err = store.remove_position(p.position_id, 0).unwrap_err();
        assert!(matches!(err, Error::StorageConflict(_)));

        store.remove_position(p.position_id, 1).unwrap();
        assert!(store
            .position_for(market.market_id, &p.user_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_trend_ordering_and_clear() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();

        let stream = StreamId::new("stream-1");
        let market_id = Uuid::now_v7();
        let base = Utc::now();

        // Append out of order; reads must come back time-ordered
        for i in [3i64, 0, 4, 1, 2] {
            store
                .append_trend(&TrendPoint {
                    stream_id: stream.clone(),
                    market_id,
                    yes_volume: Decimal::from(i),
                    no_volume: Decimal::ZERO,
                    recorded_at: base + chrono::Duration::seconds(i),
                })
                .unwrap();
        }

        let points = store.trend_for_stream(&stream, None, 0).unwrap();
        assert_eq!(points.len(), 5);
        for (i, point) in points.iter().enumerate() {
            assert_eq!(point.yes_volume, Decimal::from(i as i64));
        }

        let bounded = store
            .trend_for_stream(&stream, Some(base + chrono::Duration::seconds(3)), 0)
            .unwrap();
        assert_eq!(bounded.len(), 2);

        let tail = store.trend_for_stream(&stream, None, 3).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].yes_volume, Decimal::from(2));

        store.clear_trend(&stream).unwrap();
        assert!(store.trend_for_stream(&stream, None, 0).unwrap().is_empty());
    }

    #[test]
    fn test_legacy_user_migration_on_open() {
        let (config, _temp) = test_config();

        {
            let store = RocksStore::open(&config).unwrap();
            let legacy = StoredUser::Legacy {
                user_id: UserId::new("old-user"),
                mock_balance: Some(Decimal::new(42000, 2)),
                usdc_balance: Some(Decimal::new(100, 2)),
                stats: UserStats::default(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                version: 3,
            };
            let cf = store.cf_handle(CF_USERS).unwrap();
            store
                .db
                .put_cf(cf, b"old-user", bincode::serialize(&legacy).unwrap())
                .unwrap();
        }

        // Reopen runs the one-time migration; mock_balance wins
        let store = RocksStore::open(&config).unwrap();
        let user = store.get_user(&UserId::new("old-user")).unwrap().unwrap();
        assert_eq!(user.balance, Decimal::new(42000, 2));
        assert_eq!(user.version, 3);

        // The stored record is now the canonical shape
        let cf = store.cf_handle(CF_USERS).unwrap();
        let raw = store.db.get_cf(cf, b"old-user").unwrap().unwrap();
        let stored: StoredUser = bincode::deserialize(&raw).unwrap();
        assert!(matches!(stored, StoredUser::Current(_)));
    }
}
