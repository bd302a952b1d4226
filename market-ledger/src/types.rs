//! Core record types for the market ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money, never floats)
//! - Version-guarded conditional updates (every mutable record carries
//!   a `version` the store checks before overwriting)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// User identifier (internal id minted by the identity collaborator)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream identifier (the live event a market is attached to)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create new stream ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Side of a binary market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BetSide {
    /// Staked on the question resolving true
    Yes,
    /// Staked on the question resolving false
    No,
}

impl BetSide {
    /// Whether this side wins under the given resolution outcome
    pub fn wins(self, outcome: bool) -> bool {
        matches!((self, outcome), (BetSide::Yes, true) | (BetSide::No, false))
    }
}

impl fmt::Display for BetSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetSide::Yes => write!(f, "YES"),
            BetSide::No => write!(f, "NO"),
        }
    }
}

/// Market lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MarketStatus {
    /// Open for betting
    Active = 1,
    /// Betting window closed, awaiting resolution or renewal
    Ended = 2,
    /// Outcome determined, payouts applied (terminal)
    Resolved = 3,
    /// Voided, stakes and fees refunded (terminal)
    Cancelled = 4,
}

impl MarketStatus {
    /// Check if status is terminal (no further transitions)
    pub fn is_terminal(&self) -> bool {
        matches!(self, MarketStatus::Resolved | MarketStatus::Cancelled)
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketStatus::Active => "active",
            MarketStatus::Ended => "ended",
            MarketStatus::Resolved => "resolved",
            MarketStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate betting statistics for a user
///
/// Mutated only by the settlement engine on resolution. Cancellations do
/// not touch stats because no outcome was ever determined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    /// Total amount staked across settled markets
    pub total_staked: Decimal,

    /// Total amount paid out across settled markets
    pub total_earned: Decimal,

    /// Settled positions won
    pub wins: u32,

    /// Settled positions lost
    pub losses: u32,

    /// Current consecutive-win streak (reset on loss)
    pub streak: u32,
}

impl UserStats {
    /// Fraction of settled positions won (0.0 when nothing settled)
    pub fn win_rate(&self) -> f64 {
        let settled = self.wins + self.losses;
        if settled == 0 {
            return 0.0;
        }
        self.wins as f64 / settled as f64
    }

    /// Record a winning settlement
    pub fn record_win(&mut self, staked: Decimal, payout: Decimal) {
        self.total_staked += staked;
        self.total_earned += payout;
        self.wins += 1;
        self.streak += 1;
    }

    /// Record a losing settlement
    pub fn record_loss(&mut self, staked: Decimal) {
        self.total_staked += staked;
        self.losses += 1;
        self.streak = 0;
    }
}

/// User record with the single canonical balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub user_id: UserId,

    /// Spendable balance (exact decimal, never negative)
    pub balance: Decimal,

    /// Aggregate settlement statistics
    pub stats: UserStats,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Record version for conditional updates
    pub version: u64,
}

impl User {
    /// Create a fresh user with a starting balance
    pub fn new(user_id: UserId, starting_balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: starting_balance,
            stats: UserStats::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// Binary market attached to a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Market ID (UUIDv7 for time-ordering)
    pub market_id: Uuid,

    /// Owning stream
    pub stream_id: StreamId,

    /// Owning admin (only this admin or a super-admin may settle)
    pub admin_id: UserId,

    /// Question text shown to bettors
    pub question: String,

    /// Lifecycle status
    pub status: MarketStatus,

    /// Cumulative YES stake volume (monotonic while active)
    pub yes_volume: Decimal,

    /// Cumulative NO stake volume (monotonic while active)
    pub no_volume: Decimal,

    /// Cumulative total stake volume; always `yes_volume + no_volume`
    pub total_volume: Decimal,

    /// Number of bets placed
    pub total_bets: u64,

    /// End of the betting window
    pub ends_at: DateTime<Utc>,

    /// Resolution outcome (present only when resolved)
    pub outcome: Option<bool>,

    /// Free-form resolution notes
    pub resolution_notes: Option<String>,

    /// When the market was resolved
    pub resolved_at: Option<DateTime<Utc>>,

    /// Why the market was cancelled
    pub cancel_reason: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Record version for conditional updates
    pub version: u64,
}

impl Market {
    /// Create a fresh active market with zero volumes
    pub fn new(
        stream_id: StreamId,
        admin_id: UserId,
        question: impl Into<String>,
        ends_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            market_id: Uuid::now_v7(),
            stream_id,
            admin_id,
            question: question.into(),
            status: MarketStatus::Active,
            yes_volume: Decimal::ZERO,
            no_volume: Decimal::ZERO,
            total_volume: Decimal::ZERO,
            total_bets: 0,
            ends_at,
            outcome: None,
            resolution_notes: None,
            resolved_at: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Whether the betting window is open at `now`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == MarketStatus::Active && now < self.ends_at
    }

    /// Fold one bet into the cumulative counters
    pub fn record_bet(&mut self, side: BetSide, amount: Decimal, now: DateTime<Utc>) {
        match side {
            BetSide::Yes => self.yes_volume += amount,
            BetSide::No => self.no_volume += amount,
        }
        self.total_volume += amount;
        self.total_bets += 1;
        self.updated_at = now;
    }

    /// Check the `total == yes + no` volume invariant
    pub fn volumes_consistent(&self) -> bool {
        self.total_volume == self.yes_volume + self.no_volume
    }
}

/// One user's single stake on one side of one market
///
/// At most one position exists per (user, market) pair; the store enforces
/// this, the engine only translates the violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Position ID (UUIDv7)
    pub position_id: Uuid,

    /// Market this position belongs to
    pub market_id: Uuid,

    /// Owning user
    pub user_id: UserId,

    /// Side staked
    pub side: BetSide,

    /// Amount staked (excludes fee)
    pub amount: Decimal,

    /// Transaction fee charged at bet time
    pub fee: Decimal,

    /// Price paid per share, quoted from pre-bet volumes
    pub price: Decimal,

    /// Shares purchased (`amount / price`)
    pub shares: Decimal,

    /// Winner flag; `None` until settlement, never set on refund
    pub is_winner: Option<bool>,

    /// Payout credited at settlement or refund (zero until then)
    pub payout: Decimal,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// When the position was settled or refunded
    pub settled_at: Option<DateTime<Utc>>,

    /// Record version for conditional updates
    pub version: u64,
}

impl Position {
    /// Create a fresh unsettled position
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market_id: Uuid,
        user_id: UserId,
        side: BetSide,
        amount: Decimal,
        fee: Decimal,
        price: Decimal,
        shares: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            position_id: Uuid::now_v7(),
            market_id,
            user_id,
            side,
            amount,
            fee,
            price,
            shares,
            is_winner: None,
            payout: Decimal::ZERO,
            created_at: now,
            settled_at: None,
            version: 0,
        }
    }

    /// Whether settlement or refund has already touched this position
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }
}

/// Timestamped snapshot of cumulative side volumes, for charting
///
/// Append-only; never mutated. The full history for a stream is wiped only
/// when a brand-new market starts on that stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// Stream the snapshot belongs to
    pub stream_id: StreamId,

    /// Market the snapshot was taken from
    pub market_id: Uuid,

    /// Cumulative YES volume at snapshot time
    pub yes_volume: Decimal,

    /// Cumulative NO volume at snapshot time
    pub no_volume: Decimal,

    /// Snapshot timestamp
    pub recorded_at: DateTime<Utc>,
}
