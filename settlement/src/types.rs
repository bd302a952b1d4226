//! Request and result types for the settlement engine

use chrono::{DateTime, Utc};
use market_ledger::{BetSide, Position, StreamId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to open a new market on a stream
#[derive(Debug, Clone)]
pub struct CreateMarket {
    /// Stream the market is attached to
    pub stream_id: StreamId,

    /// Admin who owns (and may later settle) the market
    pub admin_id: UserId,

    /// Question text
    pub question: String,

    /// End of the betting window
    pub ends_at: DateTime<Utc>,
}

/// Request to stake on one side of a market
#[derive(Debug, Clone)]
pub struct BetRequest {
    /// Betting user
    pub user_id: UserId,

    /// Target market
    pub market_id: Uuid,

    /// Side staked
    pub side: BetSide,

    /// Stake amount (the fee is charged on top)
    pub amount: Decimal,
}

/// Successful bet placement
#[derive(Debug, Clone)]
pub struct BetReceipt {
    /// The created position
    pub position: Position,

    /// Price paid per share, quoted from pre-bet volumes
    pub price: Decimal,

    /// Shares purchased
    pub shares: Decimal,

    /// Fee charged on top of the stake
    pub fee: Decimal,

    /// Total debited (`amount + fee`)
    pub total_debited: Decimal,

    /// User balance after the debit
    pub new_balance: Decimal,
}

/// One position the settlement pass could not fully apply
///
/// The pass continues past failures; they are reported here so the caller
/// can retry or alert, never silently swallowed.
#[derive(Debug, Clone)]
pub struct SettlementFailure {
    /// Position that failed
    pub position_id: Uuid,

    /// Owning user
    pub user_id: UserId,

    /// What went wrong
    pub error: String,
}

/// Outcome of a market resolution
#[derive(Debug, Clone)]
pub struct SettlementReport {
    /// Settled market
    pub market_id: Uuid,

    /// Resolution outcome
    pub outcome: bool,

    /// Losers' stakes redistributed to winners
    pub pool: Decimal,

    /// Sum of winning-side shares
    pub total_winning_shares: Decimal,

    /// Winning positions
    pub winners: usize,

    /// Losing positions
    pub losers: usize,

    /// Total credited to winners
    pub total_paid: Decimal,

    /// Winners existed but held zero shares; no payout was made
    pub degenerate: bool,

    /// Positions the pass could not fully apply
    pub failures: Vec<SettlementFailure>,
}

/// One refund owed or applied on cancellation
#[derive(Debug, Clone, PartialEq)]
pub struct Refund {
    /// Refunded position
    pub position_id: Uuid,

    /// Refunded user
    pub user_id: UserId,

    /// Amount returned (`stake + fee`)
    pub amount: Decimal,
}

/// Outcome of a market cancellation
#[derive(Debug, Clone)]
pub struct RefundReport {
    /// Cancelled market
    pub market_id: Uuid,

    /// Refunds applied
    pub refunds: Vec<Refund>,

    /// Total returned across all users
    pub total_refunded: Decimal,

    /// Refunds that failed; already-applied refunds stand regardless
    pub failures: Vec<SettlementFailure>,
}

/// One normalized chart point served to the trend consumer
///
/// Percentages derive from `yes / (yes + no)`; `no_percent` is
/// `100 - yes_percent` so the pair always sums to 100. A zero-volume
/// snapshot reads 50/50.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendEntry {
    /// Snapshot timestamp
    pub timestamp: DateTime<Utc>,

    /// Implied YES percentage (whole number)
    pub yes_percent: u8,

    /// Implied NO percentage (whole number)
    pub no_percent: u8,
}
