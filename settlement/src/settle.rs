//! Settlement computation
//!
//! Pure computation from a position snapshot to a payout (or refund)
//! plan; the engine applies plans against balances and records. Keeping
//! the arithmetic side-effect-free makes the money math testable in
//! isolation.
//!
//! # Payout rule
//!
//! Losers forfeit their stake but never their fee; fees were taken by
//! the house at bet time and are not redistributed. Winners share the
//! losers' pool pro-rata by shares:
//!
//! ```text
//! payout = stake + (shares / total_winning_shares) * pool
//! ```
//!
//! The pool share is rounded toward zero at two decimal places, so the
//! sum of payouts can never exceed winners' stakes plus the pool.

use crate::types::Refund;
use market_ledger::{Position, UserId};
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

/// One position's computed settlement
#[derive(Debug, Clone)]
pub struct PayoutEntry {
    /// Position being settled
    pub position_id: Uuid,

    /// Owning user
    pub user_id: UserId,

    /// Stake the position was opened with
    pub staked: Decimal,

    /// Shares held
    pub shares: Decimal,

    /// Whether the position's side matched the outcome
    pub is_winner: bool,

    /// Amount to credit (zero for losers)
    pub payout: Decimal,
}

/// Full settlement plan for one market resolution
#[derive(Debug, Clone)]
pub struct PayoutPlan {
    /// Market being settled
    pub market_id: Uuid,

    /// Resolution outcome
    pub outcome: bool,

    /// Losers' stakes available for redistribution
    pub pool: Decimal,

    /// Sum of winning-side shares
    pub total_winning_shares: Decimal,

    /// Per-position settlements (every position appears exactly once)
    pub entries: Vec<PayoutEntry>,

    /// Winners exist but hold zero shares; nothing is paid out.
    /// Cannot happen while the pricing floor holds, checked anyway.
    pub degenerate: bool,

    /// Sum of all payouts
    pub total_payout: Decimal,
}

/// Compute the payout plan for a resolution
pub fn compute_resolution(market_id: Uuid, outcome: bool, positions: &[Position]) -> PayoutPlan {
    let pool: Decimal = positions
        .iter()
        .filter(|p| !p.side.wins(outcome))
        .map(|p| p.amount)
        .sum();

    let total_winning_shares: Decimal = positions
        .iter()
        .filter(|p| p.side.wins(outcome))
        .map(|p| p.shares)
        .sum();

    let has_winners = positions.iter().any(|p| p.side.wins(outcome));
    let degenerate = has_winners && total_winning_shares <= Decimal::ZERO;

    let mut total_payout = Decimal::ZERO;
    let entries = positions
        .iter()
        .map(|position| {
            let is_winner = position.side.wins(outcome);
            let payout = if is_winner && total_winning_shares > Decimal::ZERO {
                let pool_share = (position.shares / total_winning_shares * pool)
                    .round_dp_with_strategy(2, RoundingStrategy::ToZero);
                position.amount + pool_share
            } else {
                Decimal::ZERO
            };
            total_payout += payout;

            PayoutEntry {
                position_id: position.position_id,
                user_id: position.user_id.clone(),
                staked: position.amount,
                shares: position.shares,
                is_winner,
                payout,
            }
        })
        .collect();

    PayoutPlan {
        market_id,
        outcome,
        pool,
        total_winning_shares,
        entries,
        degenerate,
        total_payout,
    }
}

/// Compute refunds for a cancellation: every position gets stake plus fee
/// back, because no outcome was ever determined
pub fn compute_refunds(positions: &[Position]) -> Vec<Refund> {
    positions
        .iter()
        .map(|position| Refund {
            position_id: position.position_id,
            user_id: position.user_id.clone(),
            amount: position.amount + position.fee,
        })
        .collect()
}
