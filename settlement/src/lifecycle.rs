//! Market lifecycle state machine
//!
//! Legal transitions:
//!
//! ```text
//! active ──▶ ended ──▶ resolved   (terminal)
//!   │          │  └──▶ active     (renewal)
//!   │          └─────▶ cancelled  (terminal)
//!   ├────────────────▶ resolved
//!   └────────────────▶ cancelled
//! ```
//!
//! Nothing else. Expiry (`active → ended`) is idempotent: re-applying to
//! an already-ended market is a no-op.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use market_ledger::{Market, MarketStatus};

/// Whether a direct transition between two statuses is legal
pub fn transition_allowed(from: MarketStatus, to: MarketStatus) -> bool {
    use MarketStatus::*;
    matches!(
        (from, to),
        (Active, Ended)
            | (Ended, Active)
            | (Active, Resolved)
            | (Ended, Resolved)
            | (Active, Cancelled)
            | (Ended, Cancelled)
    )
}

/// Whether a market in this status may still be resolved or cancelled
pub fn can_settle(status: MarketStatus) -> bool {
    matches!(status, MarketStatus::Active | MarketStatus::Ended)
}

/// Flip an overdue active market to ended; true if it transitioned
///
/// Idempotent by construction: anything not active is left alone.
pub fn expire_if_due(market: &mut Market, now: DateTime<Utc>) -> bool {
    if market.status == MarketStatus::Active && now >= market.ends_at {
        market.status = MarketStatus::Ended;
        market.updated_at = now;
        return true;
    }
    false
}

/// Guard a resolve/cancel request against the current status
pub fn ensure_settleable(market: &Market) -> Result<()> {
    if !can_settle(market.status) {
        return Err(Error::InvalidState {
            market_id: market.market_id,
            status: market.status,
        });
    }
    Ok(())
}

/// Guard a renewal request: only an ended market gets a fresh window
pub fn ensure_renewable(market: &Market) -> Result<()> {
    if market.status != MarketStatus::Ended {
        return Err(Error::InvalidState {
            market_id: market.market_id,
            status: market.status,
        });
    }
    Ok(())
}
