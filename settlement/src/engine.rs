//! Market settlement engine
//!
//! Orchestrates the bet and settlement flows over the ledger store:
//!
//! - bet: lifecycle guards → pari-mutuel quote → debit → position insert
//!   (store-enforced uniqueness) → volume claim → trend snapshot
//! - resolve/cancel: authorize → atomic status transition → position
//!   snapshot → payouts/refunds → trend snapshot
//!
//! The engine holds no mutable state of its own; every operation re-reads
//! current records because concurrent requests may have moved them. The
//! one discipline that matters for settlement exclusivity: the status
//! transition is applied and visible *before* the position snapshot is
//! read, so a bet losing the open-market race fails cleanly instead of
//! slipping in behind a settlement.

use crate::{
    config::EngineConfig,
    identity::Identity,
    lifecycle,
    metrics::Metrics,
    pricing,
    settle::{self, PayoutEntry},
    trend::TrendRecorder,
    types::{
        BetReceipt, BetRequest, CreateMarket, Refund, RefundReport, SettlementFailure,
        SettlementReport, TrendEntry,
    },
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use market_ledger::{
    Balances, BetSide, LedgerStore, Market, MarketStatus, Position, StreamId, User, UserId,
};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use std::sync::Arc;
use uuid::Uuid;

/// The market settlement and ledger engine
pub struct MarketEngine {
    store: Arc<dyn LedgerStore>,
    identity: Arc<dyn Identity>,
    balances: Balances,
    trend: TrendRecorder,
    metrics: Metrics,
    config: EngineConfig,
}

impl MarketEngine {
    /// Build an engine over an explicitly constructed store handle
    ///
    /// The store's lifecycle belongs to the process entry point; the
    /// engine never owns a process-wide singleton.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        identity: Arc<dyn Identity>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let balances = Balances::with_retries(store.clone(), config.conflict_retries);
        let trend = TrendRecorder::new(store.clone());
        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("metrics registration: {}", e)))?;

        Ok(Self {
            store,
            identity,
            balances,
            trend,
            metrics,
            config,
        })
    }

    /// Engine metrics, for mounting on the embedder's exporter
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // User provisioning and funding

    /// Map an external identity to a user record, creating it on first
    /// contact with the configured starting balance
    pub fn resolve_user(&self, external_id: &str) -> Result<User> {
        let user_id = self
            .identity
            .resolve_user(external_id)
            .ok_or_else(|| market_ledger::Error::UserNotFound(external_id.to_string()))?;
        self.ensure_user(&user_id)
    }

    /// Fetch a user record, creating it on first contact
    pub fn ensure_user(&self, user_id: &UserId) -> Result<User> {
        if let Some(user) = self.store.get_user(user_id)? {
            return Ok(user);
        }

        let user = User::new(user_id.clone(), self.config.starting_balance, Utc::now());
        match self.store.insert_user(&user) {
            Ok(()) => {
                tracing::info!(user_id = %user_id, balance = %user.balance, "User created");
                Ok(user)
            }
            // Lost the creation race; the record exists now
            Err(market_ledger::Error::StorageConflict(_)) => Ok(self
                .store
                .get_user(user_id)?
                .ok_or_else(|| market_ledger::Error::UserNotFound(user_id.to_string()))?),
            Err(e) => Err(e.into()),
        }
    }

    /// External funding operation: credit a user outside any market flow
    pub fn fund(&self, user_id: &UserId, amount: Decimal) -> Result<User> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "funding amount must be positive: {}",
                amount
            )));
        }
        Ok(self.balances.credit(user_id, amount)?)
    }

    // Market lifecycle

    /// Open a new market on a stream, resetting the stream's chart
    pub fn create_market(&self, req: CreateMarket) -> Result<Market> {
        self.create_market_at(req, Utc::now())
    }

    /// Clock-injected variant of [`MarketEngine::create_market`]
    pub fn create_market_at(&self, req: CreateMarket, now: DateTime<Utc>) -> Result<Market> {
        if req.ends_at <= now {
            return Err(Error::InvalidAmount(format!(
                "betting window must end in the future: {}",
                req.ends_at
            )));
        }
        if req.question.trim().is_empty() {
            return Err(Error::InvalidAmount("question must not be empty".to_string()));
        }

        let market = Market::new(req.stream_id, req.admin_id, req.question, req.ends_at, now);
        self.store.insert_market(&market)?;

        // A brand-new market resets the chart baseline for its stream
        if let Err(e) = self.trend.reset(&market.stream_id) {
            tracing::warn!(stream_id = %market.stream_id, error = %e, "Trend reset failed");
        }
        self.trend.snapshot_at(&market, now);

        self.metrics.markets_created.inc();
        tracing::info!(
            market_id = %market.market_id,
            stream_id = %market.stream_id,
            ends_at = %market.ends_at,
            "Market created"
        );
        Ok(market)
    }

    /// Fetch a market, lazily expiring it if the window has closed
    pub fn get_market(&self, market_id: Uuid) -> Result<Market> {
        self.get_market_at(market_id, Utc::now())
    }

    /// Clock-injected variant of [`MarketEngine::get_market`]
    pub fn get_market_at(&self, market_id: Uuid, now: DateTime<Utc>) -> Result<Market> {
        let market = self.fetch_market(market_id)?;
        if market.status == MarketStatus::Active && now >= market.ends_at {
            if let Some(ended) = self.expire_market(&market, now) {
                return Ok(ended);
            }
            // Lost the expiry race; somebody else moved the market
            return self.fetch_market(market_id);
        }
        Ok(market)
    }

    /// The single position a user holds on a market, if any
    pub fn get_position(&self, market_id: Uuid, user_id: &UserId) -> Result<Option<Position>> {
        Ok(self.store.position_for(market_id, user_id)?)
    }

    /// Sweep all overdue active markets to ended; returns how many moved
    pub fn expire_due(&self) -> Result<usize> {
        self.expire_due_at(Utc::now())
    }

    /// Clock-injected variant of [`MarketEngine::expire_due`]
    pub fn expire_due_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for market in self.store.active_markets()? {
            if now >= market.ends_at && self.expire_market(&market, now).is_some() {
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Expiry sweep ended overdue markets");
        }
        Ok(expired)
    }

    /// Give an ended market a fresh betting window on the same id
    ///
    /// Volumes and positions are untouched; only the window (and
    /// optionally the question) changes.
    pub fn renew_market(
        &self,
        market_id: Uuid,
        additional_minutes: i64,
        question: Option<String>,
        requested_by: &UserId,
    ) -> Result<Market> {
        self.renew_market_at(market_id, additional_minutes, question, requested_by, Utc::now())
    }

    /// Clock-injected variant of [`MarketEngine::renew_market`]
    pub fn renew_market_at(
        &self,
        market_id: Uuid,
        additional_minutes: i64,
        question: Option<String>,
        requested_by: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Market> {
        if additional_minutes <= 0 {
            return Err(Error::InvalidAmount(format!(
                "renewal minutes must be positive: {}",
                additional_minutes
            )));
        }

        let mut attempts = 0u32;
        loop {
            let market = self.get_market_at(market_id, now)?;
            self.authorize(&market, requested_by)?;
            lifecycle::ensure_renewable(&market)?;

            let mut updated = market.clone();
            updated.status = MarketStatus::Active;
            updated.ends_at = now + Duration::minutes(additional_minutes);
            if let Some(ref question) = question {
                updated.question = question.clone();
            }
            updated.updated_at = now;

            match self.store.update_market(&updated, market.version) {
                Ok(version) => {
                    updated.version = version;
                    self.trend.snapshot_at(&updated, now);
                    tracing::info!(
                        market_id = %market_id,
                        ends_at = %updated.ends_at,
                        "Market renewed"
                    );
                    return Ok(updated);
                }
                Err(market_ledger::Error::StorageConflict(reason)) => {
                    self.metrics.storage_conflicts.inc();
                    attempts += 1;
                    if attempts > self.config.conflict_retries {
                        return Err(market_ledger::Error::StorageConflict(reason).into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Betting

    /// Stake on one side of an open market
    pub fn place_bet(&self, req: BetRequest) -> Result<BetReceipt> {
        self.place_bet_at(req, Utc::now())
    }

    /// Clock-injected variant of [`MarketEngine::place_bet`]
    pub fn place_bet_at(&self, req: BetRequest, now: DateTime<Utc>) -> Result<BetReceipt> {
        let result = self.try_place_bet(&req, now);
        match &result {
            Ok(receipt) => {
                self.metrics.bets_placed.inc();
                tracing::info!(
                    market_id = %req.market_id,
                    user_id = %req.user_id,
                    side = %req.side,
                    amount = %req.amount,
                    price = %receipt.price,
                    shares = %receipt.shares,
                    "Bet placed"
                );
            }
            Err(e) => {
                self.metrics.bets_rejected.inc();
                tracing::debug!(
                    market_id = %req.market_id,
                    user_id = %req.user_id,
                    error = %e,
                    "Bet rejected"
                );
            }
        }
        result
    }

    fn try_place_bet(&self, req: &BetRequest, now: DateTime<Utc>) -> Result<BetReceipt> {
        let market = self.fetch_market(req.market_id)?;

        // One position per (user, market). This read is the fast path;
        // a racing duplicate is caught again by the store at insert.
        if self
            .store
            .position_for(req.market_id, &req.user_id)?
            .is_some()
        {
            return Err(market_ledger::Error::DuplicatePosition {
                user_id: req.user_id.to_string(),
                market_id: req.market_id,
            }
            .into());
        }

        if market.status != MarketStatus::Active {
            return Err(Error::MarketNotActive(req.market_id));
        }

        // The rejected attempt itself flips an overdue market to ended
        if now >= market.ends_at {
            self.expire_market(&market, now);
            return Err(Error::MarketExpired(req.market_id));
        }

        if req.amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "stake must be positive: {}",
                req.amount
            )));
        }

        let fee = (req.amount * self.config.fee_rate).round_dp(2);
        let needed = req.amount + fee;

        // Debit once; everything past this point either completes or
        // reverses it before surfacing the error
        let debited = self.balances.debit(&req.user_id, req.amount, fee)?;

        // Quote from pre-bet volumes: a bet never moves its own price
        let quote = pricing::quote(
            market.yes_volume,
            market.no_volume,
            req.side,
            req.amount,
            self.config.min_price,
        );

        let position = Position::new(
            req.market_id,
            req.user_id.clone(),
            req.side,
            req.amount,
            fee,
            quote.price,
            quote.shares,
            now,
        );
        if let Err(e) = self.store.insert_position(&position) {
            self.balances.credit(&req.user_id, needed)?;
            return Err(e.into());
        }

        // Fold the stake into the market counters; this claim re-validates
        // the open-market precondition under compare-and-swap
        let market = match self.claim_volumes(&market, req.side, req.amount, now) {
            Ok(market) => market,
            Err(cause) => return self.rollback_bet(position, needed, cause),
        };

        self.trend.snapshot_at(&market, now);

        Ok(BetReceipt {
            price: quote.price,
            shares: quote.shares,
            fee,
            total_debited: needed,
            new_balance: debited.balance,
            position,
        })
    }

    /// Additively claim a bet's volumes on the market record
    fn claim_volumes(
        &self,
        market: &Market,
        side: BetSide,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Market> {
        let mut current = market.clone();
        let mut attempts = 0u32;
        loop {
            if current.status != MarketStatus::Active {
                return Err(Error::MarketNotActive(current.market_id));
            }
            if now >= current.ends_at {
                return Err(Error::MarketExpired(current.market_id));
            }

            let mut updated = current.clone();
            updated.record_bet(side, amount, now);
            match self.store.update_market(&updated, current.version) {
                Ok(version) => {
                    updated.version = version;
                    return Ok(updated);
                }
                Err(market_ledger::Error::StorageConflict(reason)) => {
                    self.metrics.storage_conflicts.inc();
                    attempts += 1;
                    if attempts > self.config.conflict_retries {
                        return Err(market_ledger::Error::StorageConflict(reason).into());
                    }
                    current = self.fetch_market(market.market_id)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reverse a half-placed bet: remove the position and refund the debit
    ///
    /// The delete is version-guarded. If it conflicts, settlement captured
    /// and annotated the position between our market read and now; its
    /// snapshot is authoritative, so the bet stands (without a volume
    /// update, since volumes only feed pricing and charts) instead of
    /// being refunded on top of a payout.
    fn rollback_bet(
        &self,
        position: Position,
        needed: Decimal,
        cause: Error,
    ) -> Result<BetReceipt> {
        match self
            .store
            .remove_position(position.position_id, position.version)
        {
            Ok(()) => {
                self.balances.credit(&position.user_id, needed)?;
                tracing::debug!(
                    position_id = %position.position_id,
                    user_id = %position.user_id,
                    "Bet rolled back, debit reversed"
                );
                Err(cause)
            }
            Err(market_ledger::Error::StorageConflict(_)) => {
                tracing::warn!(
                    position_id = %position.position_id,
                    market_id = %position.market_id,
                    "Bet raced settlement and was settled as placed"
                );
                let position = self
                    .store
                    .get_position(position.position_id)?
                    .unwrap_or(position);
                let new_balance = self
                    .store
                    .get_user(&position.user_id)?
                    .map(|u| u.balance)
                    .unwrap_or(Decimal::ZERO);
                Ok(BetReceipt {
                    price: position.price,
                    shares: position.shares,
                    fee: position.fee,
                    total_debited: needed,
                    new_balance,
                    position,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // Settlement

    /// Resolve a market to an outcome and pay winners from losers' stakes
    pub fn resolve_market(
        &self,
        market_id: Uuid,
        outcome: bool,
        notes: Option<String>,
        requested_by: &UserId,
    ) -> Result<SettlementReport> {
        self.resolve_market_at(market_id, outcome, notes, requested_by, Utc::now())
    }

    /// Clock-injected variant of [`MarketEngine::resolve_market`]
    pub fn resolve_market_at(
        &self,
        market_id: Uuid,
        outcome: bool,
        notes: Option<String>,
        requested_by: &UserId,
        now: DateTime<Utc>,
    ) -> Result<SettlementReport> {
        // Transition first: once `resolved` is visible, no bet can slip
        // into the snapshot read below
        let mut attempts = 0u32;
        let market = loop {
            let market = self.fetch_market(market_id)?;
            self.authorize(&market, requested_by)?;
            lifecycle::ensure_settleable(&market)?;

            let mut updated = market.clone();
            updated.status = MarketStatus::Resolved;
            updated.outcome = Some(outcome);
            updated.resolution_notes = notes.clone();
            updated.resolved_at = Some(now);
            updated.updated_at = now;

            match self.store.update_market(&updated, market.version) {
                Ok(version) => {
                    updated.version = version;
                    break updated;
                }
                Err(market_ledger::Error::StorageConflict(reason)) => {
                    // Re-read; a competing settlement will now fail the
                    // state guard instead of paying out twice
                    self.metrics.storage_conflicts.inc();
                    attempts += 1;
                    if attempts > self.config.conflict_retries {
                        return Err(market_ledger::Error::StorageConflict(reason).into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        let positions = self.store.positions_for_market(market_id)?;
        let plan = settle::compute_resolution(market_id, outcome, &positions);

        if plan.degenerate {
            tracing::warn!(
                market_id = %market_id,
                "Winners hold zero total shares, no payout distributed"
            );
        }

        let mut failures = Vec::new();
        let mut total_paid = Decimal::ZERO;
        for entry in &plan.entries {
            let position = positions
                .iter()
                .find(|p| p.position_id == entry.position_id)
                .expect("entry derived from this snapshot");
            match self.apply_payout(entry, position, now) {
                Ok(true) => total_paid += entry.payout,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        position_id = %entry.position_id,
                        user_id = %entry.user_id,
                        error = %e,
                        "Settlement entry failed"
                    );
                    failures.push(SettlementFailure {
                        position_id: entry.position_id,
                        user_id: entry.user_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.trend.snapshot_at(&market, now);
        self.metrics.markets_resolved.inc();
        self.metrics
            .payout_amount
            .inc_by(total_paid.to_f64().unwrap_or(0.0));

        let winners = plan.entries.iter().filter(|e| e.is_winner).count();
        let losers = plan.entries.len() - winners;
        tracing::info!(
            market_id = %market_id,
            outcome,
            winners,
            losers,
            pool = %plan.pool,
            total_paid = %total_paid,
            "Market resolved"
        );

        Ok(SettlementReport {
            market_id,
            outcome,
            pool: plan.pool,
            total_winning_shares: plan.total_winning_shares,
            winners,
            losers,
            total_paid,
            degenerate: plan.degenerate,
            failures,
        })
    }

    /// Annotate one position and settle its user; `Ok(false)` means the
    /// position was already settled and nothing was applied
    fn apply_payout(
        &self,
        entry: &PayoutEntry,
        position: &Position,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if position.is_settled() {
            tracing::warn!(
                position_id = %position.position_id,
                "Position already settled, skipping"
            );
            return Ok(false);
        }

        // Annotate before crediting: a failure in between under-pays and
        // is reported, rather than risking a double payout on retry
        let mut annotated = position.clone();
        annotated.is_winner = Some(entry.is_winner);
        annotated.payout = entry.payout;
        annotated.settled_at = Some(now);
        self.store.update_position(&annotated, position.version)?;

        let won = entry.is_winner;
        let staked = entry.staked;
        let payout = entry.payout;
        self.balances.apply(&entry.user_id, move |user| {
            if won {
                user.balance += payout;
                user.stats.record_win(staked, payout);
            } else {
                user.stats.record_loss(staked);
            }
            Ok(())
        })?;

        Ok(true)
    }

    /// Cancel a market and refund every position's stake plus fee
    pub fn cancel_market(
        &self,
        market_id: Uuid,
        reason: impl Into<String>,
        requested_by: &UserId,
    ) -> Result<RefundReport> {
        self.cancel_market_at(market_id, reason, requested_by, Utc::now())
    }

    /// Clock-injected variant of [`MarketEngine::cancel_market`]
    pub fn cancel_market_at(
        &self,
        market_id: Uuid,
        reason: impl Into<String>,
        requested_by: &UserId,
        now: DateTime<Utc>,
    ) -> Result<RefundReport> {
        let reason = reason.into();

        // Same exclusivity discipline as resolution: cancelled becomes
        // visible before the refund snapshot is read
        let mut attempts = 0u32;
        let market = loop {
            let market = self.fetch_market(market_id)?;
            self.authorize(&market, requested_by)?;
            lifecycle::ensure_settleable(&market)?;

            let mut updated = market.clone();
            updated.status = MarketStatus::Cancelled;
            updated.outcome = None;
            updated.cancel_reason = Some(reason.clone());
            updated.updated_at = now;

            match self.store.update_market(&updated, market.version) {
                Ok(version) => {
                    updated.version = version;
                    break updated;
                }
                Err(market_ledger::Error::StorageConflict(reason)) => {
                    self.metrics.storage_conflicts.inc();
                    attempts += 1;
                    if attempts > self.config.conflict_retries {
                        return Err(market_ledger::Error::StorageConflict(reason).into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        let positions = self.store.positions_for_market(market_id)?;
        let plan = settle::compute_refunds(&positions);

        // Refunds are independent per user: one failure never blocks or
        // rolls back the others, it is only reported
        let mut refunds = Vec::new();
        let mut failures = Vec::new();
        let mut total_refunded = Decimal::ZERO;
        for refund in &plan {
            let position = positions
                .iter()
                .find(|p| p.position_id == refund.position_id)
                .expect("refund derived from this snapshot");
            match self.apply_refund(refund, position, now) {
                Ok(true) => {
                    total_refunded += refund.amount;
                    refunds.push(refund.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        position_id = %refund.position_id,
                        user_id = %refund.user_id,
                        error = %e,
                        "Refund failed"
                    );
                    failures.push(SettlementFailure {
                        position_id: refund.position_id,
                        user_id: refund.user_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.trend.snapshot_at(&market, now);
        self.metrics.markets_cancelled.inc();
        self.metrics
            .refund_amount
            .inc_by(total_refunded.to_f64().unwrap_or(0.0));

        tracing::info!(
            market_id = %market_id,
            reason = %reason,
            refunded = refunds.len(),
            failed = failures.len(),
            total_refunded = %total_refunded,
            "Market cancelled"
        );

        Ok(RefundReport {
            market_id,
            refunds,
            total_refunded,
            failures,
        })
    }

    /// Refund one position; `Ok(false)` means it was already settled
    fn apply_refund(&self, refund: &Refund, position: &Position, now: DateTime<Utc>) -> Result<bool> {
        if position.is_settled() {
            tracing::warn!(
                position_id = %position.position_id,
                "Position already settled, skipping refund"
            );
            return Ok(false);
        }

        // `is_winner` stays unset: no outcome was ever determined
        let mut annotated = position.clone();
        annotated.payout = refund.amount;
        annotated.settled_at = Some(now);
        self.store.update_position(&annotated, position.version)?;

        self.balances.credit(&refund.user_id, refund.amount)?;
        Ok(true)
    }

    // Trend

    /// Ordered, time-bounded, normalized chart read for a stream
    pub fn get_trend(
        &self,
        stream_id: &StreamId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TrendEntry>> {
        Ok(self.trend.read(stream_id, since, limit)?)
    }

    // Helpers

    fn fetch_market(&self, market_id: Uuid) -> Result<Market> {
        Ok(self
            .store
            .get_market(market_id)?
            .ok_or(market_ledger::Error::MarketNotFound(market_id))?)
    }

    fn authorize(&self, market: &Market, requested_by: &UserId) -> Result<()> {
        if *requested_by == market.admin_id || self.identity.is_super_admin(requested_by) {
            return Ok(());
        }
        Err(Error::Unauthorized {
            user_id: requested_by.to_string(),
            market_id: market.market_id,
        })
    }

    /// Flip an overdue active market to ended; `None` if it lost the race
    /// or was not due (the sweep or a later read will pick it up)
    fn expire_market(&self, market: &Market, now: DateTime<Utc>) -> Option<Market> {
        let mut updated = market.clone();
        if !lifecycle::expire_if_due(&mut updated, now) {
            return None;
        }

        match self.store.update_market(&updated, market.version) {
            Ok(version) => {
                updated.version = version;
                self.metrics.markets_expired.inc();
                tracing::info!(market_id = %market.market_id, "Market ended");
                self.trend.snapshot_at(&updated, now);
                Some(updated)
            }
            Err(market_ledger::Error::StorageConflict(_)) => None,
            Err(e) => {
                tracing::warn!(market_id = %market.market_id, error = %e, "Expiry write failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use market_ledger::{Error as LedgerError, MemoryStore};

    struct Setup {
        engine: MarketEngine,
        store: Arc<MemoryStore>,
        now: DateTime<Utc>,
    }

    fn setup() -> Setup {
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(StaticIdentity::with_super_admins([UserId::new("root")]));
        let config = EngineConfig {
            conflict_retries: 100,
            ..EngineConfig::default()
        };
        let engine = MarketEngine::new(store.clone(), identity, config).unwrap();
        Setup {
            engine,
            store,
            now: Utc::now(),
        }
    }

    fn open_market(s: &Setup) -> Market {
        s.engine
            .create_market_at(
                CreateMarket {
                    stream_id: StreamId::new("stream-1"),
                    admin_id: UserId::new("admin"),
                    question: "Will the boss fall this attempt?".to_string(),
                    ends_at: s.now + Duration::minutes(10),
                },
                s.now,
            )
            .unwrap()
    }

    fn bet(
        s: &Setup,
        user: &str,
        market_id: Uuid,
        side: BetSide,
        amount: i64,
    ) -> Result<BetReceipt> {
        s.engine.ensure_user(&UserId::new(user)).unwrap();
        s.engine.place_bet_at(
            BetRequest {
                user_id: UserId::new(user),
                market_id,
                side,
                amount: Decimal::from(amount),
            },
            s.now + Duration::seconds(1),
        )
    }

    fn balance_of(s: &Setup, user: &str) -> Decimal {
        s.store
            .get_user(&UserId::new(user))
            .unwrap()
            .unwrap()
            .balance
    }

    #[test]
    fn test_first_bet_round_trip() {
        let s = setup();
        let market = open_market(&s);

        let receipt = bet(&s, "alice", market.market_id, BetSide::Yes, 100).unwrap();

        assert_eq!(receipt.fee, Decimal::new(200, 2)); // 2.00
        assert_eq!(receipt.total_debited, Decimal::new(10200, 2)); // 102.00
        assert_eq!(receipt.price, Decimal::new(50, 2)); // 0.50
        assert_eq!(receipt.shares, Decimal::from(200));
        assert_eq!(receipt.new_balance, Decimal::new(89800, 2)); // 898.00

        let market = s.engine.get_market_at(market.market_id, s.now).unwrap();
        assert_eq!(market.yes_volume, Decimal::from(100));
        assert_eq!(market.no_volume, Decimal::ZERO);
        assert_eq!(market.total_volume, Decimal::from(100)); // fee excluded
        assert_eq!(market.total_bets, 1);
        assert!(market.volumes_consistent());

        let position = s
            .engine
            .get_position(market.market_id, &UserId::new("alice"))
            .unwrap()
            .unwrap();
        assert_eq!(position.is_winner, None);
        assert_eq!(position.payout, Decimal::ZERO);
    }

    #[test]
    fn test_duplicate_position_rejected() {
        let s = setup();
        let market = open_market(&s);

        bet(&s, "alice", market.market_id, BetSide::Yes, 100).unwrap();
        let err = bet(&s, "alice", market.market_id, BetSide::No, 50).unwrap_err();
        assert!(matches!(
            err,
            Error::Ledger(LedgerError::DuplicatePosition { .. })
        ));

        // The rejected bet charged nothing
        assert_eq!(balance_of(&s, "alice"), Decimal::new(89800, 2));
    }

    #[test]
    fn test_insufficient_balance_reports_shortfall() {
        let s = setup();
        let market = open_market(&s);

        let err = bet(&s, "alice", market.market_id, BetSide::Yes, 2000).unwrap_err();
        match err {
            Error::Ledger(LedgerError::InsufficientBalance { balance, required }) => {
                assert_eq!(balance, Decimal::new(100000, 2));
                assert_eq!(required, Decimal::new(204000, 2)); // 2000 + 2%
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(balance_of(&s, "alice"), Decimal::new(100000, 2));
        assert!(s
            .engine
            .get_position(market.market_id, &UserId::new("alice"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_non_positive_stake_rejected() {
        let s = setup();
        let market = open_market(&s);

        let err = bet(&s, "alice", market.market_id, BetSide::Yes, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));

        let err = bet(&s, "bob", market.market_id, BetSide::Yes, -5).unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[test]
    fn test_bet_on_unknown_market() {
        let s = setup();
        let err = bet(&s, "alice", Uuid::now_v7(), BetSide::Yes, 10).unwrap_err();
        assert!(matches!(
            err,
            Error::Ledger(LedgerError::MarketNotFound(_))
        ));
    }

    #[test]
    fn test_bet_at_window_close_expires_market() {
        let s = setup();
        let market = open_market(&s);
        s.engine.ensure_user(&UserId::new("alice")).unwrap();

        // Boundary: now == ends_at is already closed
        let err = s
            .engine
            .place_bet_at(
                BetRequest {
                    user_id: UserId::new("alice"),
                    market_id: market.market_id,
                    side: BetSide::Yes,
                    amount: Decimal::from(10),
                },
                market.ends_at,
            )
            .unwrap_err();
        assert!(matches!(err, Error::MarketExpired(_)));

        // The rejected attempt flipped the market to ended
        let market = s.store.get_market(market.market_id).unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Ended);
        assert_eq!(balance_of(&s, "alice"), Decimal::new(100000, 2));
    }

    #[test]
    fn test_bet_on_ended_market_not_active() {
        let s = setup();
        let market = open_market(&s);
        s.engine
            .expire_due_at(market.ends_at)
            .unwrap();

        let err = bet(&s, "alice", market.market_id, BetSide::Yes, 10).unwrap_err();
        assert!(matches!(err, Error::MarketNotActive(_)));
    }

    #[test]
    fn test_pricing_sequence_uses_pre_bet_volumes() {
        let s = setup();
        let market = open_market(&s);

        // Empty book: even odds
        let r1 = bet(&s, "alice", market.market_id, BetSide::Yes, 100).unwrap();
        assert_eq!(r1.price, Decimal::new(50, 2));

        // All volume on YES: NO quote hits the price floor
        let r2 = bet(&s, "bob", market.market_id, BetSide::No, 100).unwrap();
        assert_eq!(r2.price, Decimal::new(1, 2));
        assert_eq!(r2.shares, Decimal::from(10000));

        // Balanced book again
        let r3 = bet(&s, "carol", market.market_id, BetSide::Yes, 50).unwrap();
        assert_eq!(r3.price, Decimal::new(50, 2));

        let market = s.store.get_market(market.market_id).unwrap().unwrap();
        assert_eq!(market.total_volume, Decimal::from(250));
        assert_eq!(market.total_bets, 3);
        assert!(market.volumes_consistent());
    }

    /// Pool-split scenario: two YES positions (100 staked, 200 shares
    /// each), one NO position (100 staked, 100 shares), outcome YES.
    fn seeded_split_market(s: &Setup) -> Market {
        let market = open_market(s);
        for (user, side, shares) in [
            ("alice", BetSide::Yes, 200),
            ("bob", BetSide::Yes, 200),
            ("carol", BetSide::No, 100),
        ] {
            s.engine.ensure_user(&UserId::new(user)).unwrap();
            s.store
                .insert_position(&Position::new(
                    market.market_id,
                    UserId::new(user),
                    side,
                    Decimal::from(100),
                    Decimal::from(2),
                    Decimal::new(50, 2),
                    Decimal::from(shares),
                    s.now,
                ))
                .unwrap();
        }
        market
    }

    #[test]
    fn test_resolution_pool_split() {
        let s = setup();
        let market = seeded_split_market(&s);

        let report = s
            .engine
            .resolve_market_at(
                market.market_id,
                true,
                Some("boss fell at 58:30".to_string()),
                &UserId::new("admin"),
                s.now + Duration::minutes(11),
            )
            .unwrap();

        assert_eq!(report.pool, Decimal::from(100));
        assert_eq!(report.total_winning_shares, Decimal::from(400));
        assert_eq!(report.winners, 2);
        assert_eq!(report.losers, 1);
        assert_eq!(report.total_paid, Decimal::from(300));
        assert!(!report.degenerate);
        assert!(report.failures.is_empty());

        // Each winner: 100 + (200/400)*100 = 150
        for user in ["alice", "bob"] {
            assert_eq!(balance_of(&s, user), Decimal::new(115000, 2));
            let position = s
                .engine
                .get_position(market.market_id, &UserId::new(user))
                .unwrap()
                .unwrap();
            assert_eq!(position.is_winner, Some(true));
            assert_eq!(position.payout, Decimal::from(150));
        }

        // Loser: no payout, stake forfeited
        assert_eq!(balance_of(&s, "carol"), Decimal::new(100000, 2));
        let position = s
            .engine
            .get_position(market.market_id, &UserId::new("carol"))
            .unwrap()
            .unwrap();
        assert_eq!(position.is_winner, Some(false));
        assert_eq!(position.payout, Decimal::ZERO);

        let market = s.store.get_market(market.market_id).unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Resolved);
        assert_eq!(market.outcome, Some(true));
        assert!(market.resolved_at.is_some());
    }

    #[test]
    fn test_resolution_is_not_repeatable() {
        let s = setup();
        let market = seeded_split_market(&s);
        let admin = UserId::new("admin");

        s.engine
            .resolve_market_at(market.market_id, true, None, &admin, s.now)
            .unwrap();
        let balances_after: Vec<Decimal> = ["alice", "bob", "carol"]
            .iter()
            .map(|u| balance_of(&s, u))
            .collect();

        let err = s
            .engine
            .resolve_market_at(market.market_id, true, None, &admin, s.now)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        // Second call changed no balances
        for (user, before) in ["alice", "bob", "carol"].iter().zip(balances_after) {
            assert_eq!(balance_of(&s, user), before);
        }
    }

    #[test]
    fn test_resolution_updates_user_stats() {
        let s = setup();
        let market = seeded_split_market(&s);

        s.engine
            .resolve_market_at(market.market_id, true, None, &UserId::new("admin"), s.now)
            .unwrap();

        let winner = s.store.get_user(&UserId::new("alice")).unwrap().unwrap();
        assert_eq!(winner.stats.wins, 1);
        assert_eq!(winner.stats.losses, 0);
        assert_eq!(winner.stats.streak, 1);
        assert_eq!(winner.stats.total_staked, Decimal::from(100));
        assert_eq!(winner.stats.total_earned, Decimal::from(150));
        assert_eq!(winner.stats.win_rate(), 1.0);

        let loser = s.store.get_user(&UserId::new("carol")).unwrap().unwrap();
        assert_eq!(loser.stats.wins, 0);
        assert_eq!(loser.stats.losses, 1);
        assert_eq!(loser.stats.streak, 0);
        assert_eq!(loser.stats.total_earned, Decimal::ZERO);
    }

    #[test]
    fn test_resolution_with_no_positions_is_noop() {
        let s = setup();
        let market = open_market(&s);

        let report = s
            .engine
            .resolve_market_at(market.market_id, false, None, &UserId::new("admin"), s.now)
            .unwrap();
        assert_eq!(report.winners, 0);
        assert_eq!(report.losers, 0);
        assert_eq!(report.total_paid, Decimal::ZERO);
        assert!(!report.degenerate);
    }

    #[test]
    fn test_cancellation_refunds_stake_plus_fee() {
        let s = setup();
        let market = open_market(&s);

        bet(&s, "alice", market.market_id, BetSide::Yes, 50).unwrap();
        assert_eq!(balance_of(&s, "alice"), Decimal::new(94900, 2)); // -51.00

        let report = s
            .engine
            .cancel_market_at(
                market.market_id,
                "stream went down",
                &UserId::new("admin"),
                s.now + Duration::minutes(1),
            )
            .unwrap();

        assert_eq!(report.refunds.len(), 1);
        assert_eq!(report.total_refunded, Decimal::from(51));
        assert!(report.failures.is_empty());
        assert_eq!(balance_of(&s, "alice"), Decimal::new(100000, 2));

        // Refund annotation: payout recorded, winner flag never set
        let position = s
            .engine
            .get_position(market.market_id, &UserId::new("alice"))
            .unwrap()
            .unwrap();
        assert_eq!(position.payout, Decimal::from(51));
        assert_eq!(position.is_winner, None);
        assert!(position.is_settled());

        let market = s.store.get_market(market.market_id).unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Cancelled);
        assert_eq!(market.cancel_reason.as_deref(), Some("stream went down"));
        assert_eq!(market.outcome, None);
    }

    #[test]
    fn test_cancel_works_from_ended_but_not_resolved() {
        let s = setup();
        let admin = UserId::new("admin");

        // Ended market still refundable
        let market = open_market(&s);
        bet(&s, "alice", market.market_id, BetSide::No, 50).unwrap();
        s.engine.expire_due_at(market.ends_at).unwrap();
        let report = s
            .engine
            .cancel_market_at(market.market_id, "no result", &admin, s.now)
            .unwrap();
        assert_eq!(report.total_refunded, Decimal::from(51));

        // Cancelling twice is an invalid transition
        let err = s
            .engine
            .cancel_market_at(market.market_id, "again", &admin, s.now)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        // A resolved market cannot be cancelled
        let resolved = seeded_split_market(&s);
        s.engine
            .resolve_market_at(resolved.market_id, true, None, &admin, s.now)
            .unwrap();
        let err = s
            .engine
            .cancel_market_at(resolved.market_id, "too late", &admin, s.now)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_settlement_requires_owning_admin_or_super_admin() {
        let s = setup();
        let market = seeded_split_market(&s);

        let err = s
            .engine
            .resolve_market_at(market.market_id, true, None, &UserId::new("mallory"), s.now)
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));

        // Super-admin override
        s.engine
            .resolve_market_at(market.market_id, true, None, &UserId::new("root"), s.now)
            .unwrap();
    }

    #[test]
    fn test_renewal_reopens_ended_market() {
        let s = setup();
        let market = open_market(&s);
        let admin = UserId::new("admin");

        bet(&s, "alice", market.market_id, BetSide::Yes, 100).unwrap();

        // Renewal of an active market is illegal
        let err = s
            .engine
            .renew_market_at(market.market_id, 30, None, &admin, s.now + Duration::seconds(2))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        // After expiry it reopens with a fresh window; volumes and
        // positions survive
        let later = market.ends_at + Duration::minutes(1);
        let renewed = s
            .engine
            .renew_market_at(
                market.market_id,
                30,
                Some("Will the NEXT boss fall?".to_string()),
                &admin,
                later,
            )
            .unwrap();

        assert_eq!(renewed.status, MarketStatus::Active);
        assert_eq!(renewed.ends_at, later + Duration::minutes(30));
        assert_eq!(renewed.question, "Will the NEXT boss fall?");
        assert_eq!(renewed.yes_volume, Decimal::from(100));
        assert!(s
            .engine
            .get_position(market.market_id, &UserId::new("alice"))
            .unwrap()
            .is_some());

        // Zero or negative extension is malformed
        let err = s
            .engine
            .renew_market_at(market.market_id, 0, None, &admin, later)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[test]
    fn test_expiry_sweep_only_touches_due_markets() {
        let s = setup();
        let due = open_market(&s);
        let not_due = s
            .engine
            .create_market_at(
                CreateMarket {
                    stream_id: StreamId::new("stream-2"),
                    admin_id: UserId::new("admin"),
                    question: "Another one?".to_string(),
                    ends_at: s.now + Duration::hours(2),
                },
                s.now,
            )
            .unwrap();

        let expired = s.engine.expire_due_at(due.ends_at).unwrap();
        assert_eq!(expired, 1);

        assert_eq!(
            s.store.get_market(due.market_id).unwrap().unwrap().status,
            MarketStatus::Ended
        );
        assert_eq!(
            s.store.get_market(not_due.market_id).unwrap().unwrap().status,
            MarketStatus::Active
        );

        // Sweep is idempotent
        assert_eq!(s.engine.expire_due_at(due.ends_at).unwrap(), 0);
    }

    #[test]
    fn test_trend_lifecycle_and_reset() {
        let s = setup();
        let market = open_market(&s);
        let stream = market.stream_id.clone();

        bet(&s, "alice", market.market_id, BetSide::Yes, 100).unwrap();
        s.engine
            .resolve_market_at(
                market.market_id,
                true,
                None,
                &UserId::new("admin"),
                s.now + Duration::seconds(2),
            )
            .unwrap();

        let entries = s.engine.get_trend(&stream, None, 0).unwrap();
        assert_eq!(entries.len(), 3); // baseline, bet, resolution
        assert_eq!(entries[0].yes_percent, 50); // zero-volume baseline
        assert_eq!(entries[1].yes_percent, 100);
        assert_eq!(entries[1].no_percent, 0);

        // A brand-new market on the same stream wipes the chart
        s.engine
            .create_market_at(
                CreateMarket {
                    stream_id: stream.clone(),
                    admin_id: UserId::new("admin"),
                    question: "Round two?".to_string(),
                    ends_at: s.now + Duration::minutes(30),
                },
                s.now + Duration::seconds(3),
            )
            .unwrap();

        let entries = s.engine.get_trend(&stream, None, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].yes_percent, 50);
    }

    #[test]
    fn test_get_market_lazily_expires() {
        let s = setup();
        let market = open_market(&s);

        let seen = s
            .engine
            .get_market_at(market.market_id, market.ends_at + Duration::seconds(1))
            .unwrap();
        assert_eq!(seen.status, MarketStatus::Ended);

        let stored = s.store.get_market(market.market_id).unwrap().unwrap();
        assert_eq!(stored.status, MarketStatus::Ended);
    }

    #[test]
    fn test_resolve_user_and_funding() {
        let s = setup();

        let user = s.engine.resolve_user("alice").unwrap();
        assert_eq!(user.balance, Decimal::new(100000, 2));

        // Idempotent on repeat contact
        let again = s.engine.resolve_user("alice").unwrap();
        assert_eq!(again.user_id, user.user_id);

        let funded = s
            .engine
            .fund(&user.user_id, Decimal::new(50000, 2))
            .unwrap();
        assert_eq!(funded.balance, Decimal::new(150000, 2));

        let err = s.engine.fund(&user.user_id, Decimal::ZERO).unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));

        let err = s.engine.resolve_user("").unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::UserNotFound(_))));
    }

    #[test]
    fn test_concurrent_duplicate_bets_create_one_position() {
        let s = setup();
        let market = open_market(&s);
        s.engine.ensure_user(&UserId::new("alice")).unwrap();

        let mut successes = 0;
        let mut duplicates = 0;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let engine = &s.engine;
                    let market_id = market.market_id;
                    let at = s.now + Duration::seconds(1);
                    scope.spawn(move || {
                        engine.place_bet_at(
                            BetRequest {
                                user_id: UserId::new("alice"),
                                market_id,
                                side: BetSide::Yes,
                                amount: Decimal::from(10),
                            },
                            at,
                        )
                    })
                })
                .collect();

            for handle in handles {
                match handle.join().unwrap() {
                    Ok(_) => successes += 1,
                    Err(Error::Ledger(LedgerError::DuplicatePosition { .. })) => duplicates += 1,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        });

        assert_eq!(successes, 1);
        assert_eq!(duplicates, 7);

        // Exactly one debit stuck: 10.00 + 0.20 fee
        assert_eq!(balance_of(&s, "alice"), Decimal::new(98980, 2));
        assert_eq!(
            s.store.positions_for_market(market.market_id).unwrap().len(),
            1
        );
        let market = s.store.get_market(market.market_id).unwrap().unwrap();
        assert_eq!(market.total_bets, 1);
        assert_eq!(market.total_volume, Decimal::from(10));
    }
}
