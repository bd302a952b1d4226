//! Balance transaction manager
//!
//! Every balance mutation in the system goes through here: bet debits,
//! settlement credits, refunds and external funding. Mutations are
//! version-guarded read-modify-write loops against the store, so two
//! concurrent transactions can never both act on a stale balance; the
//! loser of the race re-reads and re-validates. The non-negative balance
//! invariant is enforced on every debit, not assumed.

use crate::{
    error::{Error, Result},
    store::LedgerStore,
    types::{User, UserId},
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Default bound on conditional-update retries before the conflict is
/// surfaced to the caller
const DEFAULT_MAX_RETRIES: u32 = 8;

/// Atomic debit/credit discipline over user balances
#[derive(Clone)]
pub struct Balances {
    store: Arc<dyn LedgerStore>,
    max_retries: u32,
}

impl Balances {
    /// Create with the default retry bound
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_retries(store, DEFAULT_MAX_RETRIES)
    }

    /// Create with an explicit retry bound
    pub fn with_retries(store: Arc<dyn LedgerStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Apply one mutation to a user record under compare-and-swap
    ///
    /// The closure sees the freshest record on every attempt; returning an
    /// error from it aborts without retrying (a domain rejection like an
    /// insufficient balance is not a race). Only store-level version
    /// conflicts are retried, up to the configured bound.
    pub fn apply<F>(&self, user_id: &UserId, mutate: F) -> Result<User>
    where
        F: Fn(&mut User) -> Result<()>,
    {
        let mut attempts = 0u32;
        loop {
            let mut user = self
                .store
                .get_user(user_id)?
                .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
            let expected = user.version;

            mutate(&mut user)?;
            user.updated_at = Utc::now();

            match self.store.update_user(&user, expected) {
                Ok(new_version) => {
                    user.version = new_version;
                    return Ok(user);
                }
                Err(Error::StorageConflict(reason)) => {
                    attempts += 1;
                    if attempts > self.max_retries {
                        return Err(Error::StorageConflict(reason));
                    }
                    tracing::debug!(
                        user_id = %user_id,
                        attempts,
                        "Balance update lost a version race, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Debit `amount + fee` from a user, failing if the balance is short
    ///
    /// Applied exactly once per logical event; if a later step of the
    /// caller's flow fails, the caller reverses with [`Balances::credit`].
    pub fn debit(&self, user_id: &UserId, amount: Decimal, fee: Decimal) -> Result<User> {
        let needed = amount + fee;
        let user = self.apply(user_id, |user| {
            if user.balance < needed {
                return Err(Error::InsufficientBalance {
                    balance: user.balance,
                    required: needed,
                });
            }
            user.balance -= needed;
            Ok(())
        })?;

        tracing::debug!(user_id = %user_id, %needed, balance = %user.balance, "Debit applied");
        Ok(user)
    }

    /// Credit an amount to a user; no upper bound
    pub fn credit(&self, user_id: &UserId, amount: Decimal) -> Result<User> {
        let user = self.apply(user_id, |user| {
            user.balance += amount;
            Ok(())
        })?;

        tracing::debug!(user_id = %user_id, %amount, balance = %user.balance, "Credit applied");
        Ok(user)
    }
}
