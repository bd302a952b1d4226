//! Pari-mutuel pricing model
//!
//! Pure functions from cumulative side volumes to implied probability,
//! per-share price and share count. A quote is always computed from the
//! volumes as they stood immediately before the bet being priced: a bet
//! never moves its own price. This is a naive pari-mutuel quote, not a
//! constant-product market maker.

use market_ledger::BetSide;
use rust_decimal::Decimal;

/// Quote for one prospective bet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    /// Implied probability of YES from current volumes
    pub implied_yes: Decimal,

    /// Price per share for the chosen side, floored at the minimum price
    pub price: Decimal,

    /// Shares purchased for the stake at that price
    pub shares: Decimal,
}

/// Implied YES probability from cumulative volumes; 0.5 on an empty book
pub fn implied_yes(yes_volume: Decimal, no_volume: Decimal) -> Decimal {
    let total = yes_volume + no_volume;
    if total > Decimal::ZERO {
        yes_volume / total
    } else {
        Decimal::new(5, 1) // 0.5
    }
}

/// Quote a stake against pre-bet volumes
///
/// The price floor keeps the share count finite when one side has zero
/// volume. Shares are kept to four decimal places.
pub fn quote(
    yes_volume: Decimal,
    no_volume: Decimal,
    side: BetSide,
    amount: Decimal,
    min_price: Decimal,
) -> Quote {
    let implied = implied_yes(yes_volume, no_volume);
    let raw_price = match side {
        BetSide::Yes => implied,
        BetSide::No => Decimal::ONE - implied,
    };
    let price = raw_price.max(min_price);
    let shares = (amount / price).round_dp(4);

    Quote {
        implied_yes: implied,
        price,
        shares,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_price() -> Decimal {
        Decimal::new(1, 2)
    }

    #[test]
    fn test_fresh_market_quotes_even_odds() {
        let q = quote(
            Decimal::ZERO,
            Decimal::ZERO,
            BetSide::Yes,
            Decimal::new(10000, 2), // 100.00
            min_price(),
        );
        assert_eq!(q.implied_yes, Decimal::new(5, 1));
        assert_eq!(q.price, Decimal::new(5, 1));
        assert_eq!(q.shares, Decimal::from(200));
    }

    #[test]
    fn test_lopsided_book_prices_favorite_higher() {
        // 300 YES vs 100 NO: p = 0.75
        let yes = Decimal::from(300);
        let no = Decimal::from(100);

        let q_yes = quote(yes, no, BetSide::Yes, Decimal::from(75), min_price());
        assert_eq!(q_yes.price, Decimal::new(75, 2));
        assert_eq!(q_yes.shares, Decimal::from(100));

        let q_no = quote(yes, no, BetSide::No, Decimal::from(75), min_price());
        assert_eq!(q_no.price, Decimal::new(25, 2));
        assert_eq!(q_no.shares, Decimal::from(300));
    }

    #[test]
    fn test_zero_volume_side_hits_price_floor() {
        // All volume on YES: NO price would be 0 without the floor
        let q = quote(
            Decimal::from(500),
            Decimal::ZERO,
            BetSide::No,
            Decimal::from(10),
            min_price(),
        );
        assert_eq!(q.price, min_price());
        assert_eq!(q.shares, Decimal::from(1000));
    }

    #[test]
    fn test_quote_ignores_own_stake() {
        // Same book, different stake sizes: price identical
        let yes = Decimal::from(60);
        let no = Decimal::from(40);
        let small = quote(yes, no, BetSide::Yes, Decimal::ONE, min_price());
        let large = quote(yes, no, BetSide::Yes, Decimal::from(1_000_000), min_price());
        assert_eq!(small.price, large.price);
    }
}
