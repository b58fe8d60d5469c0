use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::market_data::normaliser::collect_side;
use crate::market_data::types::{BookSide, OrderBookSide, OrderBookSnapshot, PriceLevel};

// Working copy of one venue's book, maintained from snapshot + diffs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalBook {
    // price -> size (aggregate)
    pub bids: BTreeMap<Decimal, Decimal>, // highest price = best bid
    pub asks: BTreeMap<Decimal, Decimal>, // lowest price  = best ask
}

impl ExternalBook {
    pub fn new() -> Self {
        Self::default()
    }

    // Replace the whole book with a fresh (already normalised) snapshot
    pub fn apply_snapshot(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        self.bids.clear();
        self.asks.clear();

        for l in bids.iter().filter(|l| !l.size.is_zero()) {
            self.bids.insert(l.price, l.size);
        }
        for l in asks.iter().filter(|l| !l.size.is_zero()) {
            self.asks.insert(l.price, l.size);
        }
    }

    /// Size zero removes the level (absent is fine), anything else upserts.
    pub fn apply_change(&mut self, side: BookSide, price: Decimal, size: Decimal) {
        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if size.is_zero() {
            levels.remove(&price);
        } else {
            levels.insert(price, size);
        }
    }

    pub fn bbo(&self) -> (Option<PriceLevel>, Option<PriceLevel>) {
        let best_bid = self.bids.iter().next_back().map(|(p, s)| PriceLevel::new(*p, *s));
        let best_ask = self.asks.iter().next().map(|(p, s)| PriceLevel::new(*p, *s));
        (best_bid, best_ask)
    }

    pub fn side(&self, side: BookSide) -> OrderBookSide {
        match side {
            BookSide::Bid => collect_side(&self.bids, side),
            BookSide::Ask => collect_side(&self.asks, side),
        }
    }

    pub fn to_snapshot(&self, exchange: &str, symbol: &str, observed_at: DateTime<Utc>) -> OrderBookSnapshot {
        OrderBookSnapshot {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            observed_at,
            bids: self.side(BookSide::Bid),
            asks: self.side(BookSide::Ask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn seeded() -> ExternalBook {
        let mut book = ExternalBook::new();
        book.apply_snapshot(
            &[PriceLevel::new(dec!(100), dec!(1)), PriceLevel::new(dec!(99), dec!(2))],
            &[PriceLevel::new(dec!(101), dec!(1))],
        );
        book
    }

    #[test]
    fn snapshot_replaces_previous_levels() {
        let mut book = seeded();
        book.apply_snapshot(&[PriceLevel::new(dec!(50), dec!(1))], &[]);
        assert_eq!(book.bids.len(), 1);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn removing_absent_level_is_noop() {
        let mut book = seeded();
        let before = book.clone();
        book.apply_change(BookSide::Bid, dec!(42), dec!(0));
        assert_eq!(book, before);
    }

    #[test]
    fn change_upserts_and_bbo_follows() {
        let mut book = seeded();
        book.apply_change(BookSide::Bid, dec!(100.5), dec!(3));
        book.apply_change(BookSide::Ask, dec!(101), dec!(7));
        let (bid, ask) = book.bbo();
        assert_eq!(bid, Some(PriceLevel::new(dec!(100.5), dec!(3))));
        assert_eq!(ask, Some(PriceLevel::new(dec!(101), dec!(7))));
    }
}
