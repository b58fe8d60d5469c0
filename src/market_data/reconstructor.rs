// Snapshot + incremental-diff book reconstruction for streamed venues.
//
// One `Reconstructor` belongs to one streaming session and tracks every
// symbol that session carries. A key becomes `Live` on its first snapshot,
// mutates in place on each diff, and loses its state when the session
// resets. Diffs that arrive without a live book are dropped: there is
// nothing to apply them to, and the next snapshot re-establishes ground
// truth.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::market_data::external_book::ExternalBook;
use crate::market_data::normaliser::{normalise_side, parse_level, MalformedLevel};
use crate::market_data::types::{BookSide, OrderBookSnapshot, RawLevel};

/// Stream events after transport decoding, before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    Snapshot {
        symbol: String,
        bids: Vec<RawLevel>,
        asks: Vec<RawLevel>,
    },
    /// Each change is a raw `[side, price, size]` triple.
    Diff {
        symbol: String,
        changes: Vec<RawLevel>,
    },
}

impl BookEvent {
    pub fn symbol(&self) -> &str {
        match self {
            BookEvent::Snapshot { symbol, .. } | BookEvent::Diff { symbol, .. } => symbol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookPhase {
    Uninitialized,
    Live,
    /// Was live before a connection reset; waits for a snapshot exactly
    /// like `Uninitialized`.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChange {
    pub side: BookSide,
    pub price: Decimal,
    pub size: Decimal,
}

pub fn parse_change(raw: &RawLevel) -> Result<LevelChange, MalformedLevel> {
    let side = raw
        .first()
        .and_then(Value::as_str)
        .and_then(BookSide::from_wire)
        .ok_or_else(|| MalformedLevel {
            raw: Value::Array(raw.clone()).to_string(),
            reason: "unknown side",
        })?;
    let level = parse_level(&raw[1..].to_vec())?;
    Ok(LevelChange { side, price: level.price, size: level.size })
}

enum TrackedBook {
    Live(ExternalBook),
    Stale,
}

pub struct Reconstructor {
    exchange: String,
    books: HashMap<String, TrackedBook>,
}

impl Reconstructor {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self { exchange: exchange.into(), books: HashMap::new() }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn phase(&self, symbol: &str) -> BookPhase {
        match self.books.get(symbol) {
            None => BookPhase::Uninitialized,
            Some(TrackedBook::Live(_)) => BookPhase::Live,
            Some(TrackedBook::Stale) => BookPhase::Stale,
        }
    }

    pub fn book(&self, symbol: &str) -> Option<&ExternalBook> {
        match self.books.get(symbol) {
            Some(TrackedBook::Live(book)) => Some(book),
            _ => None,
        }
    }

    /// Apply one event. Returns the resulting observation, or `None` when a
    /// diff was dropped for lack of a live book.
    pub fn apply(&mut self, event: BookEvent, observed_at: DateTime<Utc>) -> Option<OrderBookSnapshot> {
        match event {
            BookEvent::Snapshot { symbol, bids, asks } => {
                let mut book = ExternalBook::new();
                book.apply_snapshot(
                    &normalise_side(&bids, BookSide::Bid),
                    &normalise_side(&asks, BookSide::Ask),
                );
                let snap = book.to_snapshot(&self.exchange, &symbol, observed_at);
                debug!(exchange = %self.exchange, %symbol, bids = snap.bids.len(), asks = snap.asks.len(), "book live from snapshot");
                self.books.insert(symbol, TrackedBook::Live(book));
                Some(snap)
            }
            BookEvent::Diff { symbol, changes } => {
                let Some(TrackedBook::Live(book)) = self.books.get_mut(&symbol) else {
                    warn!(exchange = %self.exchange, %symbol, "dropping diff without a live book");
                    return None;
                };
                for raw in &changes {
                    match parse_change(raw) {
                        Ok(c) => book.apply_change(c.side, c.price, c.size),
                        Err(e) => warn!(exchange = %self.exchange, %symbol, error = %e, "skipping change"),
                    }
                }
                Some(book.to_snapshot(&self.exchange, &symbol, observed_at))
            }
        }
    }

    /// Connection reset: every live book is discarded.
    pub fn reset(&mut self) {
        for tracked in self.books.values_mut() {
            *tracked = TrackedBook::Stale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::types::PriceLevel;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn snapshot_event() -> BookEvent {
        BookEvent::Snapshot {
            symbol: "BTC/USDT".into(),
            bids: vec![vec![json!(100), json!(1)], vec![json!(99), json!(2)]],
            asks: vec![vec![json!(101), json!(1)]],
        }
    }

    #[test]
    fn snapshot_then_diff_matches_expected_book() {
        let mut r = Reconstructor::new("coinbase");
        r.apply(snapshot_event(), Utc::now()).unwrap();
        let snap = r
            .apply(
                BookEvent::Diff {
                    symbol: "BTC/USDT".into(),
                    changes: vec![
                        vec![json!("buy"), json!(100), json!(0)],
                        vec![json!("sell"), json!(101), json!(2)],
                    ],
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(snap.bids, vec![PriceLevel::new(dec!(99), dec!(2))]);
        assert_eq!(snap.asks, vec![PriceLevel::new(dec!(101), dec!(2))]);
        assert_eq!(snap.exchange, "coinbase");
    }

    #[test]
    fn removing_unknown_price_leaves_book_unchanged() {
        let mut r = Reconstructor::new("coinbase");
        let first = r.apply(snapshot_event(), Utc::now()).unwrap();
        let after = r
            .apply(
                BookEvent::Diff {
                    symbol: "BTC/USDT".into(),
                    changes: vec![vec![json!("sell"), json!("555"), json!("0")]],
                },
                first.observed_at,
            )
            .unwrap();
        assert_eq!(after, first);
    }

    #[test]
    fn diff_before_snapshot_is_dropped() {
        let mut r = Reconstructor::new("coinbase");
        let out = r.apply(
            BookEvent::Diff { symbol: "ETH/USDT".into(), changes: vec![vec![json!("buy"), json!(1), json!(1)]] },
            Utc::now(),
        );
        assert!(out.is_none());
        assert_eq!(r.phase("ETH/USDT"), BookPhase::Uninitialized);
    }

    #[test]
    fn reset_discards_live_state_until_next_snapshot() {
        let mut r = Reconstructor::new("coinbase");
        r.apply(snapshot_event(), Utc::now());
        assert_eq!(r.phase("BTC/USDT"), BookPhase::Live);

        r.reset();
        assert_eq!(r.phase("BTC/USDT"), BookPhase::Stale);
        assert!(r.book("BTC/USDT").is_none());
        let dropped = r.apply(
            BookEvent::Diff { symbol: "BTC/USDT".into(), changes: vec![vec![json!("buy"), json!(98), json!(5)]] },
            Utc::now(),
        );
        assert!(dropped.is_none());

        r.apply(snapshot_event(), Utc::now()).unwrap();
        assert_eq!(r.phase("BTC/USDT"), BookPhase::Live);
        assert_eq!(r.book("BTC/USDT").unwrap().bids.len(), 2);
    }

    #[test]
    fn malformed_change_is_skipped_rest_applies() {
        let mut r = Reconstructor::new("coinbase");
        r.apply(snapshot_event(), Utc::now());
        let snap = r
            .apply(
                BookEvent::Diff {
                    symbol: "BTC/USDT".into(),
                    changes: vec![
                        vec![json!("hold"), json!(100), json!(1)],
                        vec![json!("buy"), json!("nan?"), json!(1)],
                        vec![json!("buy"), json!(98), json!(4)],
                    ],
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(snap.bids.len(), 3);
        assert_eq!(snap.bids[2], PriceLevel::new(dec!(98), dec!(4)));
    }

    proptest! {
        #[test]
        fn diffs_preserve_order_and_uniqueness(
            changes in prop::collection::vec((any::<bool>(), 90u32..112, 0u32..4), 0..80)
        ) {
            let mut r = Reconstructor::new("coinbase");
            r.apply(snapshot_event(), Utc::now());
            let mut last = None;
            for (buy, price, size) in changes {
                let side = if buy { "buy" } else { "sell" };
                last = r.apply(
                    BookEvent::Diff {
                        symbol: "BTC/USDT".into(),
                        changes: vec![vec![json!(side), json!(price.to_string()), json!(size.to_string())]],
                    },
                    Utc::now(),
                );
            }
            if let Some(snap) = last {
                prop_assert!(snap.bids.windows(2).all(|w| w[0].price > w[1].price));
                prop_assert!(snap.asks.windows(2).all(|w| w[0].price < w[1].price));
                prop_assert!(snap.bids.iter().chain(snap.asks.iter()).all(|l| !l.size.is_zero()));
            }
        }
    }
}
