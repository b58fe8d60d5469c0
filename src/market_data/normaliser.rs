// Convert wire levels into canonical, exactly-decimal book sides.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;

use crate::market_data::types::{BookSide, OrderBookSide, OrderBookSnapshot, PriceLevel, RawLevel, RawOrderBook};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed price level {raw}: {reason}")]
pub struct MalformedLevel {
    pub raw: String,
    pub reason: &'static str,
}

impl MalformedLevel {
    fn new(raw: &RawLevel, reason: &'static str) -> Self {
        Self { raw: Value::Array(raw.clone()).to_string(), reason }
    }
}

/// Strings and JSON numbers both parse; numbers may come out of serde_json
/// in exponent form ("1e-7"), which `Decimal::from_str` rejects.
pub fn parse_decimal(v: &Value) -> Option<Decimal> {
    let text = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    // from_str tolerates digit separators; venue data never carries them
    if text.contains('_') {
        return None;
    }
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Parse one [price, size, ..] entry. Extra trailing fields are ignored.
pub fn parse_level(raw: &RawLevel) -> Result<PriceLevel, MalformedLevel> {
    if raw.len() < 2 {
        return Err(MalformedLevel::new(raw, "expected [price, size]"));
    }
    let price = parse_decimal(&raw[0]).ok_or_else(|| MalformedLevel::new(raw, "price is not numeric"))?;
    let size = parse_decimal(&raw[1]).ok_or_else(|| MalformedLevel::new(raw, "size is not numeric"))?;
    if price <= Decimal::ZERO {
        return Err(MalformedLevel::new(raw, "price must be positive"));
    }
    if size < Decimal::ZERO {
        return Err(MalformedLevel::new(raw, "size must not be negative"));
    }
    Ok(PriceLevel::new(price.normalize(), size.normalize()))
}

/// Build a canonical side: malformed entries are skipped (and logged),
/// zero sizes dropped, later duplicates overwrite earlier ones, and the
/// result is ordered best-first for `side`.
pub fn normalise_side(raw: &[RawLevel], side: BookSide) -> OrderBookSide {
    let mut levels: BTreeMap<Decimal, Decimal> = BTreeMap::new();
    for entry in raw {
        match parse_level(entry) {
            Ok(level) if level.size.is_zero() => {}
            Ok(level) => {
                levels.insert(level.price, level.size);
            }
            Err(e) => warn!(?side, error = %e, "skipping level"),
        }
    }
    collect_side(&levels, side)
}

/// Render a price -> size map in the side's canonical order.
pub fn collect_side(levels: &BTreeMap<Decimal, Decimal>, side: BookSide) -> OrderBookSide {
    let to_level = |(p, s): (&Decimal, &Decimal)| PriceLevel::new(*p, *s);
    match side {
        BookSide::Bid => levels.iter().rev().map(to_level).collect(),
        BookSide::Ask => levels.iter().map(to_level).collect(),
    }
}

/// Turn one fetched payload into an observation. The venue's own timestamp
/// wins when it sent one; otherwise `fetched_at` is used.
pub fn normalise_book(
    exchange: &str,
    symbol: &str,
    raw: &RawOrderBook,
    fetched_at: DateTime<Utc>,
) -> OrderBookSnapshot {
    let observed_at = raw
        .timestamp_ms
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(fetched_at);
    OrderBookSnapshot {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        observed_at,
        bids: normalise_side(&raw.bids, BookSide::Bid),
        asks: normalise_side(&raw.asks, BookSide::Ask),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn lvl(p: Value, s: Value) -> RawLevel {
        vec![p, s]
    }

    #[test]
    fn strings_and_numbers_parse_exactly() {
        let raw = vec![lvl(json!("100.10"), json!(1)), lvl(json!(99.5), json!("0.25"))];
        let side = normalise_side(&raw, BookSide::Bid);
        assert_eq!(side, vec![
            PriceLevel::new(dec!(100.1), dec!(1)),
            PriceLevel::new(dec!(99.5), dec!(0.25)),
        ]);
    }

    #[test]
    fn digit_separators_are_rejected() {
        assert_eq!(parse_decimal(&json!("1_000")), None);
        assert!(parse_level(&lvl(json!("100"), json!("1_5"))).is_err());
    }

    #[test]
    fn exponent_numbers_parse() {
        assert_eq!(parse_decimal(&json!(1e-7)), Some(dec!(0.0000001)));
    }

    #[test]
    fn asks_ascend_and_zero_sizes_drop() {
        let raw = vec![
            lvl(json!("102"), json!("1")),
            lvl(json!("101"), json!("0")),
            lvl(json!("100"), json!("3")),
        ];
        let side = normalise_side(&raw, BookSide::Ask);
        assert_eq!(side, vec![
            PriceLevel::new(dec!(100), dec!(3)),
            PriceLevel::new(dec!(102), dec!(1)),
        ]);
    }

    #[test]
    fn last_duplicate_wins() {
        let raw = vec![lvl(json!("100"), json!("1")), lvl(json!("100.0"), json!("4"))];
        let side = normalise_side(&raw, BookSide::Bid);
        assert_eq!(side, vec![PriceLevel::new(dec!(100), dec!(4))]);
    }

    #[test]
    fn malformed_levels_are_skipped() {
        let raw = vec![
            lvl(json!("abc"), json!("1")),
            vec![json!("100")],
            lvl(json!("99"), json!(null)),
            lvl(json!("98"), json!("-1")),
            lvl(json!("97"), json!("2")),
        ];
        let side = normalise_side(&raw, BookSide::Bid);
        assert_eq!(side, vec![PriceLevel::new(dec!(97), dec!(2))]);
    }

    #[test]
    fn parse_level_reports_reason() {
        let err = parse_level(&vec![json!("x"), json!("1")]).unwrap_err();
        assert_eq!(err.reason, "price is not numeric");
    }

    #[test]
    fn trailing_fields_ignored() {
        let level = parse_level(&vec![json!("5.5"), json!("2"), json!("0"), json!("7")]).unwrap();
        assert_eq!(level, PriceLevel::new(dec!(5.5), dec!(2)));
    }

    #[test]
    fn book_prefers_venue_timestamp() {
        let fetched_at = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        let mut raw = RawOrderBook {
            bids: vec![lvl(json!("1"), json!("1"))],
            asks: vec![],
            timestamp_ms: Some(1_700_000_000_123),
        };
        let snap = normalise_book("okx", "BTC/USDT", &raw, fetched_at);
        assert_eq!(snap.observed_at.timestamp_millis(), 1_700_000_000_123);
        assert!(snap.asks.is_empty());

        raw.timestamp_ms = None;
        assert_eq!(normalise_book("okx", "BTC/USDT", &raw, fetched_at).observed_at, fetched_at);
    }

    proptest! {
        #[test]
        fn sides_are_sorted_unique_and_nonzero(
            entries in prop::collection::vec((1u32..500, 0u32..20), 0..60),
            bid in any::<bool>(),
        ) {
            let raw: Vec<RawLevel> = entries
                .iter()
                .map(|(p, s)| vec![json!(p.to_string()), json!(s.to_string())])
                .collect();
            let side = if bid { BookSide::Bid } else { BookSide::Ask };
            let out = normalise_side(&raw, side);
            for pair in out.windows(2) {
                match side {
                    BookSide::Bid => prop_assert!(pair[0].price > pair[1].price),
                    BookSide::Ask => prop_assert!(pair[0].price < pair[1].price),
                }
            }
            prop_assert!(out.iter().all(|l| !l.size.is_zero()));
        }
    }
}
