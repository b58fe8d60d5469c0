use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One [price, size] entry as it came off the wire. Venues send strings,
/// numbers, or longer arrays (order counts, timestamps); only the first two
/// entries are read.
pub type RawLevel = Vec<serde_json::Value>;

/// Venue-native depth payload before normalisation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOrderBook {
    pub bids: Vec<RawLevel>,
    pub asks: Vec<RawLevel>,
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    /// Coinbase-style side tags: "buy" hits the bid side, "sell" the ask side.
    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "buy" | "bid" => Some(BookSide::Bid),
            "sell" | "ask" => Some(BookSide::Ask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Levels for one side, unique by price. Bids descend, asks ascend.
pub type OrderBookSide = Vec<PriceLevel>;

/// Immutable observation of one (exchange, symbol) book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub exchange: String,
    pub symbol: String,
    pub observed_at: DateTime<Utc>,
    pub bids: OrderBookSide,
    pub asks: OrderBookSide,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn top_of_book(&self) -> TopOfBook {
        TopOfBook {
            bid_price: self.best_bid().map(|l| l.price),
            bid_size: self.best_bid().map(|l| l.size),
            ask_price: self.best_ask().map(|l| l.price),
            ask_size: self.best_ask().map(|l| l.size),
            observed_at: self.observed_at,
        }
    }
}

/// Best bid/ask summary served per exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopOfBook {
    pub bid_price: Option<Decimal>,
    pub bid_size: Option<Decimal>,
    pub ask_price: Option<Decimal>,
    pub ask_size: Option<Decimal>,
    pub observed_at: DateTime<Utc>,
}

/// Static description of a venue. Read-only after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEndpoint {
    pub id: String,
    pub display_name: String,
    pub location: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    /// Overrides the venue's public REST base URL.
    #[serde(default)]
    pub rest_url: Option<String>,
}

/// "BTC/USDT" -> ("BTC", "USDT").
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (base, quote) = symbol.split_once('/')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn top_of_book_reads_first_levels() {
        let snap = OrderBookSnapshot {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            observed_at: Utc::now(),
            bids: vec![PriceLevel::new(dec!(100), dec!(1)), PriceLevel::new(dec!(99), dec!(2))],
            asks: vec![],
        };
        let top = snap.top_of_book();
        assert_eq!(top.bid_price, Some(dec!(100)));
        assert_eq!(top.bid_size, Some(dec!(1)));
        assert_eq!(top.ask_price, None);
    }

    #[test]
    fn split_symbol_rejects_missing_quote() {
        assert_eq!(split_symbol("ETH/USDC"), Some(("ETH", "USDC")));
        assert_eq!(split_symbol("ETH"), None);
        assert_eq!(split_symbol("ETH/"), None);
    }
}
