use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::market_data::types::OrderBookSnapshot;
use crate::persist::codec;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub const TABLE: &str = "orderbook_entries";

/// One persisted observation, flattened to the table's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRecord {
    pub id: i64,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub bid_price: Option<Decimal>,
    pub bid_quantity: Option<Decimal>,
    pub ask_price: Option<Decimal>,
    pub ask_quantity: Option<Decimal>,
    pub exchange: String,
    pub exchange_location: Option<String>,
    pub bids: String, // JSON [[price, size], ...]
    pub asks: String,
}

impl ObservationRecord {
    /// `id` is left at 0; the database assigns it.
    pub fn from_snapshot(snap: &OrderBookSnapshot, location: Option<&str>) -> StoreResult<Self> {
        let top = snap.top_of_book();
        Ok(Self {
            id: 0,
            symbol: snap.symbol.clone(),
            timestamp: snap.observed_at,
            bid_price: top.bid_price,
            bid_quantity: top.bid_size,
            ask_price: top.ask_price,
            ask_quantity: top.ask_size,
            exchange: snap.exchange.clone(),
            exchange_location: location.map(str::to_string),
            bids: codec::side_to_json(&snap.bids)?,
            asks: codec::side_to_json(&snap.asks)?,
        })
    }

    pub fn into_snapshot(self) -> StoreResult<OrderBookSnapshot> {
        let id = self.id;
        let corrupt = move |reason: String| StoreError::Corrupt { id, reason };
        let bids = codec::side_from_json(&self.bids).map_err(|e| corrupt(e.to_string()))?;
        let asks = codec::side_from_json(&self.asks).map_err(|e| corrupt(e.to_string()))?;
        Ok(OrderBookSnapshot {
            exchange: self.exchange,
            symbol: self.symbol,
            observed_at: self.timestamp,
            bids,
            asks,
        })
    }
}
