// Source: wss://ws-feed.exchange.coinbase.com (channel "level2")
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market_data::types::RawLevel;

// Outbound subscribe request, auth fields inline
#[derive(Debug, Serialize)]
pub struct WsSubscribe {
    #[serde(rename = "type")]
    pub kind: &'static str, // always "subscribe"
    pub product_ids: Vec<String>, // e.g. "BTC-USDT"
    pub channels: Vec<String>,
    pub signature: String,
    pub key: String,
    pub timestamp: String,
}

// Inbound messages, discriminated by "type"
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "snapshot")]
    Snapshot {
        product_id: String,
        bids: Vec<RawLevel>, // [price, size]
        asks: Vec<RawLevel>,
    },
    #[serde(rename = "l2update")]
    L2Update {
        product_id: String,
        changes: Vec<RawLevel>, // [side, price, size]
        #[serde(default)]
        time: Option<DateTime<Utc>>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default)]
        reason: Option<String>,
    },
    // subscriptions, heartbeat, ticker, ...
    #[serde(other)]
    Other,
}
