// Public depth payloads, one struct per venue family.
// Levels stay as raw JSON values; the normaliser owns numeric parsing.

use serde::Deserialize;
use serde_json::Value;

use crate::market_data::types::{RawLevel, RawOrderBook};

// Binance / MEXC: GET /api/v3/depth
#[derive(Debug, Deserialize)]
pub struct BinanceDepth {
    pub bids: Vec<RawLevel>,
    pub asks: Vec<RawLevel>,
    #[serde(default)]
    pub timestamp: Option<i64>, // MEXC only
}

// OKX: GET /api/v5/market/books
#[derive(Debug, Deserialize)]
pub struct OkxResponse {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Vec<OkxBook>,
}

#[derive(Debug, Deserialize)]
pub struct OkxBook {
    pub bids: Vec<RawLevel>, // [px, sz, "0", numOrders]
    pub asks: Vec<RawLevel>,
    pub ts: String, // epoch ms as string
}

// KuCoin: GET /api/v1/market/orderbook/level2_100
#[derive(Debug, Deserialize)]
pub struct KucoinResponse {
    pub code: String,
    #[serde(default)]
    pub msg: Option<String>,
    pub data: Option<KucoinBook>,
}

#[derive(Debug, Deserialize)]
pub struct KucoinBook {
    pub time: i64,
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}

// Bybit: GET /v5/market/orderbook
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitResponse {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    pub result: Option<BybitBook>,
}

#[derive(Debug, Deserialize)]
pub struct BybitBook {
    #[serde(default)]
    pub b: Vec<RawLevel>,
    #[serde(default)]
    pub a: Vec<RawLevel>,
    #[serde(default)]
    pub ts: i64,
}

// Gate: GET /api/v4/spot/order_book
#[derive(Debug, Deserialize)]
pub struct GateBook {
    pub current: Option<i64>,
    pub bids: Vec<RawLevel>,
    pub asks: Vec<RawLevel>,
}

// Coinbase Exchange: GET /products/{id}/book?level=2
#[derive(Debug, Deserialize)]
pub struct CoinbaseBook {
    pub bids: Vec<RawLevel>, // [price, size, num_orders]
    pub asks: Vec<RawLevel>,
    #[serde(default)]
    pub time: Option<chrono::DateTime<chrono::Utc>>,
}

// Kraken: GET /0/public/Depth, result keyed by Kraken's own pair name
#[derive(Debug, Deserialize)]
pub struct KrakenResponse {
    #[serde(default)]
    pub error: Vec<String>,
    #[serde(default)]
    pub result: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct KrakenBook {
    pub bids: Vec<RawLevel>, // [price, volume, timestamp]
    pub asks: Vec<RawLevel>,
}

// Huobi / HTX: GET /market/depth
#[derive(Debug, Deserialize)]
pub struct HuobiResponse {
    pub status: String,
    #[serde(rename = "err-msg", default)]
    pub err_msg: Option<String>,
    pub ts: Option<i64>,
    pub tick: Option<HuobiBook>,
}

#[derive(Debug, Deserialize)]
pub struct HuobiBook {
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}

// Bitfinex v2: GET /v2/book/{symbol}/P0 -> [[price, count, amount]],
// positive amount = bid, negative = ask.
pub type BitfinexBook = Vec<Vec<Value>>;

pub fn bitfinex_to_raw(rows: BitfinexBook) -> RawOrderBook {
    let mut book = RawOrderBook::default();
    for row in rows {
        let (Some(price), Some(amount)) = (row.first(), row.get(2)) else {
            // a one-field level never parses, so the normaliser reports it
            book.bids.push(vec![Value::Array(row)]);
            continue;
        };
        let amount_text = match amount {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => {
                book.bids.push(vec![Value::Array(row)]);
                continue;
            }
        };
        match amount_text.strip_prefix('-') {
            Some(abs) => book.asks.push(vec![price.clone(), Value::String(abs.to_string())]),
            None => book.bids.push(vec![price.clone(), Value::String(amount_text)]),
        }
    }
    book
}
