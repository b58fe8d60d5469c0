// Public REST depth adapters. One fetcher type, parameterised by venue.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::venue_types::*;
use super::{FetchError, OrderBookFetcher};
use crate::market_data::types::{split_symbol, ExchangeEndpoint, RawOrderBook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestVenue {
    Binance,
    Mexc,
    Okx,
    Kucoin,
    Bybit,
    Gate,
    Coinbase,
    Kraken,
    Huobi,
    Bitfinex,
}

impl RestVenue {
    pub const ALL: [RestVenue; 10] = [
        RestVenue::Binance,
        RestVenue::Mexc,
        RestVenue::Okx,
        RestVenue::Kucoin,
        RestVenue::Bybit,
        RestVenue::Gate,
        RestVenue::Coinbase,
        RestVenue::Kraken,
        RestVenue::Huobi,
        RestVenue::Bitfinex,
    ];

    pub fn id(self) -> &'static str {
        match self {
            RestVenue::Binance => "binance",
            RestVenue::Mexc => "mexc",
            RestVenue::Okx => "okx",
            RestVenue::Kucoin => "kucoin",
            RestVenue::Bybit => "bybit",
            RestVenue::Gate => "gate",
            RestVenue::Coinbase => "coinbase",
            RestVenue::Kraken => "kraken",
            RestVenue::Huobi => "huobi",
            RestVenue::Bitfinex => "bitfinex",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            RestVenue::Binance => "https://api.binance.com",
            RestVenue::Mexc => "https://api.mexc.com",
            RestVenue::Okx => "https://www.okx.com",
            RestVenue::Kucoin => "https://api.kucoin.com",
            RestVenue::Bybit => "https://api.bybit.com",
            RestVenue::Gate => "https://api.gateio.ws",
            RestVenue::Coinbase => "https://api.exchange.coinbase.com",
            RestVenue::Kraken => "https://api.kraken.com",
            RestVenue::Huobi => "https://api.huobi.pro",
            RestVenue::Bitfinex => "https://api-pub.bitfinex.com",
        }
    }

    /// Canonical "BASE/QUOTE" -> venue-native market name.
    pub fn native_symbol(self, symbol: &str) -> Result<String, FetchError> {
        let (base, quote) = split_symbol(symbol).ok_or_else(|| FetchError::UnsupportedSymbol(symbol.to_string()))?;
        let (base, quote) = (base.to_uppercase(), quote.to_uppercase());
        Ok(match self {
            RestVenue::Binance | RestVenue::Mexc | RestVenue::Bybit => format!("{base}{quote}"),
            RestVenue::Okx | RestVenue::Kucoin | RestVenue::Coinbase => format!("{base}-{quote}"),
            RestVenue::Gate => format!("{base}_{quote}"),
            RestVenue::Huobi => format!("{base}{quote}").to_lowercase(),
            RestVenue::Kraken => {
                let base = match base.as_str() {
                    "BTC" => "XBT".to_string(),
                    "DOGE" => "XDG".to_string(),
                    _ => base,
                };
                format!("{base}{quote}")
            }
            RestVenue::Bitfinex => {
                let quote = if quote == "USDT" { "UST".to_string() } else { quote };
                if base.len() > 3 || quote.len() > 3 {
                    format!("t{base}:{quote}")
                } else {
                    format!("t{base}{quote}")
                }
            }
        })
    }

    pub fn depth_path(self, native: &str, limit: u32) -> String {
        match self {
            RestVenue::Binance | RestVenue::Mexc => format!("/api/v3/depth?symbol={native}&limit={}", limit.min(5000)),
            RestVenue::Okx => format!("/api/v5/market/books?instId={native}&sz={}", limit.min(400)),
            RestVenue::Kucoin => {
                let depth = if limit <= 20 { 20 } else { 100 };
                format!("/api/v1/market/orderbook/level2_{depth}?symbol={native}")
            }
            RestVenue::Bybit => format!("/v5/market/orderbook?category=spot&symbol={native}&limit={}", limit.min(200)),
            RestVenue::Gate => format!("/api/v4/spot/order_book?currency_pair={native}&limit={}", limit.min(1000)),
            RestVenue::Coinbase => format!("/products/{native}/book?level=2"),
            RestVenue::Kraken => format!("/0/public/Depth?pair={native}&count={}", limit.min(500)),
            RestVenue::Huobi => format!("/market/depth?symbol={native}&type=step0"),
            RestVenue::Bitfinex => {
                let len = match limit {
                    0..=1 => 1,
                    2..=25 => 25,
                    26..=100 => 100,
                    _ => 250,
                };
                format!("/v2/book/{native}/P0?len={len}")
            }
        }
    }

    /// Decode a successful response body into venue-neutral raw depth.
    pub fn decode(self, body: &str) -> Result<RawOrderBook, FetchError> {
        let decode_err = |e: serde_json::Error| FetchError::Decode(e.to_string());
        match self {
            RestVenue::Binance | RestVenue::Mexc => {
                let d: BinanceDepth = serde_json::from_str(body).map_err(decode_err)?;
                Ok(RawOrderBook { bids: d.bids, asks: d.asks, timestamp_ms: d.timestamp })
            }
            RestVenue::Okx => {
                let r: OkxResponse = serde_json::from_str(body).map_err(decode_err)?;
                if r.code != "0" {
                    return Err(FetchError::Exchange(format!("{}: {}", r.code, r.msg)));
                }
                let book = r.data.into_iter().next().ok_or_else(|| FetchError::Decode("empty data".into()))?;
                Ok(RawOrderBook { bids: book.bids, asks: book.asks, timestamp_ms: book.ts.parse().ok() })
            }
            RestVenue::Kucoin => {
                let r: KucoinResponse = serde_json::from_str(body).map_err(decode_err)?;
                match (r.code.as_str(), r.data) {
                    ("200000", Some(book)) => Ok(RawOrderBook { bids: book.bids, asks: book.asks, timestamp_ms: Some(book.time) }),
                    (code, _) => Err(FetchError::Exchange(format!("{code}: {}", r.msg.unwrap_or_default()))),
                }
            }
            RestVenue::Bybit => {
                let r: BybitResponse = serde_json::from_str(body).map_err(decode_err)?;
                match (r.ret_code, r.result) {
                    (0, Some(book)) => Ok(RawOrderBook { bids: book.b, asks: book.a, timestamp_ms: Some(book.ts) }),
                    (code, _) => Err(FetchError::Exchange(format!("{code}: {}", r.ret_msg))),
                }
            }
            RestVenue::Gate => {
                let d: GateBook = serde_json::from_str(body).map_err(decode_err)?;
                Ok(RawOrderBook { bids: d.bids, asks: d.asks, timestamp_ms: d.current })
            }
            RestVenue::Coinbase => {
                let d: CoinbaseBook = serde_json::from_str(body).map_err(decode_err)?;
                Ok(RawOrderBook { bids: d.bids, asks: d.asks, timestamp_ms: d.time.map(|t| t.timestamp_millis()) })
            }
            RestVenue::Kraken => {
                let r: KrakenResponse = serde_json::from_str(body).map_err(decode_err)?;
                if !r.error.is_empty() {
                    return Err(FetchError::Exchange(r.error.join("; ")));
                }
                let (_, book) = r.result.into_iter().next().ok_or_else(|| FetchError::Decode("empty result".into()))?;
                let book: KrakenBook = serde_json::from_value(book).map_err(decode_err)?;
                Ok(RawOrderBook { bids: book.bids, asks: book.asks, timestamp_ms: None })
            }
            RestVenue::Huobi => {
                let r: HuobiResponse = serde_json::from_str(body).map_err(decode_err)?;
                match (r.status.as_str(), r.tick) {
                    ("ok", Some(book)) => Ok(RawOrderBook { bids: book.bids, asks: book.asks, timestamp_ms: r.ts }),
                    (status, _) => Err(FetchError::Exchange(format!("{status}: {}", r.err_msg.unwrap_or_default()))),
                }
            }
            RestVenue::Bitfinex => {
                let value: serde_json::Value = serde_json::from_str(body).map_err(decode_err)?;
                // Errors come back as ["error", code, message].
                if value.get(0).and_then(|v| v.as_str()) == Some("error") {
                    return Err(FetchError::Exchange(value.to_string()));
                }
                let rows: BitfinexBook = serde_json::from_value(value).map_err(decode_err)?;
                Ok(bitfinex_to_raw(rows))
            }
        }
    }
}

pub struct RestFetcher {
    venue: RestVenue,
    id: String,
    base_url: String,
    client: reqwest::Client,
    depth_limit: u32,
}

impl RestFetcher {
    pub fn new(venue: RestVenue, endpoint: &ExchangeEndpoint, client: reqwest::Client, depth_limit: u32) -> Self {
        let base_url = endpoint
            .rest_url
            .clone()
            .unwrap_or_else(|| venue.default_base_url().to_string());
        Self {
            venue,
            id: endpoint.id.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            depth_limit,
        }
    }

    pub fn shared(venue: RestVenue, endpoint: &ExchangeEndpoint, client: reqwest::Client, depth_limit: u32) -> Arc<dyn OrderBookFetcher> {
        Arc::new(Self::new(venue, endpoint, client, depth_limit))
    }

    pub fn url_for(&self, symbol: &str) -> Result<String, FetchError> {
        let native = self.venue.native_symbol(symbol)?;
        Ok(format!("{}{}", self.base_url, self.venue.depth_path(&native, self.depth_limit)))
    }
}

#[async_trait::async_trait]
impl OrderBookFetcher for RestFetcher {
    fn exchange_id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self), fields(exchange = %self.id))]
    async fn fetch_order_book(&self, symbol: &str) -> Result<RawOrderBook, FetchError> {
        let url = self.url_for(symbol)?;
        let res = self.client.get(&url).send().await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            let body = body.chars().take(256).collect();
            return Err(FetchError::Status { status: status.as_u16(), body });
        }
        let book = self.venue.decode(&body)?;
        debug!(bids = book.bids.len(), asks = book.asks.len(), "fetched depth");
        Ok(book)
    }
}
