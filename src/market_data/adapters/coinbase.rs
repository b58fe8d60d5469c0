// Coinbase Exchange level2 websocket: framing + tokio-tungstenite transport

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::coinbase_types::{WsMessage, WsSubscribe};
use crate::market_data::auth::SignedAuth;
use crate::market_data::reconstructor::BookEvent;
use crate::market_data::session::{FeedMessage, StreamConnector, StreamError, StreamProtocol, StreamTransport};

/// "BTC/USDT" -> "BTC-USDT"
pub fn product_id(symbol: &str) -> String {
    symbol.replace('/', "-")
}

/// "BTC-USDT" -> "BTC/USDT"
pub fn symbol_for(product_id: &str) -> String {
    product_id.replace('-', "/")
}

pub struct CoinbaseProtocol {
    exchange: String,
    channel: String,
}

impl CoinbaseProtocol {
    pub fn new(exchange: &str, channel: &str) -> Self {
        Self { exchange: exchange.to_string(), channel: channel.to_string() }
    }
}

impl StreamProtocol for CoinbaseProtocol {
    fn exchange_id(&self) -> &str {
        &self.exchange
    }

    fn subscribe_message(&self, symbols: &[String], auth: &SignedAuth) -> Result<String, StreamError> {
        let msg = WsSubscribe {
            kind: "subscribe",
            product_ids: symbols.iter().map(|s| product_id(s)).collect(),
            channels: vec![self.channel.clone()],
            signature: auth.signature.clone(),
            key: auth.key.clone(),
            timestamp: auth.timestamp.clone(),
        };
        serde_json::to_string(&msg).map_err(|e| StreamError::Malformed(e.to_string()))
    }

    fn decode(&self, text: &str) -> Result<FeedMessage, StreamError> {
        let msg: WsMessage = serde_json::from_str(text).map_err(|e| StreamError::Malformed(e.to_string()))?;
        Ok(match msg {
            WsMessage::Snapshot { product_id, bids, asks } => FeedMessage::Book {
                event: BookEvent::Snapshot { symbol: symbol_for(&product_id), bids, asks },
                time: None,
            },
            WsMessage::L2Update { product_id, changes, time } => FeedMessage::Book {
                event: BookEvent::Diff { symbol: symbol_for(&product_id), changes },
                time,
            },
            WsMessage::Error { message, reason } => {
                let detail = match reason {
                    Some(reason) => format!("{message}: {reason}"),
                    None => message,
                };
                return Err(StreamError::Remote(detail));
            }
            WsMessage::Other => FeedMessage::Ignored,
        })
    }
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string() }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, StreamError> {
        let (ws, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        tracing::debug!(url = %self.url, status = %response.status(), "websocket connected");
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| StreamError::Read(format!("send: {e}")))
    }

    async fn receive(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            match self.ws.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map(Some)
                        .map_err(|e| StreamError::Malformed(e.to_string()));
                }
                // pings are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(StreamError::Read(e.to_string())),
            }
        }
    }
}
