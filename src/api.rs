// Read-only HTTP surface over the store, plus the push channel as SSE.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::Stream;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::market_data::types::{ExchangeEndpoint, OrderBookSide, OrderBookSnapshot};
use crate::persist::{StateStore, StoreError};
use crate::push::{QuoteView, WatchListUpdate, EVENT_NAME};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn StateStore>,
    /// Appended to bare tokens: `BTC` -> `BTC/{quote}`.
    pub quote: String,
    pub exchanges: Arc<Vec<ExchangeEndpoint>>,
    pub updates: broadcast::Sender<Arc<WatchListUpdate>>,
}

pub enum ApiError {
    NotFound { symbol: String, exchange: String },
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound { symbol, exchange } => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": format!("No data found for {symbol} on {exchange}"),
                    "symbol": symbol,
                    "exchange": exchange,
                })),
            )
                .into_response(),
            ApiError::Store(e) => {
                error!(error = %e, "store query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookView {
    pub symbol: String,
    pub exchange: String,
    pub timestamp: DateTime<Utc>,
    pub bids: Vec<[Decimal; 2]>,
    pub asks: Vec<[Decimal; 2]>,
}

fn side_view(side: &OrderBookSide) -> Vec<[Decimal; 2]> {
    side.iter().map(|l| [l.price, l.size]).collect()
}

impl From<OrderBookSnapshot> for BookView {
    fn from(snap: OrderBookSnapshot) -> Self {
        Self {
            bids: side_view(&snap.bids),
            asks: side_view(&snap.asks),
            timestamp: snap.observed_at,
            symbol: snap.symbol,
            exchange: snap.exchange,
        }
    }
}

/// `btc` -> `BTC/USDT`, `eth-usd` -> `ETH/USD`.
pub fn canonical_symbol(raw: &str, default_quote: &str) -> String {
    let upper = raw.trim().to_uppercase().replace('-', "/");
    if upper.contains('/') {
        upper
    } else {
        format!("{upper}/{}", default_quote.to_uppercase())
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/exchanges", get(list_exchanges))
        .route("/api/orderbook/:symbol", get(orderbook_summary))
        .route("/api/orderbook/:base/:quote/:exchange", get(orderbook_detail))
        .route("/api/stream", get(stream_updates))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_exchanges(State(state): State<ApiState>) -> Json<Vec<ExchangeEndpoint>> {
    Json(state.exchanges.as_ref().clone())
}

async fn orderbook_summary(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
) -> Result<Json<BTreeMap<String, QuoteView>>, ApiError> {
    let symbol = canonical_symbol(&symbol, &state.quote);
    let latest = state.store.latest_per_exchange(&symbol).await?;
    Ok(Json(latest.iter().map(|(exchange, top)| (exchange.clone(), QuoteView::from(top))).collect()))
}

async fn orderbook_detail(
    State(state): State<ApiState>,
    Path((base, quote, exchange)): Path<(String, String, String)>,
) -> Result<Json<BookView>, ApiError> {
    let symbol = format!("{}/{}", base.to_uppercase(), quote.to_uppercase());
    match state.store.latest(&symbol, &exchange).await? {
        Some(snap) => Ok(Json(BookView::from(snap))),
        None => Err(ApiError::NotFound { symbol, exchange }),
    }
}

async fn stream_updates(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.updates.subscribe();
    let events = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(update) => match Event::default().event(EVENT_NAME).json_data(&*update) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => warn!(error = %e, "could not encode update"),
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "viewer lagging, dropped updates"),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
