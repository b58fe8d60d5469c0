// Periodic watch-list broadcast for connected viewers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::market_data::types::TopOfBook;
use crate::persist::{StateStore, StoreResult};

pub const EVENT_NAME: &str = "orderbook_update";

/// Top-of-book as shown to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuoteView {
    pub bid_price: Option<Decimal>,
    pub ask_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl From<&TopOfBook> for QuoteView {
    fn from(top: &TopOfBook) -> Self {
        Self { bid_price: top.bid_price, ask_price: top.ask_price, timestamp: top.observed_at }
    }
}

/// exchange -> token -> quote
pub type WatchListUpdate = BTreeMap<String, BTreeMap<String, QuoteView>>;

pub struct WatchListPublisher {
    store: Arc<dyn StateStore>,
    tokens: Vec<String>,
    quote: String,
    interval: Duration,
    tx: broadcast::Sender<Arc<WatchListUpdate>>,
}

impl WatchListPublisher {
    pub fn new(store: Arc<dyn StateStore>, tokens: Vec<String>, quote: String, interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { store, tokens, quote, interval, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<WatchListUpdate>> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<Arc<WatchListUpdate>> {
        self.tx.clone()
    }

    pub async fn collect(&self) -> StoreResult<WatchListUpdate> {
        let mut update = WatchListUpdate::new();
        for token in &self.tokens {
            let symbol = format!("{token}/{}", self.quote);
            for (exchange, top) in self.store.latest_per_exchange(&symbol).await? {
                update.entry(exchange).or_default().insert(token.clone(), QuoteView::from(&top));
            }
        }
        Ok(update)
    }

    /// Returns how many viewers received the update.
    pub async fn publish_once(&self) -> StoreResult<usize> {
        let update = self.collect().await?;
        // no receivers is not an error
        Ok(self.tx.send(Arc::new(update)).unwrap_or(0))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tokens = ?self.tokens, quote = %self.quote, interval = ?self.interval, "watch-list publisher starting");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            match self.publish_once().await {
                Ok(viewers) => debug!(viewers, "published watch-list update"),
                Err(e) => warn!(error = %e, "watch-list query failed"),
            }
        }
        info!("watch-list publisher stopped");
    }
}
