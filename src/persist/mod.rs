pub mod types;
pub use types::*;
pub mod codec;
pub mod memory;
pub mod postgres;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::market_data::types::{OrderBookSnapshot, TopOfBook};

/// The single write path and source of truth for observed books.
///
/// `append` is durable once it returns `Ok`. Reads see every append that
/// completed before the read started. "Latest" always means last appended
/// for the (symbol, exchange) key, never the largest `observed_at`, so
/// writers with skewed clocks cannot reorder each other.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn append(&self, snapshot: &OrderBookSnapshot) -> StoreResult<()>;

    /// Most recent top-of-book for every exchange that has reported `symbol`.
    async fn latest_per_exchange(&self, symbol: &str) -> StoreResult<BTreeMap<String, TopOfBook>>;

    /// Full depth of the most recent observation for one pair.
    async fn latest(&self, symbol: &str, exchange: &str) -> StoreResult<Option<OrderBookSnapshot>>;
}

/// Append for the ingest paths: a store failure is logged and counted,
/// never propagated, so one bad write cannot stop polling or streaming.
pub async fn append_or_log(store: &dyn StateStore, snapshot: &OrderBookSnapshot) -> bool {
    match store.append(snapshot).await {
        Ok(()) => {
            metrics::counter!("depthwatch_store_append_total", "outcome" => "ok").increment(1);
            true
        }
        Err(e) => {
            metrics::counter!("depthwatch_store_append_total", "outcome" => "error").increment(1);
            tracing::error!(
                exchange = %snapshot.exchange,
                symbol = %snapshot.symbol,
                error = %e,
                "store append failed"
            );
            false
        }
    }
}
