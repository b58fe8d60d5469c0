// Shared trait + registry for venue adapters

use std::collections::HashMap;
use std::sync::Arc;

use crate::market_data::types::{ExchangeEndpoint, RawOrderBook};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("exchange rejected request: {0}")]
    Exchange(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("symbol {0} not listed")]
    UnsupportedSymbol(String),
}

impl FetchError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Http(_) => "http",
            FetchError::Status { .. } => "status",
            FetchError::Decode(_) => "decode",
            FetchError::Exchange(_) => "exchange",
            FetchError::Timeout(_) => "timeout",
            FetchError::UnsupportedSymbol(_) => "unsupported_symbol",
        }
    }
}

/// One venue's "fetch current book" capability. Each implementation owns its
/// own client and is responsible for its own rate limiting.
#[async_trait::async_trait]
pub trait OrderBookFetcher: Send + Sync {
    fn exchange_id(&self) -> &str;

    async fn fetch_order_book(&self, symbol: &str) -> Result<RawOrderBook, FetchError>;
}

pub type FetcherFactory =
    Arc<dyn Fn(&ExchangeEndpoint, reqwest::Client, u32) -> Arc<dyn OrderBookFetcher> + Send + Sync>;

/// Exchange id -> adapter constructor, populated once at startup.
#[derive(Default, Clone)]
pub struct ExchangeRegistry {
    factories: HashMap<String, FetcherFactory>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every venue this crate ships an adapter for.
    pub fn with_builtin_venues() -> Self {
        let mut registry = Self::new();
        for venue in rest::RestVenue::ALL {
            registry.register(venue.id(), move |endpoint, client, depth| {
                rest::RestFetcher::shared(venue, endpoint, client, depth)
            });
        }
        registry
    }

    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&ExchangeEndpoint, reqwest::Client, u32) -> Arc<dyn OrderBookFetcher> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Build adapters for the configured endpoints. Unknown ids are logged
    /// and left out.
    pub fn build(
        &self,
        endpoints: &[ExchangeEndpoint],
        client: &reqwest::Client,
        depth_limit: u32,
    ) -> Vec<Arc<dyn OrderBookFetcher>> {
        endpoints
            .iter()
            .filter_map(|endpoint| match self.factories.get(&endpoint.id) {
                Some(factory) => Some(factory(endpoint, client.clone(), depth_limit)),
                None => {
                    tracing::warn!(exchange = %endpoint.id, "no adapter registered, skipping");
                    None
                }
            })
            .collect()
    }
}

pub mod coinbase;
pub mod coinbase_types;
pub mod rest;
pub mod venue_types;

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> ExchangeEndpoint {
        ExchangeEndpoint {
            id: id.into(),
            display_name: id.into(),
            location: "Nowhere".into(),
            lat: 0.0,
            lon: 0.0,
            rest_url: None,
        }
    }

    #[test]
    fn builtin_registry_skips_unknown_ids() {
        let registry = ExchangeRegistry::with_builtin_venues();
        assert!(registry.contains("binance"));
        assert!(registry.contains("bitfinex"));
        let built = registry.build(&[endpoint("binance"), endpoint("nope")], &reqwest::Client::new(), 50);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].exchange_id(), "binance");
    }
}
