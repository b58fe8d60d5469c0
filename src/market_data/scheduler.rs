// Fixed-cadence REST polling over every (exchange, symbol) pair.
//
// Each cycle fans out one task per pair, waits for them until the cycle's
// deadline (start + interval), then sleeps out whatever is left of the
// interval. A pair whose previous fetch is still running is skipped rather
// than queued, so there is never more than one fetch in flight per pair.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::market_data::adapters::{FetchError, OrderBookFetcher};
use crate::market_data::normaliser::normalise_book;
use crate::persist::{append_or_log, StateStore};

type PairKey = (String, String);

/// Marks a pair busy for as long as its task holds the guard.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<PairKey>>>,
    key: PairKey,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<PairKey>>>, key: PairKey) -> Option<Self> {
        if set.lock().insert(key.clone()) {
            Some(Self { set: Arc::clone(set), key })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_in_flight: usize,
    /// Dispatched this cycle and not finished by the deadline.
    pub still_running: usize,
}

pub struct PollScheduler {
    fetchers: Vec<Arc<dyn OrderBookFetcher>>,
    symbols: Vec<String>,
    store: Arc<dyn StateStore>,
    interval: Duration,
    fetch_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<PairKey>>>,
}

impl PollScheduler {
    pub fn new(
        fetchers: Vec<Arc<dyn OrderBookFetcher>>,
        symbols: Vec<String>,
        store: Arc<dyn StateStore>,
        interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            fetchers,
            symbols,
            store,
            interval,
            fetch_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn pair_count(&self) -> usize {
        self.fetchers.len() * self.symbols.len()
    }

    /// One cycle, bounded by one interval from now.
    pub async fn run_cycle(&self) -> CycleReport {
        self.cycle(Instant::now() + self.interval).await
    }

    async fn cycle(&self, deadline: Instant) -> CycleReport {
        let mut report = CycleReport::default();
        let mut pending = FuturesUnordered::new();

        for fetcher in &self.fetchers {
            let exchange = fetcher.exchange_id().to_string();
            for symbol in &self.symbols {
                let Some(guard) = InFlightGuard::acquire(&self.in_flight, (exchange.clone(), symbol.clone())) else {
                    report.skipped_in_flight += 1;
                    metrics::counter!("depthwatch_poll_skipped_total", "exchange" => exchange.clone()).increment(1);
                    debug!(%exchange, %symbol, "previous fetch still running, skipping");
                    continue;
                };
                report.dispatched += 1;
                pending.push(tokio::spawn(poll_pair(
                    Arc::clone(fetcher),
                    symbol.clone(),
                    Arc::clone(&self.store),
                    self.fetch_timeout,
                    guard,
                )));
            }
        }

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(Ok(true))) => report.succeeded += 1,
                Ok(Some(Ok(false))) => report.failed += 1,
                Ok(Some(Err(e))) => {
                    report.failed += 1;
                    error!(error = %e, "poll task panicked");
                }
                Ok(None) => break,
                // dropping the JoinHandles detaches the stragglers; their
                // guards keep the pairs marked busy until they finish
                Err(_) => {
                    report.still_running = pending.len();
                    break;
                }
            }
        }
        report
    }

    /// Poll until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(pairs = self.pair_count(), interval = ?self.interval, "poll scheduler starting");
        while !*shutdown.borrow() {
            let deadline = Instant::now() + self.interval;
            tokio::select! {
                report = self.cycle(deadline) => {
                    debug!(?report, "poll cycle finished");
                    if report.still_running > 0 {
                        warn!(still_running = report.still_running, "poll cycle overran its interval");
                    }
                }
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("poll scheduler stopped");
    }
}

/// Fetch, normalise and store one pair. `true` when the observation was stored.
async fn poll_pair(
    fetcher: Arc<dyn OrderBookFetcher>,
    symbol: String,
    store: Arc<dyn StateStore>,
    timeout: Duration,
    _guard: InFlightGuard,
) -> bool {
    let exchange = fetcher.exchange_id().to_string();
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, fetcher.fetch_order_book(&symbol)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout)),
    };
    metrics::histogram!("depthwatch_fetch_seconds", "exchange" => exchange.clone())
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(raw) => {
            metrics::counter!("depthwatch_fetch_total", "exchange" => exchange.clone(), "outcome" => "ok").increment(1);
            let snapshot = normalise_book(&exchange, &symbol, &raw, Utc::now());
            append_or_log(store.as_ref(), &snapshot).await
        }
        Err(e) => {
            metrics::counter!("depthwatch_fetch_total", "exchange" => exchange.clone(), "outcome" => e.kind())
                .increment(1);
            warn!(%exchange, %symbol, error = %e, "fetch failed");
            false
        }
    }
}
