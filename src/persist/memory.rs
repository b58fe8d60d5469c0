use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::market_data::types::{OrderBookSnapshot, TopOfBook};
use crate::persist::{StateStore, StoreResult};

struct Slot {
    seq: u64,
    snapshot: OrderBookSnapshot,
}

type KeySlot = Arc<Mutex<Option<Slot>>>;

/// Process-local store that keeps only the latest observation per key.
///
/// Writers for the same (symbol, exchange) serialise on that key's mutex;
/// writers for different keys only share the outer read lock, which is
/// upgraded to a write lock the first time a key is seen.
#[derive(Default)]
pub struct MemoryStore {
    seq: AtomicU64,
    symbols: RwLock<HashMap<String, HashMap<String, KeySlot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, symbol: &str, exchange: &str) -> KeySlot {
        if let Some(slot) = self.symbols.read().get(symbol).and_then(|m| m.get(exchange)) {
            return Arc::clone(slot);
        }
        let mut symbols = self.symbols.write();
        Arc::clone(
            symbols
                .entry(symbol.to_string())
                .or_default()
                .entry(exchange.to_string())
                .or_default(),
        )
    }

    /// Total appends accepted so far.
    pub fn appended(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn append(&self, snapshot: &OrderBookSnapshot) -> StoreResult<()> {
        let slot = self.slot(&snapshot.symbol, &snapshot.exchange);
        let mut guard = slot.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        *guard = Some(Slot { seq, snapshot: snapshot.clone() });
        Ok(())
    }

    async fn latest_per_exchange(&self, symbol: &str) -> StoreResult<BTreeMap<String, TopOfBook>> {
        let symbols = self.symbols.read();
        let Some(exchanges) = symbols.get(symbol) else {
            return Ok(BTreeMap::new());
        };
        Ok(exchanges
            .iter()
            .filter_map(|(exchange, slot)| {
                slot.lock().as_ref().map(|s| (exchange.clone(), s.snapshot.top_of_book()))
            })
            .collect())
    }

    async fn latest(&self, symbol: &str, exchange: &str) -> StoreResult<Option<OrderBookSnapshot>> {
        let slot = {
            let symbols = self.symbols.read();
            match symbols.get(symbol).and_then(|m| m.get(exchange)) {
                Some(slot) => Arc::clone(slot),
                None => return Ok(None),
            }
        };
        let guard = slot.lock();
        Ok(guard.as_ref().map(|s| s.snapshot.clone()))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: usize = self.symbols.read().values().map(HashMap::len).sum();
        let newest = self
            .symbols
            .read()
            .values()
            .flat_map(|m| m.values())
            .filter_map(|slot| slot.lock().as_ref().map(|s| s.seq))
            .max();
        f.debug_struct("MemoryStore").field("keys", &keys).field("newest_seq", &newest).finish()
    }
}
