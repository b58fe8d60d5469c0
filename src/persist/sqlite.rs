use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use tracing::info;

use crate::market_data::types::{ExchangeEndpoint, OrderBookSnapshot, TopOfBook};
use crate::persist::types::{ObservationRecord, StoreError, StoreResult, TABLE};
use crate::persist::StateStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orderbook_entries (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol            TEXT NOT NULL,
    timestamp         TEXT NOT NULL,
    bid_price         TEXT,
    bid_quantity      TEXT,
    ask_price         TEXT,
    ask_quantity      TEXT,
    exchange          TEXT NOT NULL,
    exchange_location TEXT,
    bids              TEXT NOT NULL,
    asks              TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS orderbook_entries_key ON orderbook_entries (symbol, exchange, id);
"#;

/// SQLite-backed store.
///
/// One connection behind one mutex: every write in the process is
/// serialised. Fine at a few dozen appends per second; beyond that the
/// Postgres store is the one to use.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    locations: Arc<HashMap<String, String>>,
}

impl SqliteStore {
    pub fn open(path: &str, endpoints: &[ExchangeEndpoint]) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        info!(path, "opened sqlite store");
        Self::init(conn, endpoints)
    }

    pub fn open_in_memory(endpoints: &[ExchangeEndpoint]) -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, endpoints)
    }

    fn init(conn: Connection, endpoints: &[ExchangeEndpoint]) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        let locations = endpoints.iter().map(|e| (e.id.clone(), e.location.clone())).collect();
        Ok(Self { conn: Arc::new(Mutex::new(conn)), locations: Arc::new(locations) })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

fn dec_to_sql(d: Option<Decimal>) -> Option<String> {
    d.map(|d| d.to_string())
}

fn dec_from_sql(id: i64, s: Option<String>) -> StoreResult<Option<Decimal>> {
    s.map(|s| Decimal::from_str(&s).map_err(|e| StoreError::Corrupt { id, reason: e.to_string() }))
        .transpose()
}

fn ts_from_sql(id: i64, s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt { id, reason: e.to_string() })
}

struct RawRow {
    id: i64,
    symbol: String,
    timestamp: String,
    bid_price: Option<String>,
    bid_quantity: Option<String>,
    ask_price: Option<String>,
    ask_quantity: Option<String>,
    exchange: String,
    exchange_location: Option<String>,
    bids: String,
    asks: String,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            symbol: row.get("symbol")?,
            timestamp: row.get("timestamp")?,
            bid_price: row.get("bid_price")?,
            bid_quantity: row.get("bid_quantity")?,
            ask_price: row.get("ask_price")?,
            ask_quantity: row.get("ask_quantity")?,
            exchange: row.get("exchange")?,
            exchange_location: row.get("exchange_location")?,
            bids: row.get("bids")?,
            asks: row.get("asks")?,
        })
    }

    fn into_record(self) -> StoreResult<ObservationRecord> {
        let id = self.id;
        Ok(ObservationRecord {
            id,
            symbol: self.symbol,
            timestamp: ts_from_sql(id, &self.timestamp)?,
            bid_price: dec_from_sql(id, self.bid_price)?,
            bid_quantity: dec_from_sql(id, self.bid_quantity)?,
            ask_price: dec_from_sql(id, self.ask_price)?,
            ask_quantity: dec_from_sql(id, self.ask_quantity)?,
            exchange: self.exchange,
            exchange_location: self.exchange_location,
            bids: self.bids,
            asks: self.asks,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn append(&self, snapshot: &OrderBookSnapshot) -> StoreResult<()> {
        let location = self.locations.get(&snapshot.exchange).map(String::as_str);
        let rec = ObservationRecord::from_snapshot(snapshot, location)?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {TABLE} (symbol, timestamp, bid_price, bid_quantity, ask_price, ask_quantity, \
                     exchange, exchange_location, bids, asks) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    rec.symbol,
                    rec.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                    dec_to_sql(rec.bid_price),
                    dec_to_sql(rec.bid_quantity),
                    dec_to_sql(rec.ask_price),
                    dec_to_sql(rec.ask_quantity),
                    rec.exchange,
                    rec.exchange_location,
                    rec.bids,
                    rec.asks,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn latest_per_exchange(&self, symbol: &str) -> StoreResult<BTreeMap<String, TopOfBook>> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT * FROM {TABLE} WHERE id IN \
                 (SELECT MAX(id) FROM {TABLE} WHERE symbol = ?1 GROUP BY exchange)"
            ))?;
            let rows = stmt.query_map(params![symbol], RawRow::read)?;
            let mut out = BTreeMap::new();
            for row in rows {
                let rec = row?.into_record()?;
                out.insert(
                    rec.exchange,
                    TopOfBook {
                        bid_price: rec.bid_price,
                        bid_size: rec.bid_quantity,
                        ask_price: rec.ask_price,
                        ask_size: rec.ask_quantity,
                        observed_at: rec.timestamp,
                    },
                );
            }
            Ok(out)
        })
        .await
    }

    async fn latest(&self, symbol: &str, exchange: &str) -> StoreResult<Option<OrderBookSnapshot>> {
        let (symbol, exchange) = (symbol.to_string(), exchange.to_string());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT * FROM {TABLE} WHERE symbol = ?1 AND exchange = ?2 ORDER BY id DESC LIMIT 1"),
                    params![symbol, exchange],
                    RawRow::read,
                )
                .optional()?;
            row.map(|r| r.into_record()?.into_snapshot()).transpose()
        })
        .await
    }
}
