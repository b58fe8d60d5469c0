use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::market_data::types::{ExchangeEndpoint, OrderBookSnapshot, TopOfBook};
use crate::persist::types::{ObservationRecord, StoreError, StoreResult};
use crate::persist::StateStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orderbook_entries (
    id                BIGSERIAL PRIMARY KEY,
    symbol            TEXT NOT NULL,
    timestamp         TIMESTAMPTZ NOT NULL,
    bid_price         TEXT,
    bid_quantity      TEXT,
    ask_price         TEXT,
    ask_quantity      TEXT,
    exchange          TEXT NOT NULL,
    exchange_location TEXT,
    bids              TEXT NOT NULL,
    asks              TEXT NOT NULL
)
"#;

const INDEX: &str =
    "CREATE INDEX IF NOT EXISTS orderbook_entries_key ON orderbook_entries (symbol, exchange, id)";

/// Postgres-backed store. Ordering comes from the `BIGSERIAL` id, so
/// concurrent writers never need a process-wide lock.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    locations: Arc<HashMap<String, String>>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, endpoints: &[ExchangeEndpoint]) -> StoreResult<Self> {
        let pool = PgPoolOptions::new().max_connections(8).connect(database_url).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        sqlx::query(INDEX).execute(&pool).await?;
        info!("connected postgres store");
        let locations = endpoints.iter().map(|e| (e.id.clone(), e.location.clone())).collect();
        Ok(Self { pool, locations: Arc::new(locations) })
    }
}

fn decimal_col(row: &PgRow, id: i64, col: &str) -> StoreResult<Option<Decimal>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| StoreError::Corrupt { id, reason: e.to_string() }))
        .transpose()
}

fn record_from_row(row: &PgRow) -> StoreResult<ObservationRecord> {
    let id: i64 = row.try_get("id")?;
    Ok(ObservationRecord {
        id,
        symbol: row.try_get("symbol")?,
        timestamp: row.try_get("timestamp")?,
        bid_price: decimal_col(row, id, "bid_price")?,
        bid_quantity: decimal_col(row, id, "bid_quantity")?,
        ask_price: decimal_col(row, id, "ask_price")?,
        ask_quantity: decimal_col(row, id, "ask_quantity")?,
        exchange: row.try_get("exchange")?,
        exchange_location: row.try_get("exchange_location")?,
        bids: row.try_get("bids")?,
        asks: row.try_get("asks")?,
    })
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn append(&self, snapshot: &OrderBookSnapshot) -> StoreResult<()> {
        let location = self.locations.get(&snapshot.exchange).map(String::as_str);
        let rec = ObservationRecord::from_snapshot(snapshot, location)?;
        sqlx::query(
            r#"
            INSERT INTO orderbook_entries
                (symbol, timestamp, bid_price, bid_quantity, ask_price, ask_quantity,
                 exchange, exchange_location, bids, asks)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&rec.symbol)
        .bind(rec.timestamp)
        .bind(rec.bid_price.map(|d| d.to_string()))
        .bind(rec.bid_quantity.map(|d| d.to_string()))
        .bind(rec.ask_price.map(|d| d.to_string()))
        .bind(rec.ask_quantity.map(|d| d.to_string()))
        .bind(&rec.exchange)
        .bind(&rec.exchange_location)
        .bind(&rec.bids)
        .bind(&rec.asks)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_per_exchange(&self, symbol: &str) -> StoreResult<BTreeMap<String, TopOfBook>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (exchange) *
            FROM orderbook_entries
            WHERE symbol = $1
            ORDER BY exchange, id DESC
            "#,
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in &rows {
            let rec = record_from_row(row)?;
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
    }

    async fn latest(&self, symbol: &str, exchange: &str) -> StoreResult<Option<OrderBookSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM orderbook_entries
            WHERE symbol = $1 AND exchange = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(exchange)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| record_from_row(&r)?.into_snapshot()).transpose()
    }
}
