use rust_decimal::Decimal;

use crate::market_data::types::{OrderBookSide, PriceLevel};
use crate::persist::types::{StoreError, StoreResult};

/// Depth column format: `[["price","size"], ...]`, decimals as strings so
/// nothing is lost to float rounding.
pub fn side_to_json(side: &OrderBookSide) -> StoreResult<String> {
    let pairs: Vec<(Decimal, Decimal)> = side.iter().map(|l| (l.price, l.size)).collect();
    serde_json::to_string(&pairs).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Parse a depth column read back from the DB.
pub fn side_from_json(s: &str) -> Result<OrderBookSide, serde_json::Error> {
    let pairs: Vec<(Decimal, Decimal)> = serde_json::from_str(s)?;
    Ok(pairs.into_iter().map(|(price, size)| PriceLevel::new(price, size)).collect())
}
