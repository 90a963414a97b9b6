//! Per-bot state file: enough to rebuild the order book and realized profit
//! after a crash. Decimals are serialized as strings to preserve precision
//! across the round trip.

use core_types::{GridOrderStatus, OrderSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedOrder {
    pub grid_index: i64,
    pub price: Decimal,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_id: Option<i64>,
    pub status: GridOrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub realized_profit: Decimal,
    pub last_price: Decimal,
    pub running: bool,
    /// Keyed by the canonical (trailing-zero-free) price string.
    pub orders: BTreeMap<String, PersistedOrder>,
}

/// Canonical key for one grid-line price: fixed value, no trailing zeros,
/// stable across serialisation round trips.
pub fn price_key(price: Decimal) -> String {
    price.normalize().to_string()
}

pub fn state_file_path(state_dir: &Path, bot_id: i64) -> PathBuf {
    state_dir.join(format!("bot_{}_grid.state.json", bot_id))
}

/// Writes the state file, creating the state directory on first use.
pub async fn save(path: &Path, state: &PersistedState) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_string_pretty(state)?;
    tokio::fs::write(path, payload).await
}

/// Reads the state file; `None` when no previous state exists.
pub async fn load(path: &Path) -> io::Result<Option<PersistedState>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
