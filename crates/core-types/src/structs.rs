use crate::enums::{BotStatus, StrategyType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV candle as returned by the exchange kline endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: DateTime<Utc>,
    pub interval: String,
}

/// A bot definition as persisted in the `bot_configs` table.
///
/// `parameters` is the opaque per-strategy JSON object; the strategy layer
/// parses it into a typed parameter struct before use.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BotConfig {
    pub id: i64,
    pub user_id: i64,
    pub api_key_id: i64,
    pub name: String,
    pub symbol: String,
    pub strategy_type: StrategyType,
    pub status: BotStatus,
    pub parameters: serde_json::Value,
    pub base_asset: String,
    pub quote_asset: String,
    pub total_investment: Decimal,
    pub total_pnl: Decimal,
    pub is_testnet: bool,
}

/// A row from the `api_keys` table. The secret is stored envelope-encrypted
/// and must pass through the credential cipher before use.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: i64,
    pub api_key: String,
    pub encrypted_secret: String,
    pub is_testnet: bool,
    pub exchange: String,
}

/// A trade row as persisted after every order event worth recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub bot_config_id: i64,
    pub exchange_order_id: Option<i64>,
    pub symbol: String,
    pub side: crate::OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_qty: Decimal,
    pub status: String,
    pub fee: Option<Decimal>,
    pub fee_asset: Option<String>,
    pub executed_at: DateTime<Utc>,
}
