use crate::error::DbError;
use core_types::{ApiKeyRecord, BotConfig, BotStatus, TradeRecord};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPool;
use sqlx::Row;

/// The `DbRepository` provides a high-level, application-specific interface
/// to the database. It encapsulates all SQL queries and data access logic.
#[derive(Debug, Clone)]
pub struct DbRepository {
    pool: PgPool,
}

impl DbRepository {
    /// Creates a new `DbRepository` with a shared database connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_bot(&self, bot_id: i64) -> Result<BotConfig, DbError> {
        let bot = sqlx::query_as::<_, BotConfig>(
            r#"
            SELECT id, user_id, api_key_id, name, symbol, strategy_type, status,
                   parameters, base_asset, quote_asset, total_investment, total_pnl,
                   is_testnet
            FROM bot_configs
            WHERE id = $1
            "#,
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;

        bot.ok_or_else(|| DbError::NotFound(format!("bot {}", bot_id)))
    }

    /// All bots in the given lifecycle status; used at startup to resume
    /// everything that was running before the process died.
    pub async fn list_bots_by_status(&self, status: BotStatus) -> Result<Vec<BotConfig>, DbError> {
        let bots = sqlx::query_as::<_, BotConfig>(
            r#"
            SELECT id, user_id, api_key_id, name, symbol, strategy_type, status,
                   parameters, base_asset, quote_asset, total_investment, total_pnl,
                   is_testnet
            FROM bot_configs
            WHERE status = $1
            ORDER BY id
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(bots)
    }

    pub async fn update_bot_status(&self, bot_id: i64, status: BotStatus) -> Result<(), DbError> {
        sqlx::query("UPDATE bot_configs SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(bot_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_api_key(&self, api_key_id: i64) -> Result<ApiKeyRecord, DbError> {
        let record = sqlx::query_as::<_, ApiKeyRecord>(
            r#"
            SELECT id, user_id, api_key, encrypted_secret, is_testnet, exchange
            FROM api_keys
            WHERE id = $1
            "#,
        )
        .bind(api_key_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| DbError::NotFound(format!("api key {}", api_key_id)))
    }

    /// The user's envelope-encrypted data-encryption key.
    pub async fn get_user_encrypted_dek(&self, user_id: i64) -> Result<String, DbError> {
        let row = sqlx::query("SELECT encrypted_dek FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.get("encrypted_dek"))
            .ok_or_else(|| DbError::NotFound(format!("user {}", user_id)))
    }

    /// Records one trade row. Used for entries that do not change the bot's
    /// cumulative PnL (buys, cancels, partial fills).
    pub async fn record_trade(&self, trade: &TradeRecord) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO trades
                (bot_config_id, exchange_order_id, symbol, side, price, quantity,
                 executed_qty, status, fee, fee_asset, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(trade.bot_config_id)
        .bind(trade.exchange_order_id.map(|id| id.to_string()))
        .bind(&trade.symbol)
        .bind(trade.side.as_str().to_lowercase())
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.executed_qty)
        .bind(&trade.status)
        .bind(trade.fee)
        .bind(&trade.fee_asset)
        .bind(trade.executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a sell fill and moves the bot's cumulative PnL forward in one
    /// transaction, so the trade history and `total_pnl` can never diverge.
    pub async fn record_sell_fill(
        &self,
        trade: &TradeRecord,
        realized_profit: Decimal,
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO trades
                (bot_config_id, exchange_order_id, symbol, side, price, quantity,
                 executed_qty, status, fee, fee_asset, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(trade.bot_config_id)
        .bind(trade.exchange_order_id.map(|id| id.to_string()))
        .bind(&trade.symbol)
        .bind(trade.side.as_str().to_lowercase())
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.executed_qty)
        .bind(&trade.status)
        .bind(trade.fee)
        .bind(&trade.fee_asset)
        .bind(trade.executed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE bot_configs SET total_pnl = $1 WHERE id = $2")
            .bind(realized_profit)
            .bind(trade.bot_config_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Persists one notification row for the user's inbox.
    pub async fn insert_notification(
        &self,
        user_id: i64,
        level: &str,
        title: &str,
        message: &str,
        data: Option<JsonValue>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (user_id, level, title, message, is_read, data)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            "#,
        )
        .bind(user_id)
        .bind(level)
        .bind(title)
        .bind(message)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
