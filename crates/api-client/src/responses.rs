use crate::error::ApiError;
use chrono::{TimeZone, Utc};
use core_types::{Kline, OrderSide};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub server_time: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: Vec<RawFilter>,
}

/// One entry of the per-symbol `filters` array. Only the filter kinds the
/// engine quantises against are deserialised.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFilter {
    pub filter_type: String,
    pub tick_size: Option<Decimal>,
    pub step_size: Option<Decimal>,
    pub min_qty: Option<Decimal>,
    pub min_notional: Option<Decimal>,
}

/// Exchange-imposed quantisation for one trading symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size: dec!(0.01),
            step_size: dec!(0.000001),
            min_qty: dec!(0.000001),
            min_notional: dec!(10),
        }
    }
}

impl SymbolFilters {
    pub fn from_symbol_info(info: &SymbolInfo) -> Self {
        let mut filters = Self::default();
        for f in &info.filters {
            match f.filter_type.as_str() {
                "PRICE_FILTER" => {
                    if let Some(tick) = f.tick_size {
                        filters.tick_size = tick.normalize();
                    }
                }
                "LOT_SIZE" => {
                    if let Some(step) = f.step_size {
                        filters.step_size = step.normalize();
                    }
                    if let Some(min_qty) = f.min_qty {
                        filters.min_qty = min_qty;
                    }
                }
                "NOTIONAL" | "MIN_NOTIONAL" => {
                    if let Some(min_notional) = f.min_notional {
                        filters.min_notional = min_notional;
                    }
                }
                _ => {}
            }
        }
        filters
    }

    /// Floors a price to the symbol's tick size.
    pub fn floor_price(&self, price: Decimal) -> Decimal {
        floor_to_increment(price, self.tick_size)
    }

    /// Floors a quantity to the symbol's step size.
    pub fn floor_quantity(&self, quantity: Decimal) -> Decimal {
        floor_to_increment(quantity, self.step_size)
    }
}

fn floor_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    ((value / increment).floor() * increment).normalize()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub executed_qty: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: i64,
    pub client_order_id: String,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub side: OrderSide,
}

#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    pub balances: Vec<AccountBalance>,
}

#[derive(Debug, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    pub free: Decimal,
}

/// Depth snapshot; bids and asks are `[price, quantity]` pairs.
#[derive(Debug, Deserialize)]
pub struct DepthSnapshot {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub price: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
    pub code: i32,
    pub msg: String,
}

/// A USD-M futures position as returned by `/fapi/v2/positionRisk`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesPosition {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub un_realized_profit: Decimal,
}

// Intermediate struct for deserializing klines from the Binance API.
#[derive(Deserialize)]
pub struct RawKline(
    pub i64,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub i64,
    pub serde_json::Value,
    pub i64,
    pub serde_json::Value,
    pub serde_json::Value,
    pub serde_json::Value,
);

impl RawKline {
    pub fn into_kline(self, interval: &str) -> Result<Kline, ApiError> {
        let open_time = Utc
            .timestamp_millis_opt(self.0)
            .single()
            .ok_or_else(|| ApiError::Deserialization(format!("invalid open_time: {}", self.0)))?;
        let close_time = Utc
            .timestamp_millis_opt(self.6)
            .single()
            .ok_or_else(|| ApiError::Deserialization(format!("invalid close_time: {}", self.6)))?;
        Ok(Kline {
            open_time,
            open: self.1,
            high: self.2,
            low: self.3,
            close: self.4,
            volume: self.5,
            close_time,
            interval: interval.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_floor_to_exchange_precision() {
        let filters = SymbolFilters {
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(10),
        };
        assert_eq!(filters.floor_price(dec!(123.4567)), dec!(123.45));
        assert_eq!(filters.floor_quantity(dec!(0.0123456)), dec!(0.012));
        // Values already on the grid pass through untouched.
        assert_eq!(filters.floor_price(dec!(100)), dec!(100));
    }

    #[test]
    fn filters_parse_from_exchange_info() {
        let raw = serde_json::json!({
            "symbol": "BTCUSDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.01000000"},
                {"filterType": "LOT_SIZE", "stepSize": "0.00001000", "minQty": "0.00001000"},
                {"filterType": "NOTIONAL", "minNotional": "5.00000000"},
            ]
        });
        let info: SymbolInfo = serde_json::from_value(raw).unwrap();
        let filters = SymbolFilters::from_symbol_info(&info);
        assert_eq!(filters.tick_size, dec!(0.01));
        assert_eq!(filters.step_size, dec!(0.00001));
        assert_eq!(filters.min_notional, dec!(5));
    }

    #[test]
    fn raw_kline_converts() {
        let raw: RawKline = serde_json::from_str(
            r#"[1672531200000,"100.0","110.0","95.0","105.0","1234.5",1672534799999,"0",10,"0","0","0"]"#,
        )
        .unwrap();
        let kline = raw.into_kline("1h").unwrap();
        assert_eq!(kline.close, dec!(105.0));
        assert_eq!(kline.interval, "1h");
    }
}
