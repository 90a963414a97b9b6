use crate::error::ConfigError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Typed, validated parameter set for the grid strategy.
///
/// Bots carry their parameters as an opaque JSON object in the database;
/// this struct is the explicit schema that object must satisfy. Unknown
/// fields are ignored so older engines tolerate newer bot records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParameters {
    #[serde(rename = "grid_lower_price")]
    pub lower: Decimal,
    #[serde(rename = "grid_upper_price")]
    pub upper: Decimal,
    pub grid_count: u32,
    #[serde(rename = "grid_investment_per_grid")]
    pub investment_per_grid: Decimal,
    #[serde(default = "default_reserve_ratio")]
    pub reserve_ratio: Decimal,
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: Decimal,
    #[serde(default = "default_take_profit_amount")]
    pub take_profit_amount: Decimal,
    #[serde(default = "default_max_spread_percent")]
    pub max_spread_percent: Decimal,
    #[serde(default = "default_max_order_count")]
    pub max_order_count: u32,
    #[serde(default = "default_max_position_ratio")]
    pub max_position_ratio: Decimal,
    #[serde(default = "default_martin_multiplier")]
    pub martin_multiplier: Decimal,
    #[serde(default = "default_max_martin_levels")]
    pub max_martin_levels: u32,
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: Decimal,
    #[serde(rename = "trade_cooldown", default = "default_trade_cooldown")]
    pub trade_cooldown_seconds: u64,
    #[serde(rename = "stale_data_timeout", default = "default_stale_data_timeout")]
    pub stale_data_timeout_seconds: u64,
    #[serde(default)]
    pub adaptive_mode: bool,
    #[serde(rename = "analysis_interval", default = "default_analysis_interval")]
    pub analysis_interval_seconds: u64,
    #[serde(default = "default_decay_min_multiplier")]
    pub decay_min_multiplier: Decimal,
}

fn default_reserve_ratio() -> Decimal {
    dec!(0.05)
}
fn default_stop_loss_percent() -> Decimal {
    dec!(0.2)
}
fn default_take_profit_amount() -> Decimal {
    dec!(1000)
}
fn default_max_spread_percent() -> Decimal {
    dec!(0.005)
}
fn default_max_order_count() -> u32 {
    50
}
fn default_max_position_ratio() -> Decimal {
    dec!(0.95)
}
fn default_martin_multiplier() -> Decimal {
    dec!(1.5)
}
fn default_max_martin_levels() -> u32 {
    3
}
fn default_max_drawdown() -> Decimal {
    dec!(0.2)
}
fn default_trade_cooldown() -> u64 {
    5
}
fn default_stale_data_timeout() -> u64 {
    300
}
fn default_analysis_interval() -> u64 {
    15
}
fn default_decay_min_multiplier() -> Decimal {
    dec!(0.2)
}

impl GridParameters {
    /// Parses and validates the opaque `parameters` object of a bot record.
    pub fn from_parameters(parameters: &serde_json::Value) -> Result<Self, ConfigError> {
        let params: GridParameters = serde_json::from_value(parameters.clone())?;
        params.validate()?;
        Ok(params)
    }

    /// Validates that the parameter ranges are logical.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lower <= Decimal::ZERO || self.upper <= Decimal::ZERO {
            return Err(ConfigError::InvalidParameters(
                "grid bounds must be positive".to_string(),
            ));
        }
        if self.upper <= self.lower {
            return Err(ConfigError::InvalidParameters(
                "grid_upper_price must be greater than grid_lower_price".to_string(),
            ));
        }
        if self.grid_count < 2 {
            return Err(ConfigError::InvalidParameters(
                "grid_count must be at least 2".to_string(),
            ));
        }
        if self.grid_count > self.max_order_count {
            return Err(ConfigError::InvalidParameters(
                "grid_count must not exceed max_order_count".to_string(),
            ));
        }
        if self.investment_per_grid <= Decimal::ZERO {
            return Err(ConfigError::InvalidParameters(
                "grid_investment_per_grid must be positive".to_string(),
            ));
        }
        if self.reserve_ratio <= Decimal::ZERO || self.reserve_ratio >= Decimal::ONE {
            return Err(ConfigError::InvalidParameters(
                "reserve_ratio must be between 0 and 1".to_string(),
            ));
        }
        if self.stop_loss_percent <= Decimal::ZERO || self.stop_loss_percent >= Decimal::ONE {
            return Err(ConfigError::InvalidParameters(
                "stop_loss_percent must be between 0 and 1".to_string(),
            ));
        }
        if self.max_position_ratio <= Decimal::ZERO || self.max_position_ratio > Decimal::ONE {
            return Err(ConfigError::InvalidParameters(
                "max_position_ratio must be within (0, 1]".to_string(),
            ));
        }
        if self.martin_multiplier < Decimal::ONE {
            return Err(ConfigError::InvalidParameters(
                "martin_multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The arithmetic distance between two adjacent grid lines.
    pub fn base_step(&self) -> Decimal {
        (self.upper - self.lower) / Decimal::from(self.grid_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_params() -> serde_json::Value {
        json!({
            "grid_lower_price": "100",
            "grid_upper_price": "200",
            "grid_count": 10,
            "grid_investment_per_grid": "10",
        })
    }

    #[test]
    fn parses_minimal_parameters_with_defaults() {
        let params = GridParameters::from_parameters(&minimal_params()).unwrap();
        assert_eq!(params.lower, dec!(100));
        assert_eq!(params.upper, dec!(200));
        assert_eq!(params.grid_count, 10);
        assert_eq!(params.reserve_ratio, dec!(0.05));
        assert_eq!(params.max_order_count, 50);
        assert_eq!(params.trade_cooldown_seconds, 5);
        assert!(!params.adaptive_mode);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut raw = minimal_params();
        raw["grid_upper_price"] = json!("50");
        assert!(GridParameters::from_parameters(&raw).is_err());
    }

    #[test]
    fn rejects_grid_count_above_order_ceiling() {
        let mut raw = minimal_params();
        raw["grid_count"] = json!(60);
        assert!(GridParameters::from_parameters(&raw).is_err());
    }

    #[test]
    fn base_step_is_uniform() {
        let params = GridParameters::from_parameters(&minimal_params()).unwrap();
        assert_eq!(params.base_step(), dec!(10));
    }
}
