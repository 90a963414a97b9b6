use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Exchange error: {0}")]
    Api(#[from] api_client::error::ApiError),

    #[error("Invalid parameters: {0}")]
    Config(#[from] configuration::ConfigError),

    #[error("Current price {price} is outside the grid range [{lower}, {upper}]")]
    GapCheck {
        price: Decimal,
        lower: Decimal,
        upper: Decimal,
    },

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Position too small to liquidate: notional {notional} below minimum {min_notional}")]
    DustPosition {
        notional: Decimal,
        min_notional: Decimal,
    },

    #[error("Unsupported strategy type: {0:?}")]
    UnsupportedStrategy(core_types::StrategyType),
}
