pub mod enums;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{BotStatus, GridOrderStatus, OrderSide, OrderType, StrategyType};
pub use structs::{ApiKeyRecord, BotConfig, Kline, TradeRecord};
