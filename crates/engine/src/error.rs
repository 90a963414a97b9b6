use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Exchange error: {0}")]
    Api(#[from] api_client::error::ApiError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] strategies::StrategyError),

    #[error("Database error: {0}")]
    Db(#[from] database::DbError),

    #[error("Event bus error: {0}")]
    Bus(#[from] event_bus::BusError),

    #[error("Geo-compliance check failed: {0}")]
    GeoBlocked(String),

    #[error("Credential decryption failed: {0}")]
    Credential(String),
}
