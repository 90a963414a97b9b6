use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Binance API error {0}: {1}")]
    Exchange(i32, String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Client is not connected; call connect() first")]
    NotConnected,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Network(err.to_string())
    }
}

/// Maps a raw exchange error payload onto the internal error taxonomy.
///
/// -2010 (insufficient balance) and -1013 (filter violation) get dedicated
/// variants because the retry layer must treat them as permanent.
pub fn map_exchange_error(code: i32, msg: String) -> ApiError {
    match code {
        -2010 => ApiError::InsufficientBalance(msg),
        -1013 => ApiError::InvalidOrder(msg),
        _ => ApiError::Exchange(code, msg),
    }
}
