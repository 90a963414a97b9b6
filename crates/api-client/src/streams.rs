//! WebSocket market and user-data streams.
//!
//! Both loops are resilient: they reconnect with exponential backoff and
//! apply a read deadline so a silently dead connection (a proxy or NAT box
//! dropping the TCP session without a FIN) is detected and replaced.

use crate::error::ApiError;
use core_types::OrderSide;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// The ticker stream pushes at least once a second; 10s of silence means the
/// connection is dead even if the socket still looks open.
pub const MARKET_READ_DEADLINE: Duration = Duration::from_secs(10);
/// The user stream can be quiet for long stretches, but the exchange pings
/// periodically; 3 minutes of total silence forces a reconnect.
pub const USER_READ_DEADLINE: Duration = Duration::from_secs(180);
/// Base delay between reconnect attempts; doubled up to [`RECONNECT_MAX_DELAY`].
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Listen keys expire after 60 minutes without a keepalive.
const LISTEN_KEY_KEEPALIVE_PERIOD: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Deserialize)]
struct TickerFrame {
    /// Last traded price.
    #[serde(rename = "c")]
    last_price: Decimal,
}

/// Extracts the last price from a `<symbol>@ticker` frame, if it is one.
pub fn parse_ticker_price(text: &str) -> Option<Decimal> {
    serde_json::from_str::<TickerFrame>(text)
        .ok()
        .map(|frame| frame.last_price)
}

/// An `executionReport` event from the user-data stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "S")]
    pub side: OrderSide,
    /// Last fill price; zero for non-trade execution types.
    #[serde(rename = "L")]
    pub last_fill_price: Decimal,
    /// Cumulative filled quantity.
    #[serde(rename = "z")]
    pub cumulative_qty: Decimal,
    #[serde(rename = "n", default)]
    pub fee: Option<Decimal>,
    #[serde(rename = "N", default)]
    pub fee_asset: Option<String>,
}

/// One balance entry of an `outboundAccountPosition` event.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceDelta {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "f")]
    pub free: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountPosition {
    #[serde(rename = "B")]
    pub balances: Vec<BalanceDelta>,
}

/// A parsed user-data stream event.
#[derive(Debug, Clone)]
pub enum UserDataEvent {
    ExecutionReport(ExecutionReport),
    AccountPosition(AccountPosition),
}

/// Parses a raw user-data frame; unknown event types are ignored.
pub fn parse_user_event(text: &str) -> Option<UserDataEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("e").and_then(|e| e.as_str()) {
        Some("executionReport") => serde_json::from_value(value)
            .ok()
            .map(UserDataEvent::ExecutionReport),
        Some("outboundAccountPosition") => serde_json::from_value(value)
            .ok()
            .map(UserDataEvent::AccountPosition),
        _ => None,
    }
}

/// Runs the per-symbol ticker loop forever, invoking `on_price` for every
/// frame. Returns only when the owning task is cancelled.
pub async fn run_market_ticker_loop<F>(symbol: &str, testnet: bool, mut on_price: F)
where
    F: FnMut(Decimal) + Send,
{
    let stream_url = format!(
        "{}/ws/{}@ticker",
        crate::ws_base(testnet),
        symbol.to_lowercase()
    );
    let mut delay = RECONNECT_BASE_DELAY;

    loop {
        tracing::info!(symbol, "connecting market ticker stream");
        match connect_async(stream_url.as_str()).await {
            Ok((mut ws, _)) => {
                tracing::info!(symbol, "market ticker stream connected");
                delay = RECONNECT_BASE_DELAY;
                loop {
                    match tokio::time::timeout(MARKET_READ_DEADLINE, ws.next()).await {
                        Err(_) => {
                            tracing::warn!(
                                symbol,
                                "no ticker frame within read deadline, forcing reconnect"
                            );
                            break;
                        }
                        Ok(None) => {
                            tracing::warn!(symbol, "ticker stream closed by remote");
                            break;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(price) = parse_ticker_price(text.as_str()) {
                                on_price(price);
                            }
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            tracing::error!(symbol, error = %e, "ticker stream read error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(symbol, error = %e, "market stream connect failed");
            }
        }
        tracing::warn!(symbol, delay_secs = delay.as_secs(), "reconnecting market stream");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

/// Minimal credentialed client for the authenticated user-data stream:
/// it owns the listen-key lifecycle and the framed WebSocket read loop.
pub struct UserStreamClient {
    http: reqwest::Client,
    rest_base: &'static str,
    ws_base: &'static str,
}

impl UserStreamClient {
    pub fn new(api_key: &str, testnet: bool, proxy: Option<&str>) -> Result<Self, ApiError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            reqwest::header::HeaderValue::from_str(api_key)
                .map_err(|e| ApiError::Network(e.to_string()))?,
        );
        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            rest_base: crate::rest_base(testnet),
            ws_base: crate::ws_base(testnet),
        })
    }

    async fn create_listen_key(&self) -> Result<String, ApiError> {
        let url = format!("{}/api/v3/userDataStream", self.rest_base);
        let response: ListenKeyResponse = self
            .http
            .post(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ApiError::Network(e.to_string()))?
            .json()
            .await?;
        Ok(response.listen_key)
    }

    async fn keepalive(&self, listen_key: &str) -> Result<(), ApiError> {
        let url = format!("{}/api/v3/userDataStream", self.rest_base);
        self.http
            .put(&url)
            .query(&[("listenKey", listen_key)])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(())
    }

    /// Runs the user-data loop forever, invoking `on_event` for every parsed
    /// event. Returns only when the owning task is cancelled.
    pub async fn run<F>(&self, mut on_event: F)
    where
        F: FnMut(UserDataEvent) + Send,
    {
        let mut delay = RECONNECT_BASE_DELAY;
        loop {
            let listen_key = match self.create_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    tracing::error!(error = %e, "failed to obtain listen key");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
            };

            let stream_url = format!("{}/ws/{}", self.ws_base, listen_key);
            match connect_async(stream_url.as_str()).await {
                Ok((mut ws, _)) => {
                    tracing::info!("user-data stream connected");
                    delay = RECONNECT_BASE_DELAY;
                    let mut keepalive = tokio::time::interval(LISTEN_KEY_KEEPALIVE_PERIOD);
                    // Consume the immediate first tick of the interval.
                    keepalive.tick().await;
                    loop {
                        tokio::select! {
                            frame = tokio::time::timeout(USER_READ_DEADLINE, ws.next()) => {
                                match frame {
                                    Err(_) => {
                                        tracing::warn!("user-data stream silent past deadline, forcing reconnect");
                                        break;
                                    }
                                    Ok(None) => {
                                        tracing::warn!("user-data stream closed by remote");
                                        break;
                                    }
                                    Ok(Some(Ok(Message::Text(text)))) => {
                                        if let Some(event) = parse_user_event(text.as_str()) {
                                            on_event(event);
                                        }
                                    }
                                    Ok(Some(Ok(_))) => {}
                                    Ok(Some(Err(e))) => {
                                        tracing::error!(error = %e, "user-data stream read error");
                                        break;
                                    }
                                }
                            }
                            _ = keepalive.tick() => {
                                if let Err(e) = self.keepalive(&listen_key).await {
                                    tracing::warn!(error = %e, "listen key keepalive failed");
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "user-data stream connect failed");
                }
            }
            tracing::warn!(delay_secs = delay.as_secs(), "reconnecting user-data stream");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ticker_frame_yields_last_price() {
        let frame = r#"{"e":"24hrTicker","s":"BTCUSDT","c":"42123.45","o":"41000.00"}"#;
        assert_eq!(parse_ticker_price(frame), Some(dec!(42123.45)));
        assert_eq!(parse_ticker_price("{\"x\":1}"), None);
    }

    #[test]
    fn execution_report_parses_fill_fields() {
        let frame = r#"{
            "e":"executionReport","s":"BTCUSDT","i":12345,"c":"LATTICE_abc",
            "X":"FILLED","S":"BUY","L":"120.00","z":"0.0833",
            "n":"0.0001","N":"BTC"
        }"#;
        match parse_user_event(frame) {
            Some(UserDataEvent::ExecutionReport(report)) => {
                assert_eq!(report.order_id, 12345);
                assert_eq!(report.status, "FILLED");
                assert_eq!(report.side, OrderSide::Buy);
                assert_eq!(report.last_fill_price, dec!(120.00));
                assert_eq!(report.cumulative_qty, dec!(0.0833));
                assert_eq!(report.fee_asset.as_deref(), Some("BTC"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn account_position_parses_balances() {
        let frame = r#"{
            "e":"outboundAccountPosition","u":123,
            "B":[{"a":"USDT","f":"1000.5","l":"0"},{"a":"BTC","f":"0.25","l":"0"}]
        }"#;
        match parse_user_event(frame) {
            Some(UserDataEvent::AccountPosition(position)) => {
                assert_eq!(position.balances.len(), 2);
                assert_eq!(position.balances[0].asset, "USDT");
                assert_eq!(position.balances[0].free, dec!(1000.5));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert!(parse_user_event(r#"{"e":"balanceUpdate","a":"USDT"}"#).is_none());
    }
}
