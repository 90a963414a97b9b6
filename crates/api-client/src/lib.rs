use crate::auth::sign_request;
use crate::error::{map_exchange_error, ApiError};
use crate::rate_limiter::RateLimiter;
use crate::responses::{
    AccountInfo, ApiErrorResponse, DepthSnapshot, ExchangeInfo, FuturesPosition, RawKline,
    ServerTime, TickerPrice,
};
use async_trait::async_trait;
use chrono::Utc;
use core_types::{Kline, OrderSide};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

mod auth;
pub mod error;
pub mod rate_limiter;
pub mod responses;
pub mod retry;
pub mod streams;

// --- Public API ---
pub use responses::{OpenOrder, OrderResponse, SymbolFilters};
pub use streams::{
    run_market_ticker_loop, AccountPosition, ExecutionReport, UserDataEvent, UserStreamClient,
};

/// Prefix applied to every client order id so the engine can recognise its
/// own orders after a restart.
pub const ORDER_ID_PREFIX: &str = "LATTICE_";

/// A balance snapshot older than this is considered zombie data; reads fall
/// back to one REST refresh before any risk decision is made on it.
pub const BALANCE_STALE_TIMEOUT: Duration = Duration::from_secs(60);

const KLINE_CACHE_TTL: Duration = Duration::from_secs(60);

pub fn rest_base(testnet: bool) -> &'static str {
    if testnet {
        "https://testnet.binance.vision"
    } else {
        "https://api.binance.com"
    }
}

pub fn ws_base(testnet: bool) -> &'static str {
    if testnet {
        "wss://testnet.binance.vision"
    } else {
        "wss://stream.binance.com:9443"
    }
}

fn futures_base(testnet: bool) -> &'static str {
    if testnet {
        "https://testnet.binancefuture.com"
    } else {
        "https://fapi.binance.com"
    }
}

/// The abstract exchange interface the strategy layer trades against.
///
/// The live engine uses [`BinanceClient`]; tests swap in an in-memory mock.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Free balance of one asset from the local snapshot, refreshing over
    /// REST first when the snapshot has gone stale.
    async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ApiError>;

    /// `(position_value, total_value)` in quote terms, computed from the
    /// local snapshot. Falls back to one ticker request without a hint.
    async fn get_total_position_value(
        &self,
        price_hint: Option<Decimal>,
    ) -> Result<(Decimal, Decimal), ApiError>;

    async fn create_limit_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderResponse, ApiError>;

    /// Exactly one of `quantity` (base) or `quote_quantity` must be given.
    async fn create_market_order(
        &self,
        side: OrderSide,
        quantity: Option<Decimal>,
        quote_quantity: Option<Decimal>,
    ) -> Result<OrderResponse, ApiError>;

    /// Cancels one order; an already-gone order (-2011) counts as success.
    async fn cancel_order(&self, order_id: i64) -> Result<(), ApiError>;

    /// Cancels every open order on the symbol, returning how many there were.
    async fn cancel_all_orders(&self) -> Result<usize, ApiError>;

    /// Clears any leftover orders found on the exchange; used on fresh start.
    async fn nuke_all_orders(&self) -> Result<(), ApiError>;

    /// Cancels open orders deviating more than `threshold` from the price.
    async fn cancel_far_orders(
        &self,
        current_price: Decimal,
        threshold: Decimal,
    ) -> Result<usize, ApiError>;

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ApiError>;

    /// `(ask - bid) / mid`; returns 1.0 when the book is empty so callers
    /// pause instead of trading into a void.
    async fn get_bid_ask_spread(&self) -> Result<Decimal, ApiError>;

    /// Klines, memoised for 60 seconds per `(interval, limit)`.
    async fn get_klines(&self, interval: &str, limit: u32) -> Result<Vec<Kline>, ApiError>;

    async fn get_symbol_price(&self) -> Result<Decimal, ApiError>;

    fn filters(&self) -> SymbolFilters;

    fn rate_limiter(&self) -> &RateLimiter;
}

/// Construction parameters for one credentialed, symbol-bound client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub api_secret: String,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub testnet: bool,
    pub proxy: Option<String>,
}

struct BalanceSnapshot {
    free: HashMap<String, Decimal>,
    updated_at: Option<Instant>,
}

/// A typed, per-credential wrapper over the Binance spot REST API plus the
/// USD-M futures endpoints the hedging strategies consume.
///
/// All request weight flows through the credential's [`RateLimiter`]; the
/// authoritative used-weight response header calibrates the local bucket.
pub struct BinanceClient {
    cfg: ClientConfig,
    http: reqwest::Client,
    rest_base: &'static str,
    futures_base: &'static str,
    rate_limiter: Arc<RateLimiter>,
    time_offset_ms: AtomicI64,
    connected: AtomicBool,
    filters: RwLock<SymbolFilters>,
    balances: RwLock<BalanceSnapshot>,
    klines_cache: Mutex<HashMap<String, (Instant, Vec<Kline>)>>,
}

impl BinanceClient {
    pub fn new(cfg: ClientConfig, rate_limiter: Arc<RateLimiter>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            HeaderValue::from_str(&cfg.api_key).map_err(|e| ApiError::Network(e.to_string()))?,
        );

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(proxy) = &cfg.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            rest_base: rest_base(cfg.testnet),
            futures_base: futures_base(cfg.testnet),
            cfg,
            http: builder.build()?,
            rate_limiter,
            time_offset_ms: AtomicI64::new(0),
            connected: AtomicBool::new(false),
            filters: RwLock::new(SymbolFilters::default()),
            balances: RwLock::new(BalanceSnapshot {
                free: HashMap::new(),
                updated_at: None,
            }),
            klines_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.cfg.symbol
    }

    pub fn base_asset(&self) -> &str {
        &self.cfg.base_asset
    }

    pub fn quote_asset(&self) -> &str {
        &self.cfg.quote_asset
    }

    pub fn is_testnet(&self) -> bool {
        self.cfg.testnet
    }

    /// Establishes the session: synchronises the server clock, loads the
    /// symbol quantisation filters and warms the balance snapshot once.
    pub async fn connect(&self) -> Result<(), ApiError> {
        tracing::info!(
            symbol = %self.cfg.symbol,
            testnet = self.cfg.testnet,
            "connecting exchange client"
        );
        self.connected.store(true, Ordering::SeqCst);

        if let Err(e) = self.sync_server_time().await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.load_exchange_info().await?;
        self.sync_balances().await?;

        tracing::info!(symbol = %self.cfg.symbol, "exchange client connected");
        Ok(())
    }

    /// Idempotent teardown.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!(symbol = %self.cfg.symbol, "exchange client disconnected");
        }
    }

    fn ensure_connected(&self) -> Result<(), ApiError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::NotConnected)
        }
    }

    fn corrected_timestamp(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::SeqCst)
    }

    /// Records the offset between the local clock and the exchange clock.
    pub async fn sync_server_time(&self) -> Result<(), ApiError> {
        self.rate_limiter.acquire_weight(1).await;
        let url = format!("{}/api/v3/time", self.rest_base);
        let response: ServerTime = self.send_public(self.http.get(&url)).await?;
        let offset = response.server_time - Utc::now().timestamp_millis();
        self.time_offset_ms.store(offset, Ordering::SeqCst);
        tracing::info!(offset_ms = offset, "server time synchronised");
        Ok(())
    }

    async fn resync_clock(&self) {
        if let Err(e) = self.sync_server_time().await {
            tracing::error!(error = %e, "clock resync failed");
        }
    }

    async fn load_exchange_info(&self) -> Result<(), ApiError> {
        self.rate_limiter.acquire_weight(10).await;
        let url = format!("{}/api/v3/exchangeInfo", self.rest_base);
        let info: ExchangeInfo = self
            .send_public(self.http.get(&url).query(&[("symbol", &self.cfg.symbol)]))
            .await?;

        match info.symbols.iter().find(|s| s.symbol == self.cfg.symbol) {
            Some(symbol_info) => {
                let filters = SymbolFilters::from_symbol_info(symbol_info);
                tracing::info!(
                    symbol = %self.cfg.symbol,
                    tick_size = %filters.tick_size,
                    step_size = %filters.step_size,
                    min_notional = %filters.min_notional,
                    "symbol filters loaded"
                );
                *self.filters.write().expect("filters lock poisoned") = filters;
            }
            None => {
                tracing::warn!(
                    symbol = %self.cfg.symbol,
                    "symbol missing from exchangeInfo, keeping default filters"
                );
            }
        }
        Ok(())
    }

    /// Floor-truncates a price to the symbol's tick size.
    pub fn format_price(&self, price: Decimal) -> Decimal {
        self.filters().floor_price(price)
    }

    /// Floor-truncates a quantity to the symbol's step size.
    pub fn format_quantity(&self, quantity: Decimal) -> Decimal {
        self.filters().floor_quantity(quantity)
    }

    /// Applies an `outboundAccountPosition` event to the balance snapshot.
    pub fn apply_balance_update(&self, position: &AccountPosition) {
        let mut snapshot = self.balances.write().expect("balance lock poisoned");
        for delta in &position.balances {
            snapshot.free.insert(delta.asset.clone(), delta.free);
        }
        snapshot.updated_at = Some(Instant::now());
        tracing::debug!(entries = position.balances.len(), "balance snapshot updated from stream");
    }

    /// Full snapshot refresh over REST (weight 10).
    async fn sync_balances(&self) -> Result<(), ApiError> {
        let account = self.get_account().await?;
        let mut snapshot = self.balances.write().expect("balance lock poisoned");
        for balance in account.balances {
            snapshot.free.insert(balance.asset, balance.free);
        }
        snapshot.updated_at = Some(Instant::now());
        tracing::debug!("balance snapshot refreshed over REST");
        Ok(())
    }

    async fn get_account(&self) -> Result<AccountInfo, ApiError> {
        self.ensure_connected()?;
        retry::retry_with(
            3,
            Duration::from_secs(2),
            || async {
                self.rate_limiter.acquire_weight(10).await;
                let mut params = BTreeMap::new();
                self.send_signed(Method::GET, "/api/v3/account", &mut params)
                    .await
            },
            || self.resync_clock(),
        )
        .await
    }

    fn snapshot_is_stale(&self) -> bool {
        let snapshot = self.balances.read().expect("balance lock poisoned");
        match snapshot.updated_at {
            Some(updated_at) => updated_at.elapsed() > BALANCE_STALE_TIMEOUT,
            None => true,
        }
    }

    fn snapshot_free(&self, asset: &str) -> Option<Decimal> {
        self.balances
            .read()
            .expect("balance lock poisoned")
            .free
            .get(asset)
            .copied()
    }

    async fn send_public<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = request.send().await?;
        self.calibrate_from_headers(response.headers());
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| ApiError::Deserialization(e.to_string()))
        } else {
            Err(self.parse_error(&text))
        }
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        self.send_signed_to(self.rest_base, method, path, params).await
    }

    async fn send_signed_to<T: DeserializeOwned>(
        &self,
        base: &str,
        method: Method,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        params.insert("timestamp", self.corrected_timestamp().to_string());

        let query_string = serde_qs::to_string(params)
            .map_err(|e| ApiError::Deserialization(e.to_string()))?;
        let signature = sign_request(&self.cfg.api_secret, &query_string);
        let url = format!("{}{}?{}&signature={}", base, path, query_string, signature);

        let response = self.http.request(method, &url).send().await?;
        self.calibrate_from_headers(response.headers());
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| ApiError::Deserialization(e.to_string()))
        } else {
            Err(self.parse_error(&text))
        }
    }

    fn parse_error(&self, text: &str) -> ApiError {
        match serde_json::from_str::<ApiErrorResponse>(text) {
            Ok(payload) => map_exchange_error(payload.code, payload.msg),
            Err(e) => ApiError::Deserialization(format!(
                "failed to decode error response: {}. Original text: {}",
                e, text
            )),
        }
    }

    fn calibrate_from_headers(&self, headers: &HeaderMap) {
        if let Some(used) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.rate_limiter.calibrate_weight(used);
        }
    }

    async fn try_create_limit_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderResponse, ApiError> {
        self.rate_limiter.acquire_order_slot().await;
        self.rate_limiter.acquire_weight(1).await;

        let formatted_price = self.format_price(price);
        let formatted_qty = self.format_quantity(quantity);
        let client_order_id = format!("{}{}", ORDER_ID_PREFIX, &uuid::Uuid::new_v4().simple().to_string()[..16]);

        tracing::info!(
            symbol = %self.cfg.symbol,
            side = side.as_str(),
            price = %formatted_price,
            quantity = %formatted_qty,
            "placing limit order"
        );

        let mut params = BTreeMap::new();
        params.insert("symbol", self.cfg.symbol.clone());
        params.insert("side", side.as_str().to_string());
        params.insert("type", "LIMIT".to_string());
        params.insert("timeInForce", "GTC".to_string());
        params.insert("price", formatted_price.to_string());
        params.insert("quantity", formatted_qty.to_string());
        params.insert("newClientOrderId", client_order_id);

        let order: OrderResponse = self
            .send_signed(Method::POST, "/api/v3/order", &mut params)
            .await?;
        tracing::info!(order_id = order.order_id, "limit order accepted");
        Ok(order)
    }

    async fn try_create_market_order(
        &self,
        side: OrderSide,
        quantity: Option<Decimal>,
        quote_quantity: Option<Decimal>,
    ) -> Result<OrderResponse, ApiError> {
        self.rate_limiter.acquire_order_slot().await;
        self.rate_limiter.acquire_weight(1).await;

        let mut params = BTreeMap::new();
        params.insert("symbol", self.cfg.symbol.clone());
        params.insert("side", side.as_str().to_string());
        params.insert("type", "MARKET".to_string());
        match (quantity, quote_quantity) {
            (Some(qty), None) => {
                params.insert("quantity", self.format_quantity(qty).to_string());
            }
            (None, Some(quote_qty)) => {
                params.insert("quoteOrderQty", quote_qty.to_string());
            }
            _ => {
                return Err(ApiError::InvalidOrder(
                    "market order requires exactly one of quantity or quote_quantity".to_string(),
                ));
            }
        }

        tracing::info!(
            symbol = %self.cfg.symbol,
            side = side.as_str(),
            "placing market order"
        );
        let order: OrderResponse = self
            .send_signed(Method::POST, "/api/v3/order", &mut params)
            .await?;
        tracing::info!(order_id = order.order_id, "market order executed");
        Ok(order)
    }

    /// Depth snapshot for the symbol (weight 5).
    pub async fn get_order_book(&self, depth: u32) -> Result<DepthSnapshot, ApiError> {
        self.ensure_connected()?;
        retry::retry_with(
            3,
            Duration::from_secs(1),
            || async {
                self.rate_limiter.acquire_weight(5).await;
                let url = format!("{}/api/v3/depth", self.rest_base);
                self.send_public(
                    self.http
                        .get(&url)
                        .query(&[("symbol", self.cfg.symbol.as_str())])
                        .query(&[("limit", depth)]),
                )
                .await
            },
            || self.resync_clock(),
        )
        .await
    }

    /// Reads all USD-M futures positions for the credential.
    pub async fn get_futures_positions(&self) -> Result<Vec<FuturesPosition>, ApiError> {
        self.ensure_connected()?;
        retry::retry_with(
            3,
            Duration::from_secs(1),
            || async {
                self.rate_limiter.acquire_weight(5).await;
                let mut params = BTreeMap::new();
                self.send_signed_to(self.futures_base, Method::GET, "/fapi/v2/positionRisk", &mut params)
                    .await
            },
            || self.resync_clock(),
        )
        .await
    }

    /// Submits a USD-M futures order (LIMIT GTC when a price is given,
    /// MARKET otherwise).
    pub async fn create_futures_order(
        &self,
        side: OrderSide,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse, ApiError> {
        self.ensure_connected()?;
        retry::retry_with(
            2,
            Duration::from_secs(1),
            || async {
                self.rate_limiter.acquire_order_slot().await;
                self.rate_limiter.acquire_weight(1).await;
                let mut params = BTreeMap::new();
                params.insert("symbol", self.cfg.symbol.clone());
                params.insert("side", side.as_str().to_string());
                params.insert("quantity", self.format_quantity(quantity).to_string());
                match price {
                    Some(price) => {
                        params.insert("type", "LIMIT".to_string());
                        params.insert("timeInForce", "GTC".to_string());
                        params.insert("price", self.format_price(price).to_string());
                    }
                    None => {
                        params.insert("type", "MARKET".to_string());
                    }
                }
                self.send_signed_to(self.futures_base, Method::POST, "/fapi/v1/order", &mut params)
                    .await
            },
            || self.resync_clock(),
        )
        .await
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ApiError> {
        self.ensure_connected()?;

        // Stale-data protection: never make a risk decision on a snapshot the
        // user-data stream stopped feeding.
        if self.snapshot_is_stale() {
            tracing::warn!(asset, "balance snapshot stale, refreshing over REST");
            self.sync_balances().await?;
        }

        if let Some(free) = self.snapshot_free(asset) {
            return Ok(free);
        }
        // Unknown asset: refresh once, then report zero if still absent.
        self.sync_balances().await?;
        Ok(self.snapshot_free(asset).unwrap_or(Decimal::ZERO))
    }

    async fn get_total_position_value(
        &self,
        price_hint: Option<Decimal>,
    ) -> Result<(Decimal, Decimal), ApiError> {
        let base_asset = self.cfg.base_asset.clone();
        let quote_asset = self.cfg.quote_asset.clone();
        let base_free = self.get_free_balance(&base_asset).await?;
        let quote_free = self.get_free_balance(&quote_asset).await?;

        let price = match price_hint {
            Some(price) if price > Decimal::ZERO => price,
            _ => self.get_symbol_price().await.unwrap_or(Decimal::ZERO),
        };

        let position_value = base_free * price;
        Ok((position_value, quote_free + position_value))
    }

    async fn create_limit_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderResponse, ApiError> {
        self.ensure_connected()?;
        retry::retry_with(
            2,
            Duration::from_secs(1),
            || self.try_create_limit_order(side, price, quantity),
            || self.resync_clock(),
        )
        .await
    }

    async fn create_market_order(
        &self,
        side: OrderSide,
        quantity: Option<Decimal>,
        quote_quantity: Option<Decimal>,
    ) -> Result<OrderResponse, ApiError> {
        self.ensure_connected()?;
        retry::retry_with(
            2,
            Duration::from_secs(1),
            || self.try_create_market_order(side, quantity, quote_quantity),
            || self.resync_clock(),
        )
        .await
    }

    async fn cancel_order(&self, order_id: i64) -> Result<(), ApiError> {
        self.ensure_connected()?;
        let result = retry::retry_with(
            2,
            Duration::from_secs(1),
            || async {
                self.rate_limiter.acquire_weight(1).await;
                let mut params = BTreeMap::new();
                params.insert("symbol", self.cfg.symbol.clone());
                params.insert("orderId", order_id.to_string());
                self.send_signed::<serde_json::Value>(Method::DELETE, "/api/v3/order", &mut params)
                    .await
            },
            || self.resync_clock(),
        )
        .await;

        match result {
            Ok(_) => {
                tracing::info!(order_id, "order cancelled");
                Ok(())
            }
            // Unknown order: it already filled or was cancelled elsewhere.
            Err(ApiError::Exchange(-2011, _)) => {
                tracing::warn!(order_id, "order already gone, treating cancel as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_orders(&self) -> Result<usize, ApiError> {
        self.ensure_connected()?;
        let result = retry::retry_with(
            2,
            Duration::from_secs(1),
            || async {
                self.rate_limiter.acquire_weight(1).await;
                let mut params = BTreeMap::new();
                params.insert("symbol", self.cfg.symbol.clone());
                self.send_signed::<Vec<serde_json::Value>>(
                    Method::DELETE,
                    "/api/v3/openOrders",
                    &mut params,
                )
                .await
            },
            || self.resync_clock(),
        )
        .await;

        match result {
            Ok(cancelled) => {
                tracing::info!(count = cancelled.len(), "cancelled all open orders");
                Ok(cancelled.len())
            }
            // No open orders to cancel.
            Err(ApiError::Exchange(-2011, _)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn nuke_all_orders(&self) -> Result<(), ApiError> {
        let orders = self.get_open_orders().await?;
        if orders.is_empty() {
            tracing::info!(symbol = %self.cfg.symbol, "no leftover orders to clear");
            return Ok(());
        }
        tracing::warn!(
            symbol = %self.cfg.symbol,
            count = orders.len(),
            "clearing leftover orders"
        );
        self.cancel_all_orders().await?;
        Ok(())
    }

    async fn cancel_far_orders(
        &self,
        current_price: Decimal,
        threshold: Decimal,
    ) -> Result<usize, ApiError> {
        if current_price <= Decimal::ZERO {
            return Ok(0);
        }
        let open_orders = self.get_open_orders().await?;
        let mut cancelled = 0usize;
        for order in open_orders {
            let deviation = (order.price - current_price).abs() / current_price;
            if deviation > threshold {
                tracing::debug!(
                    order_id = order.order_id,
                    price = %order.price,
                    deviation = %deviation,
                    "cancelling order far from market"
                );
                if let Err(e) = self.cancel_order(order.order_id).await {
                    tracing::error!(order_id = order.order_id, error = %e, "far-order cancel failed");
                    continue;
                }
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "far-order sweep complete");
        }
        Ok(cancelled)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ApiError> {
        self.ensure_connected()?;
        retry::retry_with(
            3,
            Duration::from_secs(1),
            || async {
                self.rate_limiter.acquire_weight(3).await;
                let mut params = BTreeMap::new();
                params.insert("symbol", self.cfg.symbol.clone());
                self.send_signed(Method::GET, "/api/v3/openOrders", &mut params)
                    .await
            },
            || self.resync_clock(),
        )
        .await
    }

    async fn get_bid_ask_spread(&self) -> Result<Decimal, ApiError> {
        let book = self.get_order_book(1).await?;
        let (Some(best_bid), Some(best_ask)) =
            (book.bids.first().map(|b| b.0), book.asks.first().map(|a| a.0))
        else {
            // No depth means no liquidity; report the maximum spread so the
            // strategy pauses.
            return Ok(dec!(1));
        };

        let mid = (best_bid + best_ask) / dec!(2);
        if mid == Decimal::ZERO {
            return Ok(dec!(1));
        }
        Ok((best_ask - best_bid) / mid)
    }

    async fn get_klines(&self, interval: &str, limit: u32) -> Result<Vec<Kline>, ApiError> {
        self.ensure_connected()?;
        let cache_key = format!("{}_{}", interval, limit);

        {
            let cache = self.klines_cache.lock().await;
            if let Some((cached_at, cached)) = cache.get(&cache_key) {
                if cached_at.elapsed() < KLINE_CACHE_TTL {
                    tracing::debug!(key = %cache_key, "kline cache hit");
                    return Ok(cached.clone());
                }
            }
        }

        let raw: Vec<RawKline> = retry::retry_with(
            3,
            Duration::from_secs(1),
            || async {
                self.rate_limiter.acquire_weight(2).await;
                let url = format!("{}/api/v3/klines", self.rest_base);
                self.send_public(
                    self.http
                        .get(&url)
                        .query(&[("symbol", self.cfg.symbol.as_str()), ("interval", interval)])
                        .query(&[("limit", limit)]),
                )
                .await
            },
            || self.resync_clock(),
        )
        .await?;

        let klines = raw
            .into_iter()
            .map(|k| k.into_kline(interval))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cache = self.klines_cache.lock().await;
        cache.insert(cache_key, (Instant::now(), klines.clone()));
        Ok(klines)
    }

    async fn get_symbol_price(&self) -> Result<Decimal, ApiError> {
        self.ensure_connected()?;
        self.rate_limiter.acquire_weight(1).await;
        let url = format!("{}/api/v3/ticker/price", self.rest_base);
        let ticker: TickerPrice = self
            .send_public(self.http.get(&url).query(&[("symbol", &self.cfg.symbol)]))
            .await?;
        Ok(ticker.price)
    }

    fn filters(&self) -> SymbolFilters {
        self.filters.read().expect("filters lock poisoned").clone()
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
