//! End-to-end grid strategy scenarios against an in-memory exchange.

use api_client::error::ApiError;
use api_client::rate_limiter::RateLimiter;
use api_client::streams::ExecutionReport;
use api_client::{ExchangeApi, OpenOrder, OrderResponse, SymbolFilters};
use async_trait::async_trait;
use core_types::{BotConfig, BotStatus, GridOrderStatus, Kline, OrderSide, StrategyType};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use strategies::{GridStrategy, Strategy, StrategyServices};

#[derive(Debug, Clone, PartialEq)]
struct PlacedOrder {
    order_id: i64,
    side: OrderSide,
    price: Decimal,
    quantity: Decimal,
}

/// Scriptable in-memory exchange double.
struct MockExchange {
    base_asset: &'static str,
    quote_asset: &'static str,
    filters: SymbolFilters,
    rate_limiter: RateLimiter,
    price: RwLock<Decimal>,
    spread: RwLock<Decimal>,
    balances: RwLock<std::collections::HashMap<String, Decimal>>,
    placed: Mutex<Vec<PlacedOrder>>,
    market_sells: Mutex<Vec<Decimal>>,
    market_buy_quote: Mutex<Vec<Decimal>>,
    cancel_all_calls: AtomicUsize,
    next_order_id: AtomicI64,
}

impl MockExchange {
    fn new(price: Decimal, base_balance: Decimal, quote_balance: Decimal) -> Arc<Self> {
        let mut balances = std::collections::HashMap::new();
        balances.insert("BTC".to_string(), base_balance);
        balances.insert("USDT".to_string(), quote_balance);
        Arc::new(Self {
            base_asset: "BTC",
            quote_asset: "USDT",
            filters: SymbolFilters {
                tick_size: dec!(0.01),
                step_size: dec!(0.000001),
                min_qty: dec!(0.000001),
                min_notional: dec!(5),
            },
            rate_limiter: RateLimiter::new(),
            price: RwLock::new(price),
            spread: RwLock::new(dec!(0.001)),
            balances: RwLock::new(balances),
            placed: Mutex::new(Vec::new()),
            market_sells: Mutex::new(Vec::new()),
            market_buy_quote: Mutex::new(Vec::new()),
            cancel_all_calls: AtomicUsize::new(0),
            next_order_id: AtomicI64::new(1),
        })
    }

    fn set_balance(&self, asset: &str, amount: Decimal) {
        self.balances
            .write()
            .unwrap()
            .insert(asset.to_string(), amount);
    }

    fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.placed.lock().unwrap().clone()
    }

    fn find_order(&self, side: OrderSide, price: Decimal) -> Option<PlacedOrder> {
        self.placed
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.side == side && o.price == price)
            .cloned()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ApiError> {
        Ok(*self
            .balances
            .read()
            .unwrap()
            .get(asset)
            .unwrap_or(&Decimal::ZERO))
    }

    async fn get_total_position_value(
        &self,
        price_hint: Option<Decimal>,
    ) -> Result<(Decimal, Decimal), ApiError> {
        let price = price_hint.unwrap_or(*self.price.read().unwrap());
        let base = self.get_free_balance(self.base_asset).await?;
        let quote = self.get_free_balance(self.quote_asset).await?;
        let position_value = base * price;
        Ok((position_value, quote + position_value))
    }

    async fn create_limit_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderResponse, ApiError> {
        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        self.placed.lock().unwrap().push(PlacedOrder {
            order_id,
            side,
            price,
            quantity,
        });
        Ok(OrderResponse {
            order_id,
            client_order_id: None,
            status: Some("NEW".to_string()),
            executed_qty: None,
            price: Some(price),
        })
    }

    async fn create_market_order(
        &self,
        side: OrderSide,
        quantity: Option<Decimal>,
        quote_quantity: Option<Decimal>,
    ) -> Result<OrderResponse, ApiError> {
        match side {
            OrderSide::Sell => self
                .market_sells
                .lock()
                .unwrap()
                .push(quantity.expect("market sell uses base quantity")),
            OrderSide::Buy => self
                .market_buy_quote
                .lock()
                .unwrap()
                .push(quote_quantity.expect("market buy uses quote quantity")),
        }
        Ok(OrderResponse {
            order_id: self.next_order_id.fetch_add(1, Ordering::SeqCst),
            client_order_id: None,
            status: Some("FILLED".to_string()),
            executed_qty: quantity,
            price: None,
        })
    }

    async fn cancel_order(&self, _order_id: i64) -> Result<(), ApiError> {
        Ok(())
    }

    async fn cancel_all_orders(&self) -> Result<usize, ApiError> {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn nuke_all_orders(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn cancel_far_orders(
        &self,
        _current_price: Decimal,
        _threshold: Decimal,
    ) -> Result<usize, ApiError> {
        Ok(0)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ApiError> {
        Ok(Vec::new())
    }

    async fn get_bid_ask_spread(&self) -> Result<Decimal, ApiError> {
        Ok(*self.spread.read().unwrap())
    }

    async fn get_klines(&self, _interval: &str, _limit: u32) -> Result<Vec<Kline>, ApiError> {
        Ok(Vec::new())
    }

    async fn get_symbol_price(&self) -> Result<Decimal, ApiError> {
        Ok(*self.price.read().unwrap())
    }

    fn filters(&self) -> SymbolFilters {
        self.filters.clone()
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}

fn bot_config(id: i64) -> BotConfig {
    BotConfig {
        id,
        user_id: 1,
        api_key_id: 1,
        name: format!("grid-{}", id),
        symbol: "BTCUSDT".to_string(),
        strategy_type: StrategyType::Grid,
        status: BotStatus::Idle,
        parameters: json!({}),
        base_asset: "BTC".to_string(),
        quote_asset: "USDT".to_string(),
        total_investment: dec!(100),
        total_pnl: Decimal::ZERO,
        is_testnet: true,
    }
}

fn grid_params(investment: Decimal, cooldown_seconds: u64) -> configuration::GridParameters {
    configuration::GridParameters::from_parameters(&json!({
        "grid_lower_price": "100",
        "grid_upper_price": "200",
        "grid_count": 10,
        "grid_investment_per_grid": investment.to_string(),
        "stop_loss_percent": "0.05",
        "trade_cooldown": cooldown_seconds,
    }))
    .unwrap()
}

fn temp_state_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("grid-scenario-{}-{}", tag, uuid::Uuid::new_v4()))
}

fn fill_report(order: &PlacedOrder, fill_price: Decimal) -> ExecutionReport {
    ExecutionReport {
        symbol: "BTCUSDT".to_string(),
        order_id: order.order_id,
        client_order_id: format!("LATTICE_{}", order.order_id),
        status: "FILLED".to_string(),
        side: order.side,
        last_fill_price: fill_price,
        cumulative_qty: order.quantity,
        fee: None,
        fee_asset: None,
    }
}

/// Grid generation: `count + 1` points, exact bounds, uniform spacing.
#[test]
fn grid_generation_is_uniform() {
    let params = grid_params(dec!(10), 0);
    let prices = GridStrategy::generate_grid(&params);

    assert_eq!(prices.len(), 11);
    assert_eq!(prices[0], dec!(100));
    assert_eq!(prices[10], dec!(200));
    for window in prices.windows(2) {
        assert_eq!(window[1] - window[0], dec!(10));
    }
}

/// Scenario: a tick below a grid line places the buy, the fill spawns the
/// companion sell one line up, and the sell fill books the paired profit.
#[tokio::test(start_paused = true)]
async fn clean_fill_cycle_books_paired_profit() {
    let exchange = MockExchange::new(dec!(130), Decimal::ZERO, dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(1),
        grid_params(dec!(10), 0),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("s1"),
    );

    strategy.initialize().await.unwrap();
    strategy.on_price_update(dec!(129.9)).await;

    // The nearest line below the market gets the first buy, sized from the
    // per-grid investment.
    let buy = exchange.find_order(OrderSide::Buy, dec!(120)).expect("buy at 120");
    assert_eq!(buy.quantity, dec!(0.083333));

    // Book uniqueness holds across the whole wall.
    let snapshot = strategy.snapshot().await;
    let mut prices: Vec<Decimal> = snapshot.orders.iter().map(|o| o.price).collect();
    prices.sort();
    prices.dedup();
    assert_eq!(prices.len(), snapshot.orders.len());
    assert!(snapshot.orders.len() <= 50);

    // The exchange credits the base asset, then reports the fill.
    exchange.set_balance("BTC", buy.quantity);
    strategy.on_order_update(&fill_report(&buy, dec!(120))).await;

    let sell = exchange.find_order(OrderSide::Sell, dec!(130)).expect("companion sell at 130");
    assert_eq!(sell.quantity, buy.quantity);
    let snapshot = strategy.snapshot().await;
    let companion = snapshot
        .orders
        .iter()
        .find(|o| o.side == OrderSide::Sell && o.price == dec!(130))
        .expect("companion tracked in the book");
    assert_eq!(companion.entry_price, Some(dec!(120)));

    // Sell fill: profit = (130 - 120) * qty, both legs leave the book.
    strategy.on_order_update(&fill_report(&sell, dec!(130))).await;
    let snapshot = strategy.snapshot().await;
    assert_eq!(snapshot.realized_profit, dec!(10) * buy.quantity);
    assert!(!snapshot.orders.iter().any(|o| o.price == dec!(120)));
    assert!(!snapshot.orders.iter().any(|o| o.price == dec!(130)));
}

/// Scenario: price under the stop-loss line cancels everything, liquidates
/// the base position and halts; a second trigger is a no-op.
#[tokio::test(start_paused = true)]
async fn stop_loss_exits_once_and_stays_down() {
    let exchange = MockExchange::new(dec!(130), dec!(0.5), dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(2),
        grid_params(dec!(10), 5),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("s2"),
    );

    strategy.initialize().await.unwrap();
    assert!(strategy.is_running());

    // Threshold is 100 * (1 - 0.05) = 95.
    strategy.on_price_update(dec!(94.9)).await;
    assert!(!strategy.is_running());
    assert_eq!(exchange.cancel_all_calls.load(Ordering::SeqCst), 1);
    assert_eq!(exchange.market_sells.lock().unwrap().as_slice(), &[dec!(0.5)]);

    // Second breach: nothing moves.
    strategy.on_price_update(dec!(94.8)).await;
    assert_eq!(exchange.cancel_all_calls.load(Ordering::SeqCst), 1);
    assert_eq!(exchange.market_sells.lock().unwrap().len(), 1);
}

/// Scenario: an order whose raw notional is under the exchange minimum gets
/// its quantity raised to `min_notional * 1.01 / price`.
#[tokio::test(start_paused = true)]
async fn notional_floor_raises_undersized_orders() {
    let exchange = MockExchange::new(dec!(100.5), Decimal::ZERO, dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(3),
        grid_params(dec!(1), 0),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("s3"),
    );

    strategy.initialize().await.unwrap();
    strategy.on_price_update(dec!(100.5)).await;

    let buy = exchange.find_order(OrderSide::Buy, dec!(100)).expect("buy at 100");
    // Raw qty would be 1/100 = 0.01 (notional 1); floored target is
    // 5 * 1.01 / 100.
    assert_eq!(buy.quantity, dec!(0.0505));
}

/// Scenario: two ticks inside one cooldown window submit exactly one order.
#[tokio::test(start_paused = true)]
async fn cooldown_suppresses_rapid_resubmission() {
    let exchange = MockExchange::new(dec!(130), Decimal::ZERO, dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(4),
        grid_params(dec!(10), 5),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("s4"),
    );

    strategy.initialize().await.unwrap();

    strategy.on_price_update(dec!(115)).await;
    assert_eq!(exchange.placed_orders().len(), 1);

    // Different unfilled line, same cooldown window: suppressed.
    strategy.on_price_update(dec!(125)).await;
    assert_eq!(exchange.placed_orders().len(), 1);
}

/// A fill that lands after shutdown is recorded but must not spawn a
/// companion order.
#[tokio::test(start_paused = true)]
async fn late_fill_after_shutdown_places_no_companion() {
    let exchange = MockExchange::new(dec!(130), Decimal::ZERO, dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(5),
        grid_params(dec!(10), 0),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("s5"),
    );

    strategy.initialize().await.unwrap();
    strategy.on_price_update(dec!(129.9)).await;
    let buy = exchange.find_order(OrderSide::Buy, dec!(120)).expect("buy at 120");

    strategy.stop().await;
    let before = exchange.placed_orders().len();

    exchange.set_balance("BTC", buy.quantity);
    strategy.on_order_update(&fill_report(&buy, dec!(120))).await;

    // Recorded as filled, but no new sell was submitted.
    assert_eq!(exchange.placed_orders().len(), before);
    let snapshot = strategy.snapshot().await;
    let filled = snapshot
        .orders
        .iter()
        .find(|o| o.price == dec!(120))
        .expect("fill retained in the book");
    assert_eq!(filled.status, GridOrderStatus::Filled);
}

/// Panic close liquidates the full position and rejects dust books.
#[tokio::test(start_paused = true)]
async fn panic_close_liquidates_or_rejects_dust() {
    let exchange = MockExchange::new(dec!(130), dec!(0.5), dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(6),
        grid_params(dec!(10), 5),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("s6"),
    );
    strategy.initialize().await.unwrap();

    strategy.on_price_update(dec!(130.5)).await;
    strategy.panic_close().await.unwrap();
    assert!(!strategy.is_running());
    assert_eq!(exchange.market_sells.lock().unwrap().as_slice(), &[dec!(0.5)]);
    assert!(strategy.snapshot().await.orders.is_empty());

    // A dust position (notional under the minimum) is rejected.
    let exchange = MockExchange::new(dec!(130), dec!(0.00001), dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(7),
        grid_params(dec!(10), 5),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("s6-dust"),
    );
    strategy.initialize().await.unwrap();
    strategy.on_price_update(dec!(130.5)).await;
    assert!(strategy.panic_close().await.is_err());
    assert!(exchange.market_sells.lock().unwrap().is_empty());
}

/// Gap check: a market trading outside the configured range refuses to start.
#[tokio::test(start_paused = true)]
async fn gap_check_refuses_out_of_range_start() {
    let exchange = MockExchange::new(dec!(250), Decimal::ZERO, dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(8),
        grid_params(dec!(10), 5),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("gap"),
    );

    assert!(strategy.initialize().await.is_err());
    assert!(!strategy.is_running());
    assert!(exchange.placed_orders().is_empty());
}

/// Bootstrapping: starting with no base inventory market-buys the shortfall
/// needed to fund the sell wall.
#[tokio::test(start_paused = true)]
async fn fresh_start_bootstraps_sell_wall_inventory() {
    let exchange = MockExchange::new(dec!(130), Decimal::ZERO, dec!(10000));
    let strategy = GridStrategy::new(
        bot_config(9),
        grid_params(dec!(10), 5),
        exchange.clone(),
        StrategyServices::default(),
        &temp_state_dir("bootstrap"),
    );

    strategy.initialize().await.unwrap();

    let buys = exchange.market_buy_quote.lock().unwrap();
    assert_eq!(buys.len(), 1);
    // Shortfall = sum over lines above 130 of 10/(line - 10), bought with a
    // 2% buffer at the current price.
    let expected: Decimal = [dec!(140), dec!(150), dec!(160), dec!(170), dec!(180), dec!(190), dec!(200)]
        .iter()
        .map(|line| dec!(10) / (*line - dec!(10)))
        .sum::<Decimal>()
        * dec!(130)
        * dec!(1.02);
    assert_eq!(buys[0], expected);
}

/// Crash recovery: the state file round-trips the book and the profit.
#[tokio::test(start_paused = true)]
async fn restart_restores_orders_and_profit() {
    let state_dir = temp_state_dir("restore");
    let exchange = MockExchange::new(dec!(130), Decimal::ZERO, dec!(1000));
    let strategy = GridStrategy::new(
        bot_config(10),
        grid_params(dec!(10), 0),
        exchange.clone(),
        StrategyServices::default(),
        &state_dir,
    );

    strategy.initialize().await.unwrap();
    strategy.on_price_update(dec!(129.9)).await;
    let buy = exchange.find_order(OrderSide::Buy, dec!(120)).expect("buy at 120");
    exchange.set_balance("BTC", buy.quantity);
    strategy.on_order_update(&fill_report(&buy, dec!(120))).await;
    let sell = exchange.find_order(OrderSide::Sell, dec!(130)).expect("sell at 130");
    strategy.on_order_update(&fill_report(&sell, dec!(130))).await;
    let before = strategy.snapshot().await;
    strategy.stop().await;

    // A new instance over the same state dir picks up where we left off.
    let exchange2 = MockExchange::new(dec!(130), Decimal::ZERO, dec!(1000));
    let restored = GridStrategy::new(
        bot_config(10),
        grid_params(dec!(10), 0),
        exchange2.clone(),
        StrategyServices::default(),
        &state_dir,
    );
    restored.initialize().await.unwrap();

    let after = restored.snapshot().await;
    assert_eq!(after.realized_profit, before.realized_profit);
    assert_eq!(after.orders.len(), before.orders.len());
}
