//! Grid trading strategy.
//!
//! An arithmetic grid between a lower and upper bound: buys are posted on
//! lines below the market, each filled buy posts a companion sell one line
//! up, and the spread between the pair is booked as realized profit when the
//! sell fills. Risk gates (stop-loss, take-profit, drawdown, spread, reserve,
//! position ratio) run on every tick, and the adaptive analyzer reshapes the
//! grid as the market regime changes.

use crate::error::StrategyError;
use crate::state::{self, PersistedOrder, PersistedState};
use crate::{Strategy, StrategyServices};
use analyzer::{GridAdjustment, MarketAnalyzer, MarketState};
use api_client::streams::ExecutionReport;
use api_client::ExchangeApi;
use async_trait::async_trait;
use chrono::Utc;
use configuration::GridParameters;
use core_types::{BotConfig, GridOrderStatus, OrderSide, TradeRecord};
use events::{NotificationLevel, TradeEvent, TradeEventKind};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Spread lookups cost order-book weight; cache them briefly.
const SPREAD_CACHE_TTL: Duration = Duration::from_secs(5);
/// Orders deviating more than this from the market get swept by the
/// analysis loop.
const FAR_ORDER_THRESHOLD: Decimal = dec!(0.05);
/// Stagger between wall placements to stay clear of the order burst limit.
const PLACEMENT_STAGGER: Duration = Duration::from_millis(150);
/// Let the exchange settle the buy before the companion sell goes out.
const COMPANION_SETTLE_DELAY: Duration = Duration::from_millis(200);
/// Let the sockets stabilise before the first analysis pass.
const ANALYSIS_STARTUP_DELAY: Duration = Duration::from_secs(10);
/// Quote requirement multiplier covering exchange fees.
const FEE_RESERVE: Decimal = dec!(1.002);
/// Bump undersized orders 1% past the minimum notional so a tick of price
/// movement cannot push them back under it.
const NOTIONAL_BUFFER: Decimal = dec!(1.01);
/// Price buffer on the bootstrap market buy.
const BOOTSTRAP_PRICE_BUFFER: Decimal = dec!(1.02);
/// An order within this fraction of the dynamic step occupies the line.
const OCCUPANCY_TOLERANCE: Decimal = dec!(0.1);

/// One tracked order on a grid line.
#[derive(Debug, Clone, PartialEq)]
pub struct GridOrder {
    pub grid_index: i64,
    pub price: Decimal,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_id: Option<i64>,
    pub status: GridOrderStatus,
    /// For sells: the cost basis of the inventory being sold.
    pub entry_price: Option<Decimal>,
}

impl From<PersistedOrder> for GridOrder {
    fn from(order: PersistedOrder) -> Self {
        Self {
            grid_index: order.grid_index,
            price: order.price,
            side: order.side,
            quantity: order.quantity,
            order_id: order.order_id,
            status: order.status,
            entry_price: order.entry_price,
        }
    }
}

impl From<&GridOrder> for PersistedOrder {
    fn from(order: &GridOrder) -> Self {
        Self {
            grid_index: order.grid_index,
            price: order.price,
            side: order.side,
            quantity: order.quantity,
            order_id: order.order_id,
            status: order.status,
            entry_price: order.entry_price,
        }
    }
}

/// Point-in-time view of the strategy for the admin surface.
#[derive(Debug, Clone)]
pub struct StrategySnapshot {
    pub running: bool,
    pub last_price: Decimal,
    pub realized_profit: Decimal,
    pub martin_level: u32,
    pub orders: Vec<GridOrder>,
}

/// Mutable trading state, guarded by one async mutex so tick and order-event
/// handling never overlap for the same bot.
#[derive(Default)]
struct GridBook {
    orders: BTreeMap<Decimal, GridOrder>,
    realized_profit: Decimal,
    last_price: Decimal,
    martin_level: u32,
    last_trade_at: Option<Instant>,
    initial_equity: Option<Decimal>,
}

impl GridBook {
    fn pending_count(&self) -> usize {
        self.orders
            .values()
            .filter(|o| o.status == GridOrderStatus::Pending)
            .count()
    }

    fn pending_buy_exposure(&self) -> Decimal {
        self.orders
            .values()
            .filter(|o| o.status == GridOrderStatus::Pending && o.side == OrderSide::Buy)
            .map(|o| o.quantity * o.price)
            .sum()
    }

    fn has_pending_near(&self, line: Decimal, tolerance: Decimal) -> bool {
        self.orders.values().any(|o| {
            o.status == GridOrderStatus::Pending && (o.price - line).abs() < tolerance
        })
    }

    fn has_buy_near(&self, line: Decimal, tolerance: Decimal) -> bool {
        self.orders.values().any(|o| {
            o.side == OrderSide::Buy
                && matches!(o.status, GridOrderStatus::Pending | GridOrderStatus::Filled)
                && (o.price - line).abs() < tolerance
        })
    }
}

#[derive(Default)]
struct SpreadCache {
    value: Decimal,
    fetched_at: Option<Instant>,
}

/// How the cooldown gate reacts when the window has not elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CooldownPolicy {
    /// Skip the placement; the next tick will retry.
    Skip,
    /// Sleep out the remainder; companion sells must not be dropped.
    Wait,
}

/// Removes its `(grid_index, side)` entry from the lock set on drop, so a
/// placement aborted on any gate always releases the line.
struct CreationLockGuard<'a> {
    locks: &'a StdMutex<HashSet<(i64, OrderSide)>>,
    key: (i64, OrderSide),
}

impl Drop for CreationLockGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .lock()
            .expect("creation lock poisoned")
            .remove(&self.key);
    }
}

pub struct GridStrategy {
    weak_self: Weak<GridStrategy>,
    config: BotConfig,
    params: GridParameters,
    client: Arc<dyn ExchangeApi>,
    services: StrategyServices,
    state_file: PathBuf,
    grid_prices: Vec<Decimal>,
    running: AtomicBool,
    state: Mutex<GridBook>,
    creation_locks: StdMutex<HashSet<(i64, OrderSide)>>,
    spread_cache: Mutex<SpreadCache>,
    adjustment: StdRwLock<Option<(GridAdjustment, Instant)>>,
    analyzer: Mutex<MarketAnalyzer>,
    analysis_task: StdMutex<Option<JoinHandle<()>>>,
}

impl GridStrategy {
    pub fn new(
        config: BotConfig,
        params: GridParameters,
        client: Arc<dyn ExchangeApi>,
        services: StrategyServices,
        state_dir: &Path,
    ) -> Arc<Self> {
        let grid_prices = Self::generate_grid(&params);
        let decay_min = params.decay_min_multiplier;
        let state_file = state::state_file_path(state_dir, config.id);

        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            config,
            params,
            client,
            services,
            state_file,
            grid_prices,
            running: AtomicBool::new(false),
            state: Mutex::new(GridBook::default()),
            creation_locks: StdMutex::new(HashSet::new()),
            spread_cache: Mutex::new(SpreadCache::default()),
            adjustment: StdRwLock::new(None),
            analyzer: Mutex::new(MarketAnalyzer::new(decay_min)),
            analysis_task: StdMutex::new(None),
        })
    }

    /// `grid_count + 1` equally spaced price points from `lower` to `upper`.
    pub fn generate_grid(params: &GridParameters) -> Vec<Decimal> {
        let step = params.base_step();
        (0..=params.grid_count)
            .map(|i| params.lower + step * Decimal::from(i))
            .collect()
    }

    pub async fn snapshot(&self) -> StrategySnapshot {
        let book = self.state.lock().await;
        StrategySnapshot {
            running: self.is_running(),
            last_price: book.last_price,
            realized_profit: book.realized_profit,
            martin_level: book.martin_level,
            orders: book.orders.values().cloned().collect(),
        }
    }

    // ==================================================
    // Initialisation
    // ==================================================

    async fn restore_state(&self) -> bool {
        match state::load(&self.state_file).await {
            Ok(Some(persisted)) => {
                let mut book = self.state.lock().await;
                book.realized_profit = persisted.realized_profit;
                book.last_price = persisted.last_price;
                for (_, order) in persisted.orders {
                    let order = GridOrder::from(order);
                    book.orders.insert(order.price, order);
                }
                tracing::info!(
                    bot_id = self.config.id,
                    orders = book.orders.len(),
                    realized_profit = %book.realized_profit,
                    "restored previous strategy state"
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!(bot_id = self.config.id, error = %e, "state restore failed");
                false
            }
        }
    }

    /// Acquire enough base asset to post the full sell wall above the
    /// current price. Refuses to start on a partial buy outside testnet.
    async fn bootstrap_base_inventory(&self, price: Decimal) -> Result<(), StrategyError> {
        let step = self.params.base_step();
        let mut required_base = Decimal::ZERO;
        for line in &self.grid_prices {
            if *line > price {
                required_base += self.params.investment_per_grid / (*line - step);
            }
        }
        if required_base <= Decimal::ZERO {
            return Ok(());
        }

        let free_base = self.client.get_free_balance(&self.config.base_asset).await?;
        let shortfall = required_base - free_base;
        if shortfall <= Decimal::ZERO {
            tracing::debug!(bot_id = self.config.id, "sell wall already funded");
            return Ok(());
        }

        let filters = self.client.filters();
        if shortfall * price < filters.min_notional {
            tracing::debug!(
                bot_id = self.config.id,
                "bootstrap shortfall below minimum notional, skipping"
            );
            return Ok(());
        }

        let mut cost = shortfall * price * BOOTSTRAP_PRICE_BUFFER;
        let free_quote = self.client.get_free_balance(&self.config.quote_asset).await?;
        if cost > free_quote {
            if self.config.is_testnet {
                tracing::warn!(
                    bot_id = self.config.id,
                    cost = %cost,
                    free_quote = %free_quote,
                    "quote ceiling reached, bootstrapping partially on testnet"
                );
                cost = free_quote;
            } else {
                return Err(StrategyError::InsufficientFunds(format!(
                    "bootstrap needs {} {} but only {} is free",
                    cost, self.config.quote_asset, free_quote
                )));
            }
        }
        if cost <= Decimal::ZERO {
            return Ok(());
        }

        tracing::info!(
            bot_id = self.config.id,
            shortfall = %shortfall,
            cost = %cost,
            "bootstrapping base inventory for the sell wall"
        );
        self.client
            .create_market_order(OrderSide::Buy, None, Some(cost))
            .await?;
        self.notify(
            NotificationLevel::Info,
            "Bootstrap buy executed",
            format!(
                "bought ~{} {} to fund the sell wall",
                shortfall, self.config.base_asset
            ),
        );
        Ok(())
    }

    async fn start(&self, price: Decimal) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(bot_id = self.config.id, "grid strategy started");

        match self.client.get_total_position_value(Some(price)).await {
            Ok((_, total_value)) => {
                self.state.lock().await.initial_equity = Some(total_value);
                tracing::info!(
                    bot_id = self.config.id,
                    equity = %total_value,
                    "initial equity recorded"
                );
            }
            Err(e) => {
                tracing::warn!(bot_id = self.config.id, error = %e, "initial equity snapshot failed");
            }
        }

        if self.params.adaptive_mode {
            self.spawn_analysis_loop();
            tracing::info!(
                bot_id = self.config.id,
                interval_secs = self.params.analysis_interval_seconds,
                "adaptive market analysis enabled"
            );
        }
    }

    // ==================================================
    // Adaptive analysis loop
    // ==================================================

    fn spawn_analysis_loop(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(ANALYSIS_STARTUP_DELAY).await;
            while this.running.load(Ordering::SeqCst) {
                if let Err(e) = this.run_analysis_cycle().await {
                    tracing::error!(bot_id = this.config.id, error = %e, "market analysis failed");
                }
                tokio::time::sleep(Duration::from_secs(this.params.analysis_interval_seconds))
                    .await;
            }
        });
        *self.analysis_task.lock().expect("analysis task lock poisoned") = Some(task);
    }

    async fn run_analysis_cycle(&self) -> Result<(), StrategyError> {
        let last_price = self.state.lock().await.last_price;
        let price_hint = (last_price > Decimal::ZERO).then_some(last_price);

        let (position_value, total_value) =
            self.client.get_total_position_value(price_hint).await?;
        let position_ratio = if total_value > Decimal::ZERO {
            position_value / total_value
        } else {
            Decimal::ZERO
        };

        // Multi-timeframe confirmation: 1h for regime, 15m as a sanity check.
        let klines_big = self.client.get_klines("1h", 50).await?;
        let klines_small = self.client.get_klines("15m", 50).await?;

        let (old_state, adjustment) = {
            let mut analyzer = self.analyzer.lock().await;
            let old_state = analyzer.current_state();
            let adjustment = analyzer.analyze(&klines_big, Some(&klines_small), position_ratio);
            (old_state, adjustment)
        };

        if adjustment.state != old_state {
            self.notify(
                NotificationLevel::Info,
                "Market regime switched",
                format!(
                    "{} -> {} (density {}x, investment {}x, paused: {})",
                    old_state,
                    adjustment.state,
                    adjustment.density_multiplier,
                    adjustment.investment_multiplier,
                    adjustment.should_pause
                ),
            );
        }
        tracing::info!(
            bot_id = self.config.id,
            state = %adjustment.state,
            density = %adjustment.density_multiplier,
            investment = %adjustment.investment_multiplier,
            pause = adjustment.should_pause,
            "market analysis complete"
        );

        *self.adjustment.write().expect("adjustment lock poisoned") =
            Some((adjustment, Instant::now()));

        // Sweep orders that drifted far from the market, then reconcile the
        // local book with what the exchange still knows.
        if last_price > Decimal::ZERO {
            let cancelled = self
                .client
                .cancel_far_orders(last_price, FAR_ORDER_THRESHOLD)
                .await?;
            if cancelled > 0 {
                self.sync_orders_with_exchange().await?;
            }
        }
        Ok(())
    }

    /// Drops local PENDING orders the exchange no longer reports.
    async fn sync_orders_with_exchange(&self) -> Result<(), StrategyError> {
        let open_orders = self.client.get_open_orders().await?;
        let open_ids: HashSet<i64> = open_orders.iter().map(|o| o.order_id).collect();

        let mut book = self.state.lock().await;
        let stale_keys: Vec<Decimal> = book
            .orders
            .iter()
            .filter(|(_, o)| {
                o.status == GridOrderStatus::Pending
                    && o.order_id.is_none_or(|id| !open_ids.contains(&id))
            })
            .map(|(key, _)| *key)
            .collect();

        if stale_keys.is_empty() {
            return Ok(());
        }
        for key in &stale_keys {
            tracing::info!(bot_id = self.config.id, price = %key, "pruning order unknown to exchange");
            book.orders.remove(key);
        }
        self.save_state(&book).await;
        Ok(())
    }

    // ==================================================
    // Tick evaluation
    // ==================================================

    fn effective_adjustment(&self) -> GridAdjustment {
        self.adjustment
            .read()
            .expect("adjustment lock poisoned")
            .as_ref()
            .map(|(adjustment, _)| adjustment.clone())
            .unwrap_or_else(|| GridAdjustment::neutral(MarketState::LowVolRange))
    }

    async fn check_stop_loss(&self, book: &mut GridBook, price: Decimal) -> bool {
        let stop_price = self.grid_prices[0] * (Decimal::ONE - self.params.stop_loss_percent);
        if price > stop_price {
            return false;
        }
        tracing::error!(
            bot_id = self.config.id,
            price = %price,
            stop_price = %stop_price,
            "stop loss breached"
        );
        self.emergency_exit(book, "stop loss triggered").await;
        true
    }

    async fn check_take_profit(&self, book: &mut GridBook) -> bool {
        if book.realized_profit < self.params.take_profit_amount {
            return false;
        }
        tracing::info!(
            bot_id = self.config.id,
            realized_profit = %book.realized_profit,
            target = %self.params.take_profit_amount,
            "take profit reached"
        );
        self.emergency_exit(book, "take profit reached").await;
        true
    }

    async fn check_max_drawdown(&self, book: &mut GridBook, price: Decimal) -> bool {
        let Some(initial_equity) = book.initial_equity else {
            return false;
        };
        if initial_equity <= Decimal::ZERO || price <= Decimal::ZERO {
            return false;
        }

        match self.client.get_total_position_value(Some(price)).await {
            Ok((_, total_value)) => {
                let drawdown = (initial_equity - total_value) / initial_equity;
                if drawdown >= self.params.max_drawdown {
                    tracing::error!(
                        bot_id = self.config.id,
                        drawdown = %drawdown,
                        limit = %self.params.max_drawdown,
                        "account drawdown limit breached"
                    );
                    self.emergency_exit(book, "max drawdown breached").await;
                    return true;
                }
                false
            }
            Err(e) => {
                tracing::error!(bot_id = self.config.id, error = %e, "drawdown check failed");
                false
            }
        }
    }

    async fn evaluate_grid(&self, book: &mut GridBook, price: Decimal, adjustment: &GridAdjustment) {
        let density = adjustment.density_multiplier;
        if density <= Decimal::ZERO {
            return;
        }
        let dynamic_step = self.params.base_step() / density;
        if dynamic_step <= Decimal::ZERO {
            return;
        }
        let tolerance = dynamic_step * OCCUPANCY_TOLERANCE;

        let mut buy_candidates = Vec::new();
        let mut sell_candidates = Vec::new();
        let mut check_price = self.params.lower;
        while check_price <= self.params.upper {
            let grid_index = ((check_price - self.params.lower) / dynamic_step)
                .to_i64()
                .unwrap_or(0);
            if check_price > price {
                if !book.has_pending_near(check_price, tolerance) {
                    sell_candidates.push((grid_index, check_price));
                }
            } else if check_price < price && !book.has_buy_near(check_price, tolerance) {
                buy_candidates.push((grid_index, check_price));
            }
            check_price += dynamic_step;
        }

        // Work outward from the market: the nearest line below gets the first
        // buy, the nearest line above the first sell.
        buy_candidates.reverse();

        for (grid_index, line) in buy_candidates {
            let placed = self
                .try_place_order(
                    book,
                    OrderSide::Buy,
                    grid_index,
                    line,
                    None,
                    None,
                    CooldownPolicy::Skip,
                )
                .await;
            if placed {
                tokio::time::sleep(PLACEMENT_STAGGER).await;
            }
        }

        for (grid_index, line) in sell_candidates {
            // Wall inventory came from the line below; book that as cost.
            let entry_price = line - dynamic_step;
            let placed = self
                .try_place_order(
                    book,
                    OrderSide::Sell,
                    grid_index,
                    line,
                    Some(entry_price),
                    None,
                    CooldownPolicy::Skip,
                )
                .await;
            if placed {
                tokio::time::sleep(PLACEMENT_STAGGER).await;
            }
        }
    }

    // ==================================================
    // Order placement
    // ==================================================

    fn acquire_creation_lock(
        &self,
        grid_index: i64,
        side: OrderSide,
    ) -> Option<CreationLockGuard<'_>> {
        let key = (grid_index, side);
        let mut locks = self.creation_locks.lock().expect("creation lock poisoned");
        if locks.insert(key) {
            Some(CreationLockGuard {
                locks: &self.creation_locks,
                key,
            })
        } else {
            tracing::debug!(grid_index, side = side.as_str(), "placement already in flight");
            None
        }
    }

    /// Bid-ask spread, refreshed at most every [`SPREAD_CACHE_TTL`].
    async fn current_spread(&self) -> Decimal {
        let mut cache = self.spread_cache.lock().await;
        let needs_refresh = cache
            .fetched_at
            .is_none_or(|at| at.elapsed() > SPREAD_CACHE_TTL);
        if needs_refresh {
            match self.client.get_bid_ask_spread().await {
                Ok(spread) => {
                    cache.value = spread;
                    cache.fetched_at = Some(Instant::now());
                }
                Err(e) => {
                    tracing::error!(bot_id = self.config.id, error = %e, "spread refresh failed");
                }
            }
        }
        cache.value
    }

    /// Runs the placement gates in order and submits the order when they all
    /// pass. Returns whether an order was submitted.
    #[allow(clippy::too_many_arguments)]
    async fn try_place_order(
        &self,
        book: &mut GridBook,
        side: OrderSide,
        grid_index: i64,
        price: Decimal,
        entry_price: Option<Decimal>,
        quantity_override: Option<Decimal>,
        cooldown: CooldownPolicy,
    ) -> bool {
        // 1. One in-flight placement per (line, side).
        let Some(_lock) = self.acquire_creation_lock(grid_index, side) else {
            return false;
        };

        // 2. Spread guard.
        let spread = self.current_spread().await;
        if spread > self.params.max_spread_percent {
            tracing::warn!(
                bot_id = self.config.id,
                spread = %spread,
                limit = %self.params.max_spread_percent,
                "spread too wide, holding placements"
            );
            return false;
        }

        let filters = self.client.filters();

        let free_base = if side == OrderSide::Sell {
            match self.client.get_free_balance(&self.config.base_asset).await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    tracing::error!(bot_id = self.config.id, error = %e, "base balance read failed");
                    return false;
                }
            }
        } else {
            None
        };

        if side == OrderSide::Buy {
            // 3. Reserve: keep a fraction of total funds liquid.
            let free_quote = match self.client.get_free_balance(&self.config.quote_asset).await {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::error!(bot_id = self.config.id, error = %e, "quote balance read failed");
                    return false;
                }
            };
            let total_funds = free_quote + book.pending_buy_exposure();
            if free_quote < total_funds * self.params.reserve_ratio {
                tracing::warn!(
                    bot_id = self.config.id,
                    free_quote = %free_quote,
                    "free quote below reserve requirement, holding buys"
                );
                return false;
            }

            // 4. Position ratio ceiling.
            match self.client.get_total_position_value(Some(price)).await {
                Ok((position_value, total_value)) if total_value > Decimal::ZERO => {
                    let ratio = position_value / total_value;
                    if ratio >= self.params.max_position_ratio {
                        tracing::warn!(
                            bot_id = self.config.id,
                            ratio = %ratio,
                            limit = %self.params.max_position_ratio,
                            "position ratio over limit, holding buys"
                        );
                        return false;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(bot_id = self.config.id, error = %e, "position ratio check failed");
                    return false;
                }
            }
        }

        // 5. Open-order ceiling.
        if book.pending_count() >= self.params.max_order_count as usize {
            tracing::warn!(
                bot_id = self.config.id,
                pending = book.pending_count(),
                limit = self.params.max_order_count,
                "open-order ceiling reached"
            );
            return false;
        }

        // 6. Weight circuit breaker: non-essential buys are shed first.
        if side == OrderSide::Buy && self.client.rate_limiter().is_in_circuit_breaker() {
            tracing::warn!(bot_id = self.config.id, "weight circuit breaker open, skipping buy");
            return false;
        }

        // 7. Trade cooldown.
        if let Some(last_trade_at) = book.last_trade_at {
            let window = Duration::from_secs(self.params.trade_cooldown_seconds);
            let elapsed = last_trade_at.elapsed();
            if elapsed < window {
                match cooldown {
                    CooldownPolicy::Skip => return false,
                    CooldownPolicy::Wait => tokio::time::sleep(window - elapsed).await,
                }
            }
        }

        // 8. Investment sizing with the martingale cap.
        let adjustment = self.effective_adjustment();
        let mut quantity = match quantity_override {
            Some(quantity) => quantity,
            None => {
                let mut investment =
                    self.params.investment_per_grid * adjustment.investment_multiplier;
                investment =
                    investment.min(self.params.investment_per_grid * self.params.martin_multiplier);
                if book.martin_level >= self.params.max_martin_levels {
                    tracing::warn!(
                        bot_id = self.config.id,
                        level = book.martin_level,
                        "martingale ceiling reached, reverting to baseline investment"
                    );
                    investment = self.params.investment_per_grid;
                }
                investment / price
            }
        };

        // Sells can never exceed the owned inventory.
        if let Some(free_base) = free_base {
            if quantity > free_base {
                quantity = free_base;
            }
        }

        // 9. Notional floor.
        if quantity * price < filters.min_notional {
            let target = filters.min_notional * NOTIONAL_BUFFER / price;
            if let Some(free_base) = free_base {
                if target > free_base {
                    tracing::debug!(
                        bot_id = self.config.id,
                        price = %price,
                        "not enough base inventory to reach minimum notional"
                    );
                    return false;
                }
            }
            quantity = target;
        }

        // 10. Quantise and submit.
        let quantity = filters.floor_quantity(quantity);
        if quantity <= Decimal::ZERO || quantity < filters.min_qty {
            return false;
        }

        match self.client.create_limit_order(side, price, quantity).await {
            Ok(order) => {
                book.last_trade_at = Some(Instant::now());
                book.orders.insert(
                    price,
                    GridOrder {
                        grid_index,
                        price,
                        side,
                        quantity,
                        order_id: Some(order.order_id),
                        status: GridOrderStatus::Pending,
                        entry_price,
                    },
                );
                if side == OrderSide::Buy {
                    if adjustment.investment_multiplier > Decimal::ONE {
                        book.martin_level += 1;
                    } else {
                        book.martin_level = 0;
                    }
                }
                tracing::info!(
                    bot_id = self.config.id,
                    side = side.as_str(),
                    grid_index,
                    price = %price,
                    quantity = %quantity,
                    "grid order placed"
                );
                self.save_state(book).await;
                true
            }
            Err(e) => {
                tracing::error!(
                    bot_id = self.config.id,
                    side = side.as_str(),
                    grid_index,
                    price = %price,
                    error = %e,
                    "grid order placement failed"
                );
                false
            }
        }
    }

    /// Posts the companion sell one grid line above a filled buy.
    async fn place_companion_sell(
        &self,
        book: &mut GridBook,
        grid_index: i64,
        buy_price: Decimal,
        quantity: Decimal,
    ) {
        let sell_index = grid_index + 1;
        let sell_price = match self.grid_prices.get(sell_index as usize) {
            Some(price) => *price,
            // Already at the top line: one step above the actual fill.
            None => buy_price + self.params.base_step(),
        };

        let Some(_lock) = self.acquire_creation_lock(grid_index, OrderSide::Sell) else {
            return;
        };

        tokio::time::sleep(COMPANION_SETTLE_DELAY).await;

        // Companion sells queue behind the cooldown instead of dropping.
        if let Some(last_trade_at) = book.last_trade_at {
            let window = Duration::from_secs(self.params.trade_cooldown_seconds);
            let elapsed = last_trade_at.elapsed();
            if elapsed < window {
                tokio::time::sleep(window - elapsed).await;
            }
        }

        let filters = self.client.filters();
        let free_base = match self.client.get_free_balance(&self.config.base_asset).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!(bot_id = self.config.id, error = %e, "base balance read failed");
                return;
            }
        };

        let mut sell_quantity = quantity;
        if sell_quantity > free_base {
            tracing::warn!(
                bot_id = self.config.id,
                wanted = %sell_quantity,
                free = %free_base,
                "shrinking companion sell to available inventory"
            );
            sell_quantity = free_base;
        }

        if sell_quantity * sell_price < filters.min_notional {
            let target = filters.min_notional * NOTIONAL_BUFFER / sell_price;
            if target > free_base {
                tracing::warn!(
                    bot_id = self.config.id,
                    "cannot reach minimum notional for companion sell, dropping"
                );
                return;
            }
            sell_quantity = target;
        }

        let sell_quantity = filters.floor_quantity(sell_quantity);
        if sell_quantity <= Decimal::ZERO {
            return;
        }

        match self
            .client
            .create_limit_order(OrderSide::Sell, sell_price, sell_quantity)
            .await
        {
            Ok(order) => {
                book.last_trade_at = Some(Instant::now());
                book.orders.insert(
                    sell_price,
                    GridOrder {
                        grid_index,
                        price: sell_price,
                        side: OrderSide::Sell,
                        quantity: sell_quantity,
                        order_id: Some(order.order_id),
                        status: GridOrderStatus::Pending,
                        entry_price: Some(buy_price),
                    },
                );
                tracing::info!(
                    bot_id = self.config.id,
                    grid_index,
                    sell_price = %sell_price,
                    quantity = %sell_quantity,
                    entry_price = %buy_price,
                    "companion sell placed"
                );
                self.save_state(book).await;
            }
            Err(e) => {
                tracing::error!(
                    bot_id = self.config.id,
                    grid_index,
                    error = %e,
                    "companion sell placement failed"
                );
            }
        }
    }

    // ==================================================
    // Emergency handling
    // ==================================================

    async fn emergency_exit(&self, book: &mut GridBook, reason: &str) {
        // A second trigger is a no-op.
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::error!(bot_id = self.config.id, reason, "emergency exit engaged");

        if let Err(e) = self.client.cancel_all_orders().await {
            tracing::error!(bot_id = self.config.id, error = %e, "emergency cancel failed");
        }

        match self.client.get_free_balance(&self.config.base_asset).await {
            Ok(free_base) => {
                let filters = self.client.filters();
                let quantity = filters.floor_quantity(free_base);
                let reference_price = book.last_price;
                let sellable = quantity > Decimal::ZERO
                    && (reference_price <= Decimal::ZERO
                        || quantity * reference_price >= filters.min_notional);
                if sellable {
                    tracing::info!(
                        bot_id = self.config.id,
                        quantity = %quantity,
                        "liquidating base position"
                    );
                    if let Err(e) = self
                        .client
                        .create_market_order(OrderSide::Sell, Some(quantity), None)
                        .await
                    {
                        tracing::error!(bot_id = self.config.id, error = %e, "liquidation failed");
                    }
                } else if quantity > Decimal::ZERO {
                    tracing::warn!(
                        bot_id = self.config.id,
                        quantity = %quantity,
                        "residual base position below minimum notional, left as dust"
                    );
                }
            }
            Err(e) => {
                tracing::error!(bot_id = self.config.id, error = %e, "balance read failed during exit");
            }
        }

        self.notify(
            NotificationLevel::Critical,
            "Emergency exit",
            format!(
                "reason: {}; last price {}; realized profit {}",
                reason, book.last_price, book.realized_profit
            ),
        );
        self.save_state(book).await;
    }

    // ==================================================
    // Persistence & reporting
    // ==================================================

    async fn save_state(&self, book: &GridBook) {
        let persisted = PersistedState {
            realized_profit: book.realized_profit,
            last_price: book.last_price,
            running: self.is_running(),
            orders: book
                .orders
                .values()
                .map(|order| (state::price_key(order.price), PersistedOrder::from(order)))
                .collect(),
        };
        if let Err(e) = state::save(&self.state_file, &persisted).await {
            tracing::error!(bot_id = self.config.id, error = %e, "state save failed");
        }
    }

    fn notify(&self, level: NotificationLevel, title: &str, message: String) {
        if let Some(notifier) = &self.services.notifier {
            notifier.send(self.config.user_id, level, title, message, None);
        }
    }

    fn trade_record(&self, report: &ExecutionReport, status: &str) -> TradeRecord {
        TradeRecord {
            bot_config_id: self.config.id,
            exchange_order_id: Some(report.order_id),
            symbol: self.config.symbol.clone(),
            side: report.side,
            price: report.last_fill_price,
            quantity: report.cumulative_qty,
            executed_qty: report.cumulative_qty,
            status: status.to_string(),
            fee: report.fee,
            fee_asset: report.fee_asset.clone(),
            executed_at: Utc::now(),
        }
    }

    async fn persist_buy_fill(&self, report: &ExecutionReport) {
        if let Some(repo) = &self.services.repo {
            if let Err(e) = repo.record_trade(&self.trade_record(report, "filled")).await {
                tracing::error!(bot_id = self.config.id, error = %e, "trade row insert failed");
            }
        }
    }

    /// Trade row and cumulative PnL move together in one transaction.
    async fn persist_sell_fill(&self, report: &ExecutionReport, realized_profit: Decimal) {
        if let Some(repo) = &self.services.repo {
            if let Err(e) = repo
                .record_sell_fill(&self.trade_record(report, "filled"), realized_profit)
                .await
            {
                tracing::error!(bot_id = self.config.id, error = %e, "sell fill persistence failed");
            }
        }
    }

    async fn publish_profit(&self, profit: Decimal, fill_price: Decimal, quantity: Decimal) {
        let Some(bus) = &self.services.bus else {
            return;
        };
        let event = TradeEvent {
            user_id: self.config.user_id,
            bot_id: self.config.id,
            kind: TradeEventKind::ProfitMatched,
            data: json!({
                "profit": profit.to_string(),
                "price": fill_price.to_string(),
                "quantity": quantity.to_string(),
            }),
        };
        if let Err(e) = bus.publish_trade_event(&event).await {
            tracing::error!(bot_id = self.config.id, error = %e, "profit event publish failed");
        }
    }
}

#[async_trait]
impl Strategy for GridStrategy {
    async fn initialize(&self) -> Result<(), StrategyError> {
        tracing::info!(
            bot_id = self.config.id,
            symbol = %self.config.symbol,
            grids = self.params.grid_count,
            step = %self.params.base_step(),
            "grid generated"
        );

        let restored = self.restore_state().await;
        if !restored {
            tracing::info!(bot_id = self.config.id, "fresh strategy start");
            if let Err(e) = self.client.nuke_all_orders().await {
                tracing::error!(bot_id = self.config.id, error = %e, "leftover-order cleanup failed");
            }
        }

        let price = self.client.get_symbol_price().await?;
        if price < self.params.lower || price > self.params.upper {
            tracing::error!(
                bot_id = self.config.id,
                price = %price,
                lower = %self.params.lower,
                upper = %self.params.upper,
                "price outside grid range, refusing to start"
            );
            return Err(StrategyError::GapCheck {
                price,
                lower: self.params.lower,
                upper: self.params.upper,
            });
        }

        if !restored {
            self.bootstrap_base_inventory(price).await?;
        }

        let required_quote = self.params.investment_per_grid
            * Decimal::from(self.params.grid_count)
            * FEE_RESERVE;
        let free_quote = self.client.get_free_balance(&self.config.quote_asset).await?;
        if free_quote < required_quote {
            if self.config.is_testnet {
                tracing::warn!(
                    bot_id = self.config.id,
                    free_quote = %free_quote,
                    required = %required_quote,
                    "quote balance below full grid requirement, continuing on testnet"
                );
            } else {
                return Err(StrategyError::InsufficientFunds(format!(
                    "free quote {} below grid requirement {}",
                    free_quote, required_quote
                )));
            }
        }

        self.notify(
            NotificationLevel::Info,
            "Grid strategy initialized",
            format!(
                "{}: {} grids over [{}, {}], adaptive: {}",
                self.config.symbol,
                self.params.grid_count,
                self.params.lower,
                self.params.upper,
                self.params.adaptive_mode
            ),
        );

        self.start(price).await;
        Ok(())
    }

    async fn on_price_update(&self, price: Decimal) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let mut book = self.state.lock().await;
        book.last_price = price;

        // Risk gates short-circuit the tick.
        if self.check_stop_loss(&mut book, price).await {
            return;
        }
        if self.check_take_profit(&mut book).await {
            return;
        }
        if self.check_max_drawdown(&mut book, price).await {
            return;
        }

        let adjustment = if self.params.adaptive_mode {
            let stored = self.adjustment.read().expect("adjustment lock poisoned");
            match stored.as_ref() {
                Some((adjustment, analyzed_at)) => {
                    let stale_after = Duration::from_secs(self.params.stale_data_timeout_seconds);
                    if analyzed_at.elapsed() > stale_after {
                        tracing::warn!(
                            bot_id = self.config.id,
                            "analysis data stale, pausing new entries"
                        );
                        return;
                    }
                    adjustment.clone()
                }
                None => {
                    tracing::debug!(bot_id = self.config.id, "waiting for first market analysis");
                    return;
                }
            }
        } else {
            self.effective_adjustment()
        };

        if adjustment.should_pause {
            tracing::debug!(
                bot_id = self.config.id,
                state = %adjustment.state,
                "adaptive pause in effect, skipping entries"
            );
            return;
        }

        self.evaluate_grid(&mut book, price, &adjustment).await;
    }

    async fn on_order_update(&self, report: &ExecutionReport) {
        let mut book = self.state.lock().await;
        let Some(key) = book
            .orders
            .iter()
            .find(|(_, order)| order.order_id == Some(report.order_id))
            .map(|(key, _)| *key)
        else {
            // Not one of ours (other bots share the credential stream).
            return;
        };

        match report.status.as_str() {
            "CANCELED" | "EXPIRED" | "REJECTED" => {
                tracing::info!(
                    bot_id = self.config.id,
                    order_id = report.order_id,
                    status = %report.status,
                    "order terminated, clearing from book"
                );
                if let Some(order) = book.orders.get_mut(&key) {
                    order.status = GridOrderStatus::Cancelled;
                }
                book.orders.remove(&key);
                self.save_state(&book).await;
            }
            "PARTIALLY_FILLED" => {
                tracing::info!(
                    bot_id = self.config.id,
                    order_id = report.order_id,
                    filled = %report.cumulative_qty,
                    "partial fill, keeping order pending"
                );
            }
            "FILLED" => {
                let (grid_index, side, entry_price) = {
                    let Some(order) = book.orders.get_mut(&key) else {
                        return;
                    };
                    order.status = GridOrderStatus::Filled;
                    (order.grid_index, order.side, order.entry_price)
                };
                let fill_price = report.last_fill_price;
                let fill_qty = report.cumulative_qty;

                match side {
                    OrderSide::Buy => {
                        tracing::info!(
                            bot_id = self.config.id,
                            grid_index,
                            fill_price = %fill_price,
                            quantity = %fill_qty,
                            "buy filled"
                        );
                        self.persist_buy_fill(report).await;
                        self.save_state(&book).await;
                        if self.running.load(Ordering::SeqCst) {
                            self.place_companion_sell(&mut book, grid_index, fill_price, fill_qty)
                                .await;
                        } else {
                            tracing::warn!(
                                bot_id = self.config.id,
                                "fill arrived after shutdown, recorded without companion order"
                            );
                        }
                    }
                    OrderSide::Sell => {
                        let Some(entry_price) = entry_price else {
                            tracing::warn!(
                                bot_id = self.config.id,
                                order_id = report.order_id,
                                "sell fill without recorded entry price"
                            );
                            book.orders.remove(&key);
                            self.save_state(&book).await;
                            return;
                        };

                        let profit = (fill_price - entry_price) * fill_qty;
                        book.realized_profit += profit;
                        tracing::info!(
                            bot_id = self.config.id,
                            grid_index,
                            fill_price = %fill_price,
                            profit = %profit,
                            realized_profit = %book.realized_profit,
                            "paired sell filled"
                        );

                        // Retire the pair: the sell and its originating buy.
                        book.orders.remove(&key);
                        let buy_key = book
                            .orders
                            .iter()
                            .find(|(_, order)| {
                                order.side == OrderSide::Buy
                                    && order.status == GridOrderStatus::Filled
                                    && order.grid_index == grid_index
                            })
                            .map(|(key, _)| *key);
                        if let Some(buy_key) = buy_key {
                            book.orders.remove(&buy_key);
                        }

                        self.publish_profit(profit, fill_price, fill_qty).await;
                        self.persist_sell_fill(report, book.realized_profit).await;
                        self.notify(
                            NotificationLevel::Success,
                            "Paired profit realized",
                            format!(
                                "grid {}: {} -> {}, profit {} ({} total)",
                                grid_index, entry_price, fill_price, profit, book.realized_profit
                            ),
                        );
                        self.save_state(&book).await;
                    }
                }
            }
            other => {
                tracing::debug!(
                    bot_id = self.config.id,
                    order_id = report.order_id,
                    status = other,
                    "ignoring execution status"
                );
            }
        }
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self
            .analysis_task
            .lock()
            .expect("analysis task lock poisoned")
            .take()
        {
            task.abort();
        }
        let book = self.state.lock().await;
        self.save_state(&book).await;
        tracing::info!(bot_id = self.config.id, "grid strategy stopped");
    }

    async fn panic_close(&self) -> Result<(), StrategyError> {
        tracing::warn!(bot_id = self.config.id, "panic close requested");
        let mut book = self.state.lock().await;

        self.client.cancel_all_orders().await?;
        book.orders.clear();

        let filters = self.client.filters();
        let free_base = self.client.get_free_balance(&self.config.base_asset).await?;
        let quantity = filters.floor_quantity(free_base);
        let reference_price = if book.last_price > Decimal::ZERO {
            book.last_price
        } else {
            self.client.get_symbol_price().await.unwrap_or(Decimal::ZERO)
        };

        let notional = quantity * reference_price;
        if quantity <= Decimal::ZERO
            || (reference_price > Decimal::ZERO && notional < filters.min_notional)
        {
            self.running.store(false, Ordering::SeqCst);
            self.save_state(&book).await;
            return Err(StrategyError::DustPosition {
                notional,
                min_notional: filters.min_notional,
            });
        }

        self.client
            .create_market_order(OrderSide::Sell, Some(quantity), None)
            .await?;
        self.running.store(false, Ordering::SeqCst);
        self.save_state(&book).await;
        self.notify(
            NotificationLevel::Warning,
            "Panic close executed",
            format!("liquidated {} {}", quantity, self.config.base_asset),
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
