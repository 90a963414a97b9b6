//! Bot lifecycle supervisor.
//!
//! Owns the set of running bots: builds each bot's credentialed exchange
//! client, runs the geo pre-check, resolves the strategy from the registry,
//! wires the aggregated streams, and guarantees cleanup (state flush, stream
//! unsubscribe, client disconnect, proxy release) however a bot ends.

pub mod credentials;
pub mod error;
pub mod geo;
pub mod proxy;

pub use credentials::{CredentialCipher, PassthroughCipher};
pub use error::EngineError;
pub use geo::GeoCheckService;
pub use proxy::ProxyScheduler;

use aggregator::StreamAggregator;
use api_client::rate_limiter::RateLimiter;
use api_client::{BinanceClient, ClientConfig, ExchangeApi, UserDataEvent};
use core_types::{BotConfig, BotStatus};
use database::DbRepository;
use event_bus::EventBus;
use events::NotificationLevel;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use strategies::{Strategy, StrategyRegistry, StrategyServices};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

struct BotHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    strategy: Arc<dyn Strategy>,
}

/// Everything one bot's event loop needs to run and tear itself down.
struct BotRuntime {
    supervisor: Weak<Supervisor>,
    bot_id: i64,
    user_id: i64,
    symbol: String,
    testnet: bool,
    api_key_id: i64,
    strategy: Arc<dyn Strategy>,
    client: Arc<BinanceClient>,
    assigned_proxy: Option<String>,
    is_auto_proxy: bool,
}

pub struct Supervisor {
    weak_self: Weak<Supervisor>,
    registry: StrategyRegistry,
    aggregator: Arc<StreamAggregator>,
    services: StrategyServices,
    proxies: Arc<ProxyScheduler>,
    geo: GeoCheckService,
    cipher: Arc<dyn CredentialCipher>,
    active_bots: Mutex<HashMap<i64, BotHandle>>,
}

impl Supervisor {
    pub fn new(
        registry: StrategyRegistry,
        aggregator: Arc<StreamAggregator>,
        services: StrategyServices,
        proxies: Arc<ProxyScheduler>,
        geo: GeoCheckService,
        cipher: Arc<dyn CredentialCipher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            registry,
            aggregator,
            services,
            proxies,
            geo,
            cipher,
            active_bots: Mutex::new(HashMap::new()),
        })
    }

    pub async fn active_bot_count(&self) -> usize {
        self.active_bots.lock().await.len()
    }

    pub async fn is_bot_active(&self, bot_id: i64) -> bool {
        self.active_bots.lock().await.contains_key(&bot_id)
    }

    fn notify(&self, user_id: i64, level: NotificationLevel, title: &str, message: String) {
        if let Some(notifier) = &self.services.notifier {
            notifier.send(user_id, level, title, message, None);
        }
    }

    async fn set_status(&self, bot_id: i64, status: BotStatus) {
        if let Some(repo) = &self.services.repo {
            if let Err(e) = repo.update_bot_status(bot_id, status).await {
                tracing::error!(bot_id, error = %e, "bot status update failed");
            }
        }
    }

    async fn abort_start(
        &self,
        bot_id: i64,
        user_id: i64,
        assigned_proxy: Option<&str>,
        is_auto_proxy: bool,
        reason: String,
    ) {
        if is_auto_proxy {
            self.proxies.release_proxy(assigned_proxy);
        }
        self.set_status(bot_id, BotStatus::Error).await;
        self.notify(user_id, NotificationLevel::Error, "Bot failed to start", reason);
    }

    /// Starts one bot with already-decrypted credentials. Returns `false`
    /// when an instance is already running for this bot id.
    pub async fn start_bot(
        &self,
        config: BotConfig,
        api_key: String,
        api_secret: String,
    ) -> Result<bool, EngineError> {
        let bot_id = config.id;
        let user_id = config.user_id;
        let mut bots = self.active_bots.lock().await;

        if let Some(handle) = bots.get(&bot_id) {
            if !handle.task.is_finished() {
                tracing::warn!(bot_id, "bot already running, ignoring duplicate start");
                return Ok(false);
            }
            tracing::warn!(bot_id, "clearing finished task left in the registry");
            bots.remove(&bot_id);
        }

        self.set_status(bot_id, BotStatus::Starting).await;

        // Egress: an explicit proxy in the bot parameters wins, otherwise
        // the pool assigns the least-loaded node.
        let override_proxy = config
            .parameters
            .get("proxy")
            .and_then(|p| p.as_str())
            .map(str::to_string);
        let is_auto_proxy = override_proxy.is_none();
        let assigned_proxy = match override_proxy {
            Some(proxy) => Some(proxy),
            None => self.proxies.get_best_proxy(),
        };

        let (compliant, geo_message) = self
            .geo
            .is_compliant(assigned_proxy.as_deref(), config.is_testnet)
            .await;
        if !compliant {
            self.abort_start(
                bot_id,
                user_id,
                assigned_proxy.as_deref(),
                is_auto_proxy,
                geo_message.clone(),
            )
            .await;
            return Err(EngineError::GeoBlocked(geo_message));
        }

        let client_config = ClientConfig {
            api_key: api_key.clone(),
            api_secret,
            symbol: config.symbol.clone(),
            base_asset: config.base_asset.clone(),
            quote_asset: config.quote_asset.clone(),
            testnet: config.is_testnet,
            proxy: assigned_proxy.clone(),
        };
        let api_key_id = config.api_key_id;
        let symbol = config.symbol.clone();
        let testnet = config.is_testnet;
        let strategy_type = config.strategy_type;

        let client = match BinanceClient::new(client_config, Arc::new(RateLimiter::new())) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                self.abort_start(
                    bot_id,
                    user_id,
                    assigned_proxy.as_deref(),
                    is_auto_proxy,
                    e.to_string(),
                )
                .await;
                return Err(e.into());
            }
        };
        if let Err(e) = client.connect().await {
            self.abort_start(
                bot_id,
                user_id,
                assigned_proxy.as_deref(),
                is_auto_proxy,
                e.to_string(),
            )
            .await;
            return Err(e.into());
        }

        let strategy = match self.registry.create(
            config,
            Arc::clone(&client) as Arc<dyn ExchangeApi>,
            self.services.clone(),
        ) {
            Ok(strategy) => strategy,
            Err(e) => {
                client.disconnect().await;
                self.abort_start(
                    bot_id,
                    user_id,
                    assigned_proxy.as_deref(),
                    is_auto_proxy,
                    e.to_string(),
                )
                .await;
                return Err(e.into());
            }
        };

        if let Err(e) = strategy.initialize().await {
            client.disconnect().await;
            self.abort_start(
                bot_id,
                user_id,
                assigned_proxy.as_deref(),
                is_auto_proxy,
                e.to_string(),
            )
            .await;
            return Err(e.into());
        }

        // Wire the shared streams last, so a failed initialize never leaves
        // dangling subscriptions.
        let market_rx = self.aggregator.subscribe_market(&symbol, testnet, bot_id).await;
        let user_rx = match self
            .aggregator
            .subscribe_user_data(api_key_id, &api_key, testnet, bot_id)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.aggregator.unsubscribe_market(&symbol, testnet, bot_id).await;
                strategy.stop().await;
                client.disconnect().await;
                self.abort_start(
                    bot_id,
                    user_id,
                    assigned_proxy.as_deref(),
                    is_auto_proxy,
                    e.to_string(),
                )
                .await;
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = BotRuntime {
            supervisor: self.weak_self.clone(),
            bot_id,
            user_id,
            symbol,
            testnet,
            api_key_id,
            strategy: Arc::clone(&strategy),
            client,
            assigned_proxy,
            is_auto_proxy,
        };
        let task = tokio::spawn(Self::run_bot_loop(runtime, market_rx, user_rx, shutdown_rx));

        bots.insert(
            bot_id,
            BotHandle {
                task,
                shutdown: shutdown_tx,
                strategy,
            },
        );
        drop(bots);

        self.set_status(bot_id, BotStatus::Running).await;
        tracing::info!(bot_id, strategy = ?strategy_type, "bot started");
        Ok(true)
    }

    /// One bot's event loop: consumes the aggregated market and user-data
    /// streams until either fails or a shutdown is signalled, then always
    /// runs the full teardown.
    async fn run_bot_loop(
        runtime: BotRuntime,
        mut market_rx: UnboundedReceiver<Decimal>,
        mut user_rx: UnboundedReceiver<UserDataEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::info!(bot_id = runtime.bot_id, "bot event loop started");
        let mut failed = false;
        loop {
            tokio::select! {
                // A closed sender is a stop too.
                _ = shutdown_rx.changed() => {
                    tracing::info!(bot_id = runtime.bot_id, "shutdown signalled");
                    break;
                }
                maybe_price = market_rx.recv() => match maybe_price {
                    Some(price) => runtime.strategy.on_price_update(price).await,
                    None => {
                        tracing::error!(bot_id = runtime.bot_id, "market stream closed unexpectedly");
                        failed = true;
                        break;
                    }
                },
                maybe_event = user_rx.recv() => match maybe_event {
                    // Keep the balance snapshot fresh before the strategy
                    // ever sees the execution flow.
                    Some(UserDataEvent::AccountPosition(position)) => {
                        runtime.client.apply_balance_update(&position);
                    }
                    Some(UserDataEvent::ExecutionReport(report)) => {
                        runtime.strategy.on_order_update(&report).await;
                    }
                    None => {
                        tracing::error!(bot_id = runtime.bot_id, "user-data stream closed unexpectedly");
                        failed = true;
                        break;
                    }
                },
            }
        }

        runtime.strategy.stop().await;
        let supervisor = runtime.supervisor.upgrade();
        if let Some(supervisor) = &supervisor {
            supervisor
                .aggregator
                .unsubscribe_market(&runtime.symbol, runtime.testnet, runtime.bot_id)
                .await;
            supervisor
                .aggregator
                .unsubscribe_user_data(runtime.api_key_id, runtime.bot_id)
                .await;
        }
        runtime.client.disconnect().await;

        if let Some(supervisor) = &supervisor {
            if runtime.is_auto_proxy {
                supervisor.proxies.release_proxy(runtime.assigned_proxy.as_deref());
            }
            supervisor.active_bots.lock().await.remove(&runtime.bot_id);
            let status = if failed { BotStatus::Error } else { BotStatus::Stopped };
            supervisor.set_status(runtime.bot_id, status).await;
            if failed {
                supervisor.notify(
                    runtime.user_id,
                    NotificationLevel::Error,
                    "Bot stopped unexpectedly",
                    format!("bot {} lost its event streams and was shut down", runtime.bot_id),
                );
            }
        }
        tracing::info!(bot_id = runtime.bot_id, "bot runtime cleaned up");
    }

    /// Cancels a bot's event loop and waits for its cleanup to finish.
    /// Returns whether an instance was actually running.
    pub async fn stop_bot(&self, bot_id: i64) -> bool {
        let handle = self.active_bots.lock().await.remove(&bot_id);
        let Some(handle) = handle else {
            tracing::info!(bot_id, "bot not in the active registry");
            return false;
        };

        tracing::info!(bot_id, "stopping bot");
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            tracing::error!(bot_id, error = %e, "bot task join failed");
        }
        tracing::info!(bot_id, "bot stopped");
        true
    }

    /// Liquidates the bot's position through the strategy, then stops it.
    /// The bot is unloaded even when the liquidation partially fails.
    pub async fn panic_close_bot(&self, bot_id: i64) -> Result<(), EngineError> {
        let strategy = self
            .active_bots
            .lock()
            .await
            .get(&bot_id)
            .map(|handle| Arc::clone(&handle.strategy));
        let Some(strategy) = strategy else {
            tracing::warn!(bot_id, "bot not running, nothing to panic close");
            return Ok(());
        };

        tracing::warn!(bot_id, "panic closing bot");
        let result = strategy.panic_close().await;
        self.stop_bot(bot_id).await;
        result.map_err(Into::into)
    }

    /// Concurrent stop of every active bot; used by shutdown and the global
    /// kill switch.
    pub async fn stop_all_bots(&self) {
        let bot_ids: Vec<i64> = self.active_bots.lock().await.keys().copied().collect();
        if bot_ids.is_empty() {
            return;
        }
        tracing::warn!(?bot_ids, "stopping all active bots");
        join_all(bot_ids.into_iter().map(|bot_id| self.stop_bot(bot_id))).await;
        tracing::info!("all bots stopped");
    }

    async fn resume_bot(&self, repo: &DbRepository, config: BotConfig) -> Result<bool, EngineError> {
        let key = repo.get_api_key(config.api_key_id).await?;
        let encrypted_dek = repo.get_user_encrypted_dek(config.user_id).await?;
        let api_secret = self.cipher.decrypt_secret(&encrypted_dek, &key.encrypted_secret)?;
        self.start_bot(config, key.api_key, api_secret).await
    }

    /// Restarts every bot the database still marks as running; called once
    /// at process startup so a crash or deploy does not orphan live grids.
    pub async fn init_and_resume_all(&self) -> Result<usize, EngineError> {
        let Some(repo) = self.services.repo.clone() else {
            tracing::warn!("no repository wired, skipping bot resume");
            return Ok(0);
        };

        let bots = repo.list_bots_by_status(BotStatus::Running).await?;
        if bots.is_empty() {
            tracing::info!("no bots to resume");
            return Ok(0);
        }
        tracing::info!(count = bots.len(), "resuming previously running bots");

        let mut resumed = 0usize;
        for config in bots {
            let bot_id = config.id;
            let user_id = config.user_id;
            let name = config.name.clone();
            match self.resume_bot(&repo, config).await {
                Ok(true) => {
                    resumed += 1;
                    self.notify(
                        user_id,
                        NotificationLevel::Info,
                        "Bot recovered",
                        format!("{} resumed after engine restart", name),
                    );
                }
                Ok(false) => {
                    tracing::warn!(bot_id, "bot was already active during resume");
                }
                Err(e) => {
                    tracing::error!(bot_id, error = %e, "bot resume failed");
                    self.set_status(bot_id, BotStatus::Error).await;
                    self.notify(
                        user_id,
                        NotificationLevel::Error,
                        "Bot recovery failed",
                        format!("{}: {}", name, e),
                    );
                }
            }
        }
        Ok(resumed)
    }

    /// Spawns the cluster kill-switch subscriber: on `HALT_ALL`, every bot
    /// is stopped and a system alert is broadcast to connected UIs.
    pub fn spawn_kill_switch_listener(self: &Arc<Self>, bus: EventBus) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let handler_supervisor = Arc::clone(&supervisor);
            let result = bus
                .run_kill_switch_listener(move |command| {
                    let supervisor = Arc::clone(&handler_supervisor);
                    async move {
                        supervisor.stop_all_bots().await;
                        if let Some(notifier) = &supervisor.services.notifier {
                            notifier.system_alert(
                                NotificationLevel::Critical,
                                format!("Global halt engaged: {}", command.reason),
                            );
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "kill-switch listener terminated");
            }
        })
    }
}
