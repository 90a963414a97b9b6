//! Strategy layer: the per-bot trading state machines.
//!
//! Every strategy implements the [`Strategy`] trait so the supervisor can be
//! strategy-agnostic; the [`StrategyRegistry`] resolves a bot's persisted
//! `strategy_type` to a constructor. The grid strategy is the core
//! implementation.

pub mod error;
pub mod factory;
pub mod grid;
pub mod state;

pub use error::StrategyError;
pub use factory::StrategyRegistry;
pub use grid::{GridOrder, GridStrategy, StrategySnapshot};

use alerter::NotificationService;
use api_client::streams::ExecutionReport;
use async_trait::async_trait;
use database::DbRepository;
use event_bus::EventBus;
use rust_decimal::Decimal;

/// External collaborators a strategy reports into. Each one is optional:
/// a strategy keeps trading when persistence or notification wiring is
/// absent (degraded, but never blocked on a side channel).
#[derive(Clone, Default)]
pub struct StrategyServices {
    pub repo: Option<DbRepository>,
    pub bus: Option<EventBus>,
    pub notifier: Option<NotificationService>,
}

/// The lifecycle and event-handling contract every strategy fulfils.
///
/// The event handlers are infallible on purpose: a strategy must survive a
/// transient exchange hiccup, so it logs internally and carries on instead
/// of propagating errors into the stream readers.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// One-time setup before the event loops start: restore state, validate
    /// balances, construct the initial order layout.
    async fn initialize(&self) -> Result<(), StrategyError>;

    /// Market tick from the aggregated ticker stream.
    async fn on_price_update(&self, price: Decimal);

    /// Order execution report from the aggregated user-data stream.
    async fn on_order_update(&self, report: &ExecutionReport);

    /// Graceful stop: flush state, halt background loops.
    async fn stop(&self);

    /// Admin-triggered liquidation: cancel everything and market-sell the
    /// remaining base position.
    async fn panic_close(&self) -> Result<(), StrategyError>;

    fn is_running(&self) -> bool;
}
