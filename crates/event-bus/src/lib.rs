//! Redis pub/sub adapter for cross-process coordination.
//!
//! Two channels: the cluster-wide kill switch (any process can halt every
//! bot in the fleet) and per-user trade events consumed by the UI gateways.

use events::{KillSwitchCommand, TradeEvent};
use futures_util::StreamExt;
use thiserror::Error;

/// Channel carrying `HALT_ALL` commands for the whole cluster.
pub const KILL_SWITCH_CHANNEL: &str = "global:kill_switch";
/// Channel carrying personal trade events routed by user id.
pub const TRADE_EVENTS_CHANNEL: &str = "user:trade_events";

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Decodes a kill-switch payload, keeping only `HALT_ALL` commands.
pub fn parse_kill_switch(payload: &str) -> Option<KillSwitchCommand> {
    match serde_json::from_str::<KillSwitchCommand>(payload) {
        Ok(command) if command.action == KillSwitchCommand::HALT_ALL => Some(command),
        Ok(command) => {
            tracing::warn!(action = %command.action, "ignoring unknown kill-switch action");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "malformed kill-switch payload");
            None
        }
    }
}

/// Thin connection handle; cheap to clone and share across tasks.
#[derive(Clone)]
pub struct EventBus {
    client: redis::Client,
}

impl EventBus {
    pub fn new(redis_url: &str) -> Result<Self, BusError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    /// Broadcasts a cluster-wide halt.
    pub async fn publish_kill_switch(
        &self,
        reason: &str,
        triggered_by: i64,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_string(&KillSwitchCommand::halt_all(reason, triggered_by))?;
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("PUBLISH")
            .arg(KILL_SWITCH_CHANNEL)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        tracing::warn!(reason, triggered_by, "kill switch published");
        Ok(())
    }

    /// Publishes one personal trade event for the UI gateways to route.
    pub async fn publish_trade_event(&self, event: &TradeEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("PUBLISH")
            .arg(TRADE_EVENTS_CHANNEL)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Subscribes to the kill-switch channel and invokes `on_halt` for every
    /// `HALT_ALL` command until the connection drops or the task is
    /// cancelled.
    pub async fn run_kill_switch_listener<F, Fut>(&self, mut on_halt: F) -> Result<(), BusError>
    where
        F: FnMut(KillSwitchCommand) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(KILL_SWITCH_CHANNEL).await?;
        tracing::info!(channel = KILL_SWITCH_CHANNEL, "kill-switch listener subscribed");

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "unreadable kill-switch message");
                    continue;
                }
            };
            if let Some(command) = parse_kill_switch(&payload) {
                tracing::warn!(
                    reason = %command.reason,
                    triggered_by = command.triggered_by,
                    "kill switch received, halting all bots"
                );
                on_halt(command).await;
            }
        }
        tracing::warn!("kill-switch listener stream ended");
        Ok(())
    }
}
