//! Reference-counted WebSocket stream multiplexer.
//!
//! N bots on the same symbol share one market ticker socket, and N bots on
//! the same credential share one authenticated user-data socket. The first
//! subscriber spawns the reader; the last unsubscriber cancels it.
//!
//! Dispatch is fan-out over per-bot unbounded channels: every subscriber on
//! a key observes events in the order the reader received them, and a slow
//! bot only ever backs up its own queue. The registry mutex is taken for
//! membership changes, never for dispatch.

use api_client::error::ApiError;
use api_client::{run_market_ticker_loop, UserDataEvent, UserStreamClient};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type MarketKey = (String, bool);
type Subscribers<T> = Arc<RwLock<HashMap<i64, UnboundedSender<T>>>>;

struct StreamEntry<T> {
    subscribers: Subscribers<T>,
    task: JoinHandle<()>,
}

pub struct StreamAggregator {
    market: Mutex<HashMap<MarketKey, StreamEntry<Decimal>>>,
    user: Mutex<HashMap<i64, StreamEntry<UserDataEvent>>>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self {
            market: Mutex::new(HashMap::new()),
            user: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes a bot to the `(symbol, testnet)` ticker stream, spawning
    /// the shared reader if this is the first subscription on the key.
    pub async fn subscribe_market(
        &self,
        symbol: &str,
        testnet: bool,
        bot_id: i64,
    ) -> UnboundedReceiver<Decimal> {
        let key = (symbol.to_lowercase(), testnet);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut registry = self.market.lock().await;
        match registry.get(&key) {
            Some(entry) => {
                let mut subscribers = entry.subscribers.write().expect("subscriber lock poisoned");
                subscribers.insert(bot_id, tx);
                tracing::info!(
                    symbol = %key.0,
                    testnet,
                    subscribers = subscribers.len(),
                    "sharing existing market stream"
                );
            }
            None => {
                tracing::info!(symbol = %key.0, testnet, "opening new market stream");
                let subscribers: Subscribers<Decimal> =
                    Arc::new(RwLock::new(HashMap::from([(bot_id, tx)])));
                let reader_subs = Arc::clone(&subscribers);
                let reader_symbol = key.0.clone();
                let task = tokio::spawn(async move {
                    run_market_ticker_loop(&reader_symbol, testnet, move |price| {
                        Self::fan_out(&reader_subs, &price)
                    })
                    .await;
                });
                registry.insert(key, StreamEntry { subscribers, task });
            }
        }
        rx
    }

    /// Removes a bot's market subscription; cancels the reader when the
    /// subscriber set becomes empty.
    pub async fn unsubscribe_market(&self, symbol: &str, testnet: bool, bot_id: i64) {
        let key = (symbol.to_lowercase(), testnet);
        let mut registry = self.market.lock().await;
        if let Some(entry) = registry.get(&key) {
            let remaining = {
                let mut subscribers =
                    entry.subscribers.write().expect("subscriber lock poisoned");
                subscribers.remove(&bot_id);
                subscribers.len()
            };
            if remaining == 0 {
                tracing::info!(symbol = %key.0, testnet, "no subscribers left, closing market stream");
                let entry = registry.remove(&key).expect("checked above");
                entry.task.abort();
            }
        }
    }

    /// Subscribes a bot to the user-data stream of its credential, spawning
    /// the shared credentialed reader on first use.
    pub async fn subscribe_user_data(
        &self,
        api_key_id: i64,
        api_key: &str,
        testnet: bool,
        bot_id: i64,
    ) -> Result<UnboundedReceiver<UserDataEvent>, ApiError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut registry = self.user.lock().await;
        match registry.get(&api_key_id) {
            Some(entry) => {
                let mut subscribers = entry.subscribers.write().expect("subscriber lock poisoned");
                subscribers.insert(bot_id, tx);
                tracing::info!(
                    api_key_id,
                    subscribers = subscribers.len(),
                    "sharing existing user-data stream"
                );
            }
            None => {
                tracing::info!(api_key_id, "opening new user-data stream");
                let client = UserStreamClient::new(api_key, testnet, None)?;
                let subscribers: Subscribers<UserDataEvent> =
                    Arc::new(RwLock::new(HashMap::from([(bot_id, tx)])));
                let reader_subs = Arc::clone(&subscribers);
                let task = tokio::spawn(async move {
                    client
                        .run(move |event| Self::fan_out(&reader_subs, &event))
                        .await;
                });
                registry.insert(api_key_id, StreamEntry { subscribers, task });
            }
        }
        Ok(rx)
    }

    /// Removes a bot's user-data subscription; cancels the reader when the
    /// subscriber set becomes empty.
    pub async fn unsubscribe_user_data(&self, api_key_id: i64, bot_id: i64) {
        let mut registry = self.user.lock().await;
        if let Some(entry) = registry.get(&api_key_id) {
            let remaining = {
                let mut subscribers =
                    entry.subscribers.write().expect("subscriber lock poisoned");
                subscribers.remove(&bot_id);
                subscribers.len()
            };
            if remaining == 0 {
                tracing::info!(api_key_id, "no subscribers left, closing user-data stream");
                let entry = registry.remove(&api_key_id).expect("checked above");
                entry.task.abort();
            }
        }
    }

    /// Cancels every reader and clears both registries.
    pub async fn stop(&self) {
        let mut market = self.market.lock().await;
        for (_, entry) in market.drain() {
            entry.task.abort();
        }
        let mut user = self.user.lock().await;
        for (_, entry) in user.drain() {
            entry.task.abort();
        }
        tracing::info!("stream aggregator shut down");
    }

    pub async fn market_stream_count(&self) -> usize {
        self.market.lock().await.len()
    }

    pub async fn user_stream_count(&self) -> usize {
        self.user.lock().await.len()
    }

    /// Synchronous fan-out used from inside the reader tasks. A send only
    /// fails when the receiving bot is gone; that is logged, not evicted.
    fn fan_out<T: Clone>(subscribers: &Subscribers<T>, event: &T) {
        let subscribers = subscribers.read().expect("subscriber lock poisoned");
        for (bot_id, tx) in subscribers.iter() {
            if tx.send(event.clone()).is_err() {
                tracing::error!(bot_id, "subscriber receiver dropped, event discarded");
            }
        }
    }

    #[cfg(test)]
    async fn inject_market(&self, symbol: &str, testnet: bool, price: Decimal) {
        let key = (symbol.to_lowercase(), testnet);
        let registry = self.market.lock().await;
        if let Some(entry) = registry.get(&key) {
            Self::fan_out(&entry.subscribers, &price);
        }
    }
}

impl Default for StreamAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    /// Two subscriptions on the same key share one reader; dispatch reaches
    /// both, unsubscribing narrows it, and the last unsubscribe tears the
    /// stream down.
    #[tokio::test]
    async fn shared_market_stream_fans_out_and_refcounts() {
        let aggregator = StreamAggregator::new();

        let mut rx_a = aggregator.subscribe_market("BTCUSDT", true, 1).await;
        let mut rx_b = aggregator.subscribe_market("BTCUSDT", true, 2).await;
        assert_eq!(aggregator.market_stream_count().await, 1);

        aggregator.inject_market("BTCUSDT", true, dec!(42000)).await;
        assert_eq!(rx_a.try_recv().unwrap(), dec!(42000));
        assert_eq!(rx_b.try_recv().unwrap(), dec!(42000));

        aggregator.unsubscribe_market("BTCUSDT", true, 1).await;
        aggregator.inject_market("BTCUSDT", true, dec!(42001)).await;
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), dec!(42001));

        aggregator.unsubscribe_market("BTCUSDT", true, 2).await;
        assert_eq!(aggregator.market_stream_count().await, 0);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_streams() {
        let aggregator = StreamAggregator::new();
        let _rx_a = aggregator.subscribe_market("BTCUSDT", true, 1).await;
        let _rx_b = aggregator.subscribe_market("ETHUSDT", true, 1).await;
        // Same symbol on a different network is a different stream too.
        let _rx_c = aggregator.subscribe_market("BTCUSDT", false, 2).await;
        assert_eq!(aggregator.market_stream_count().await, 3);
        aggregator.stop().await;
        assert_eq!(aggregator.market_stream_count().await, 0);
    }

    #[tokio::test]
    async fn dispatch_preserves_order_per_subscriber() {
        let aggregator = StreamAggregator::new();
        let mut rx = aggregator.subscribe_market("BTCUSDT", true, 1).await;

        for price in [dec!(1), dec!(2), dec!(3)] {
            aggregator.inject_market("BTCUSDT", true, price).await;
        }
        assert_eq!(rx.try_recv().unwrap(), dec!(1));
        assert_eq!(rx.try_recv().unwrap(), dec!(2));
        assert_eq!(rx.try_recv().unwrap(), dec!(3));

        aggregator.unsubscribe_market("BTCUSDT", true, 1).await;
    }

    #[tokio::test]
    async fn user_streams_are_shared_per_credential() {
        let aggregator = StreamAggregator::new();
        let _rx_a = aggregator
            .subscribe_user_data(10, "test-key", true, 1)
            .await
            .unwrap();
        let _rx_b = aggregator
            .subscribe_user_data(10, "test-key", true, 2)
            .await
            .unwrap();
        assert_eq!(aggregator.user_stream_count().await, 1);

        aggregator.unsubscribe_user_data(10, 1).await;
        assert_eq!(aggregator.user_stream_count().await, 1);
        aggregator.unsubscribe_user_data(10, 2).await;
        assert_eq!(aggregator.user_stream_count().await, 0);
    }
}
