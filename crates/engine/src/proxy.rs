//! Least-loaded egress proxy pool.
//!
//! Each running bot pins one proxy for its whole lifetime so the exchange
//! sees a stable source address per credential; the pool spreads bots over
//! the configured proxies and reclaims the slot on stop.

use rand::seq::IndexedRandom;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct ProxyScheduler {
    pool: Mutex<HashMap<String, u32>>,
}

impl ProxyScheduler {
    pub fn new(proxies: Vec<String>) -> Self {
        let pool: HashMap<String, u32> = proxies.into_iter().map(|p| (p, 0)).collect();
        if !pool.is_empty() {
            tracing::info!(nodes = pool.len(), "proxy pool initialised");
        }
        Self {
            pool: Mutex::new(pool),
        }
    }

    pub fn add_proxy(&self, proxy_url: impl Into<String>) {
        let proxy_url = proxy_url.into();
        let mut pool = self.pool.lock().expect("proxy pool lock poisoned");
        if !pool.contains_key(&proxy_url) {
            tracing::info!(proxy = %proxy_url, "proxy node added");
            pool.insert(proxy_url, 0);
        }
    }

    /// Assigns the least-loaded proxy, breaking ties randomly so assignments
    /// do not pile onto the first node. `None` when the pool is empty.
    pub fn get_best_proxy(&self) -> Option<String> {
        let mut pool = self.pool.lock().expect("proxy pool lock poisoned");
        if pool.is_empty() {
            return None;
        }

        let min_load = *pool.values().min().expect("non-empty pool");
        let candidates: Vec<String> = pool
            .iter()
            .filter(|(_, load)| **load == min_load)
            .map(|(proxy, _)| proxy.clone())
            .collect();
        let chosen = candidates
            .choose(&mut rand::rng())
            .expect("non-empty candidates")
            .clone();

        let load = pool.get_mut(&chosen).expect("chosen from pool");
        *load += 1;
        tracing::info!(proxy = %chosen, load = *load, "proxy assigned");
        Some(chosen)
    }

    /// Returns a bot's slot to the pool.
    pub fn release_proxy(&self, proxy_url: Option<&str>) {
        let Some(proxy_url) = proxy_url else {
            return;
        };
        let mut pool = self.pool.lock().expect("proxy pool lock poisoned");
        if let Some(load) = pool.get_mut(proxy_url) {
            *load = load.saturating_sub(1);
            tracing::info!(proxy = %proxy_url, load = *load, "proxy released");
        }
    }

    pub fn total_capacity(&self) -> usize {
        self.pool.lock().expect("proxy pool lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_assigns_nothing() {
        let scheduler = ProxyScheduler::new(Vec::new());
        assert!(scheduler.get_best_proxy().is_none());
        // Releasing into an empty pool is harmless.
        scheduler.release_proxy(Some("http://1.1.1.1:80"));
    }

    #[test]
    fn assignment_prefers_least_loaded_node() {
        let scheduler = ProxyScheduler::new(vec![
            "http://a:80".to_string(),
            "http://b:80".to_string(),
        ]);

        let first = scheduler.get_best_proxy().unwrap();
        let second = scheduler.get_best_proxy().unwrap();
        // Two assignments over two idle nodes must use both.
        assert_ne!(first, second);

        // Releasing one node makes it the unique least-loaded choice.
        scheduler.release_proxy(Some(&first));
        assert_eq!(scheduler.get_best_proxy().unwrap(), first);
    }

    #[test]
    fn capacity_tracks_added_nodes() {
        let scheduler = ProxyScheduler::new(vec!["http://a:80".to_string()]);
        scheduler.add_proxy("http://b:80");
        scheduler.add_proxy("http://b:80");
        assert_eq!(scheduler.total_capacity(), 2);
    }
}
