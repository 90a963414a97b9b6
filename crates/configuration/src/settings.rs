use crate::error::ConfigError;
use serde::Deserialize;

/// Process-wide configuration, loaded from the environment.
///
/// Every field maps to an upper-cased environment variable of the same name
/// (e.g. `database_url` <- `DATABASE_URL`).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Postgres connection string.
    pub database_url: String,
    /// Redis connection string for the cluster event bus.
    pub redis_url: String,
    /// 32-byte url-safe base64 master key for the credential envelope.
    pub master_encryption_key: String,
    /// Comma-separated list of egress proxy URLs, e.g.
    /// `http://1.1.1.1:80,socks5://2.2.2.2:1080`.
    #[serde(default)]
    pub proxy_pool: Option<String>,
    /// Route every bot to the exchange testnet.
    #[serde(default)]
    pub binance_testnet: bool,
    /// Skip the geo-compliance pre-check entirely.
    #[serde(default)]
    pub ignore_geo_check: bool,
    /// Directory for per-bot strategy state files.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_state_dir() -> String {
    "state".to_string()
}

impl Settings {
    /// Loads settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }

    /// The configured proxy pool as individual URLs, empty when unset.
    pub fn proxy_list(&self) -> Vec<String> {
        self.proxy_pool
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_list_splits_and_trims() {
        let settings = Settings {
            database_url: String::new(),
            redis_url: String::new(),
            master_encryption_key: String::new(),
            proxy_pool: Some(" http://1.1.1.1:80, socks5://2.2.2.2:1080 ,".to_string()),
            binance_testnet: false,
            ignore_geo_check: false,
            state_dir: default_state_dir(),
        };
        assert_eq!(
            settings.proxy_list(),
            vec!["http://1.1.1.1:80", "socks5://2.2.2.2:1080"]
        );
    }

    #[test]
    fn proxy_list_empty_when_unset() {
        let settings = Settings {
            database_url: String::new(),
            redis_url: String::new(),
            master_encryption_key: String::new(),
            proxy_pool: None,
            binance_testnet: true,
            ignore_geo_check: true,
            state_dir: default_state_dir(),
        };
        assert!(settings.proxy_list().is_empty());
    }
}
