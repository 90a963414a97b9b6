//! Geo-compliance pre-check.
//!
//! Before a bot starts, the egress IP (direct or through the assigned proxy)
//! is resolved to a country; bots are refused in regions the exchange
//! restricts. The probe failing open is deliberate: a dead geolocation API
//! must not ground the fleet, and the exchange enforces the rule at order
//! time anyway.

use serde::Deserialize;
use std::time::Duration;

/// ISO country codes the exchange restricts for spot trading.
const PROHIBITED_COUNTRIES: &[&str] = &[
    "US", "CA", "CN", "SG", "MY", "JP", "GB", "NL", "DE", "IT",
];

const GEO_PROBE_URL: &str = "http://ip-api.com/json";
const GEO_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpInfo {
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    /// The probed IP address.
    #[serde(default)]
    pub query: Option<String>,
}

/// Pure compliance decision over a resolved IP record.
pub fn evaluate(info: &IpInfo) -> (bool, String) {
    let country_code = info.country_code.as_deref().unwrap_or("");
    let region_name = info.region_name.as_deref().unwrap_or("");
    let ip = info.query.as_deref().unwrap_or("unknown");

    if PROHIBITED_COUNTRIES.contains(&country_code) {
        return (
            false,
            format!("restricted region {} (ip: {})", country_code, ip),
        );
    }
    // Province-level carve-out: Ontario is restricted even though the rest
    // of Canada would pass the country rule above.
    if country_code == "CA" && region_name.contains("Ontario") {
        return (false, format!("restricted region CA/Ontario (ip: {})", ip));
    }

    let country = info.country.as_deref().unwrap_or("unknown");
    (
        true,
        format!("compliant: {} ({}) (ip: {})", country_code, country, ip),
    )
}

pub struct GeoCheckService {
    bypass: bool,
}

impl GeoCheckService {
    pub fn new(bypass: bool) -> Self {
        Self { bypass }
    }

    async fn probe(&self, proxy: Option<&str>) -> Option<IpInfo> {
        let mut builder = reqwest::Client::builder().timeout(GEO_PROBE_TIMEOUT);
        if let Some(proxy) = proxy {
            match reqwest::Proxy::all(proxy) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => {
                    tracing::warn!(error = %e, "invalid proxy for geo probe");
                    return None;
                }
            }
        }
        let client = builder.build().ok()?;
        match client.get(GEO_PROBE_URL).send().await {
            Ok(response) => response.json::<IpInfo>().await.ok(),
            Err(e) => {
                tracing::warn!(error = %e, "geo probe request failed");
                None
            }
        }
    }

    /// Checks whether trading from the given egress is allowed.
    ///
    /// Testnet bots and explicit bypass skip the probe entirely.
    pub async fn is_compliant(&self, proxy: Option<&str>, testnet: bool) -> (bool, String) {
        if testnet || self.bypass {
            return (true, "geo check bypassed".to_string());
        }

        let Some(info) = self.probe(proxy).await else {
            tracing::warn!("geolocation unavailable, skipping hard block");
            return (true, "geolocation unavailable, not enforced".to_string());
        };

        let (compliant, message) = evaluate(&info);
        if compliant {
            tracing::info!(%message, "geo pre-check passed");
        } else {
            tracing::error!(%message, "geo pre-check blocked bot start");
        }
        (compliant, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(country_code: &str, region: &str) -> IpInfo {
        IpInfo {
            country_code: Some(country_code.to_string()),
            country: None,
            region_name: Some(region.to_string()),
            query: Some("203.0.113.7".to_string()),
        }
    }

    #[test]
    fn restricted_country_is_blocked() {
        let (ok, message) = evaluate(&info("US", "California"));
        assert!(!ok);
        assert!(message.contains("US"));
    }

    #[test]
    fn ontario_is_blocked_at_region_level() {
        assert!(!evaluate(&info("CA", "Ontario")).0);
    }

    #[test]
    fn unrestricted_country_passes() {
        assert!(evaluate(&info("CH", "Zurich")).0);
        assert!(evaluate(&info("", "")).0);
    }

    #[tokio::test]
    async fn testnet_and_bypass_skip_the_probe() {
        let service = GeoCheckService::new(false);
        assert!(service.is_compliant(None, true).await.0);

        let bypassed = GeoCheckService::new(true);
        assert!(bypassed.is_compliant(None, false).await.0);
    }
}
