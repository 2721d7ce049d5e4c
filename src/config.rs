use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::series::DEFAULT_MAX_POINTS;
use crate::whales::DEFAULT_WHALE_MIN_ETH;

#[derive(Debug, Clone)]
pub struct Config {
    pub eth_rpc_url: Option<String>,
    pub eth_ws_url: Option<String>,
    pub database_url: String,
    pub http_bind_addr: String,
    pub max_chart_points: usize,
    pub poll_interval: Duration,
    pub whale_min_eth: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing ETH_RPC_URL env var")]
    MissingEthRpcUrl,
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let eth_rpc_url = non_empty("ETH_RPC_URL");
        let eth_ws_url = non_empty("ETH_WS_URL");
        let database_url = non_empty("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://data/gas_telemetry.db".to_string());
        let http_bind_addr =
            non_empty("HTTP_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let max_chart_points: usize =
            parse_var("MAX_CHART_POINTS", non_empty("MAX_CHART_POINTS"), DEFAULT_MAX_POINTS)?;
        let poll_interval_secs: u64 =
            parse_var("POLL_INTERVAL_SECS", non_empty("POLL_INTERVAL_SECS"), 12)?;
        let whale_min_eth: f64 =
            parse_var("WHALE_MIN_ETH", non_empty("WHALE_MIN_ETH"), DEFAULT_WHALE_MIN_ETH)?;

        if max_chart_points == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_CHART_POINTS",
                value: "0".to_string(),
            });
        }
        if poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }
        if !whale_min_eth.is_finite() || whale_min_eth < 0.0 {
            return Err(ConfigError::Invalid {
                var: "WHALE_MIN_ETH",
                value: whale_min_eth.to_string(),
            });
        }

        Ok(Self {
            eth_rpc_url,
            eth_ws_url,
            database_url,
            http_bind_addr,
            max_chart_points,
            poll_interval: Duration::from_secs(poll_interval_secs),
            whale_min_eth,
        })
    }

    pub fn require_rpc_url(&self) -> Result<&str, ConfigError> {
        self.eth_rpc_url
            .as_deref()
            .ok_or(ConfigError::MissingEthRpcUrl)
    }
}

fn parse_var<T: FromStr>(
    var: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert!(config.eth_rpc_url.is_none());
        assert_eq!(config.database_url, "sqlite://data/gas_telemetry.db");
        assert_eq!(config.http_bind_addr, "127.0.0.1:8080");
        assert_eq!(config.max_chart_points, 700);
        assert_eq!(config.poll_interval, Duration::from_secs(12));
        assert_eq!(config.whale_min_eth, 0.5);
        assert!(matches!(
            config.require_rpc_url(),
            Err(ConfigError::MissingEthRpcUrl)
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("ETH_RPC_URL", "http://localhost:8545"),
            ("MAX_CHART_POINTS", " 350 "),
            ("POLL_INTERVAL_SECS", "3"),
            ("WHALE_MIN_ETH", "10"),
        ])
        .unwrap();
        assert_eq!(config.require_rpc_url().unwrap(), "http://localhost:8545");
        assert_eq!(config.max_chart_points, 350);
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.whale_min_eth, 10.0);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("ETH_RPC_URL", "  "), ("MAX_CHART_POINTS", "")]).unwrap();
        assert!(config.eth_rpc_url.is_none());
        assert_eq!(config.max_chart_points, 700);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = config_from(&[("MAX_CHART_POINTS", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "MAX_CHART_POINTS", .. }));
        assert!(config_from(&[("POLL_INTERVAL_SECS", "0")]).is_err());
        assert!(config_from(&[("WHALE_MIN_ETH", "-1")]).is_err());
    }
}
