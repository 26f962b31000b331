use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::bus::DEFAULT_BUS_CAPACITY;
use crate::dispatcher::POST_TIMER;
use crate::error::BridgeError;
use crate::gate::DEFAULT_TIMER;

pub const ENV_CONCURRENCY: &str = "FERRY_CONCURRENCY";
pub const ENV_GATE_TIMER_MS: &str = "FERRY_GATE_TIMER_MS";
pub const ENV_POST_TIMER_MS: &str = "FERRY_POST_TIMER_MS";

/// Runtime configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Concurrency limit shared by all gates. `None` uses the host hint.
    pub concurrency: Option<usize>,
    /// Eviction timer of the request throttle.
    pub gate_timer_ms: u64,
    /// Eviction timer of the post queue.
    pub post_timer_ms: u64,
    pub bus_capacity: usize,
    /// Base URL context sources are resolved against.
    pub base_url: String,
    /// Whether this runtime itself runs inside a background context.
    pub is_worker: bool,
    /// Startup arguments handed to contexts that ask for them.
    pub args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            gate_timer_ms: DEFAULT_TIMER.as_millis() as u64,
            post_timer_ms: POST_TIMER.as_millis() as u64,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            base_url: "ferry://app/".into(),
            is_worker: false,
            args: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `FERRY_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Overlay values from `lookup`. Unparseable values are logged and skipped.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(n) = parse_var::<usize>(&lookup, ENV_CONCURRENCY) {
            self.concurrency = Some(n).filter(|n| *n > 0);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_GATE_TIMER_MS) {
            self.gate_timer_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_POST_TIMER_MS) {
            self.post_timer_ms = ms;
        }
    }

    pub fn gate_timer(&self) -> Duration {
        Duration::from_millis(self.gate_timer_ms)
    }

    pub fn post_timer(&self) -> Duration {
        Duration::from_millis(self.post_timer_ms)
    }

    pub fn base_url(&self) -> Result<Url, BridgeError> {
        Url::parse(&self.base_url).map_err(|e| BridgeError::InvalidSource {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_gate_constants() {
        let config = RuntimeConfig::default();
        assert_eq!(config.gate_timer(), Duration::from_millis(256));
        assert_eq!(config.post_timer(), Duration::from_millis(64));
        assert_eq!(config.concurrency, None);
        assert_eq!(config.base_url().unwrap().as_str(), "ferry://app/");
    }

    #[test]
    fn overrides_apply() {
        let mut config = RuntimeConfig::default();
        config.apply_overrides(lookup(&[
            (ENV_CONCURRENCY, "8"),
            (ENV_GATE_TIMER_MS, "500"),
            (ENV_POST_TIMER_MS, " 32 "),
        ]));
        assert_eq!(config.concurrency, Some(8));
        assert_eq!(config.gate_timer_ms, 500);
        assert_eq!(config.post_timer_ms, 32);
    }

    #[test]
    fn bad_or_zero_overrides() {
        let mut config = RuntimeConfig {
            concurrency: Some(3),
            ..RuntimeConfig::default()
        };
        config.apply_overrides(lookup(&[(ENV_GATE_TIMER_MS, "soon")]));
        assert_eq!(config.gate_timer_ms, 256);
        assert_eq!(config.concurrency, Some(3));

        config.apply_overrides(lookup(&[(ENV_CONCURRENCY, "0")]));
        assert_eq!(config.concurrency, None);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"concurrency": 2, "is_worker": true}"#).unwrap();
        assert_eq!(config.concurrency, Some(2));
        assert!(config.is_worker);
        assert_eq!(config.post_timer_ms, 64);
        assert_eq!(config.bus_capacity, DEFAULT_BUS_CAPACITY);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let config = RuntimeConfig {
            base_url: "not a url".into(),
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            config.base_url(),
            Err(BridgeError::InvalidSource { .. })
        ));
    }
}
