use crate::engine::EngineOptions;
use crate::limits::DAY_MS;

pub const METRICS_PORT_VAR: &str = "CLUSTERBOOK_METRICS_PORT";
pub const CACHE_CAPACITY_VAR: &str = "CLUSTERBOOK_CACHE_CAPACITY";
pub const MAX_QUERY_WINDOW_DAYS_VAR: &str = "CLUSTERBOOK_MAX_QUERY_WINDOW_DAYS";

/// Runtime settings read from `CLUSTERBOOK_*` environment variables.
/// Missing or unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Prometheus exporter port; `None` disables the exporter.
    pub metrics_port: Option<u16>,
    pub cache_capacity: usize,
    pub max_query_window_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_port: None,
            cache_capacity: 32,
            max_query_window_days: 366,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let metrics_port: Option<u16> = lookup(METRICS_PORT_VAR).and_then(|s| s.parse().ok());
        let cache_capacity: usize = lookup(CACHE_CAPACITY_VAR)
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cache_capacity);
        let max_query_window_days: i64 = lookup(MAX_QUERY_WINDOW_DAYS_VAR)
            .and_then(|s| s.parse().ok())
            .filter(|days| *days > 0)
            .unwrap_or(defaults.max_query_window_days);
        Self {
            metrics_port,
            cache_capacity,
            max_query_window_days,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            cache_capacity: self.cache_capacity,
            max_query_window_ms: self.max_query_window_days.saturating_mul(DAY_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.engine_options(), EngineOptions::default());
    }

    #[test]
    fn reads_all_variables() {
        let config = Config::from_lookup(lookup(&[
            (METRICS_PORT_VAR, "9100"),
            (CACHE_CAPACITY_VAR, "4"),
            (MAX_QUERY_WINDOW_DAYS_VAR, "7"),
        ]));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.cache_capacity, 4);
        let options = config.engine_options();
        assert_eq!(options.max_query_window_ms, 7 * DAY_MS);
        assert_eq!(options.cache_capacity, 4);
    }

    #[test]
    fn garbage_falls_back() {
        let config = Config::from_lookup(lookup(&[
            (METRICS_PORT_VAR, "not-a-port"),
            (CACHE_CAPACITY_VAR, "-1"),
            (MAX_QUERY_WINDOW_DAYS_VAR, "0"),
        ]));
        assert_eq!(config, Config::default());
    }
}
