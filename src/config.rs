use std::time::Duration;

use crate::params::{ModelParams, ParamKey, DEFAULT_K, DEFAULT_SPLIT_PCT};

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Base URL of the regression service, or `stub` for the in-process one.
    pub api_base: String,
    pub debounce: Duration,
    pub request_timeout: Duration,
    /// Parameters committed at mount. Already normalized.
    pub initial: ParamKey,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000".to_string(),
            debounce: Duration::from_millis(350),
            request_timeout: Duration::from_millis(15_000),
            initial: ParamKey::new(DEFAULT_K, DEFAULT_SPLIT_PCT),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        let k = std::env::var("DEFAULT_K").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_K as i64);
        let split_pct = std::env::var("DEFAULT_SPLIT_PCT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SPLIT_PCT as i64);
        Self {
            api_base: std::env::var("ELECTRIBILL_API_BASE").unwrap_or(base.api_base),
            debounce: std::env::var("DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(base.debounce),
            request_timeout: std::env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(base.request_timeout),
            initial: ModelParams::new(k, split_pct).key(),
        }
    }

    pub fn initial_params(&self) -> ModelParams {
        ModelParams::new(self.initial.k as i64, self.initial.split_pct as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.debounce, Duration::from_millis(350));
        assert_eq!(cfg.request_timeout, Duration::from_secs(15));
        assert_eq!(cfg.initial, ParamKey::new(9, 90));
        assert_eq!(cfg.initial_params().key(), cfg.initial);
    }
}
