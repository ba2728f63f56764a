// =============================================================================
// Feed Hub Configuration — JSON file with environment overrides
// =============================================================================
//
// Every field carries a serde default so a partial (or missing) file still
// yields a usable config. Secrets come from the environment only and are
// never serialised.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::queue::DEFAULT_QUEUE_CAPACITY;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_bar_capacity() -> usize {
    crate::market_data::DEFAULT_BAR_CAPACITY
}

fn default_dispatch_idle_ms() -> u64 {
    50
}

fn default_overflow_pause_ms() -> u64 {
    1_000
}

fn default_token_check_secs() -> u64 {
    30
}

fn default_history_page_size() -> u32 {
    10_000
}

fn default_history_page_delay_ms() -> u64 {
    100
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

// =============================================================================
// Hosts
// =============================================================================

/// Broker endpoints for one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hosts {
    pub authorization: String,
    pub data: String,
    pub websocket: String,
}

impl Hosts {
    pub fn production() -> Self {
        Self {
            authorization: "https://oauth.alor.ru".to_string(),
            data: "https://api.alor.ru".to_string(),
            websocket: "wss://api.alor.ru/ws".to_string(),
        }
    }

    pub fn development() -> Self {
        Self {
            authorization: "https://oauthdev.alor.ru".to_string(),
            data: "https://apidev.alor.ru".to_string(),
            websocket: "wss://apidev.alor.ru/ws".to_string(),
        }
    }
}

// =============================================================================
// Reconnect policy
// =============================================================================

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_ms: u64,
}

impl ReconnectPolicy {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// Delay after `current`: doubled, capped at the maximum.
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max())
    }

    /// Backoff cap. Also bounds a single dial.
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_ms: default_reconnect_initial_ms(),
            max_ms: default_reconnect_max_ms(),
        }
    }
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Use the broker's development circuit.
    #[serde(default = "default_true")]
    pub dev_circuit: bool,

    /// Explicit endpoints; when absent they follow `dev_circuit`.
    #[serde(default)]
    pub hosts: Option<Hosts>,

    /// Long-lived refresh credential. Environment only.
    #[serde(skip)]
    pub refresh_token: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    // --- Pipeline sizing -----------------------------------------------------
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    #[serde(default = "default_bar_capacity")]
    pub bar_capacity: usize,

    // --- Loop timing ---------------------------------------------------------
    /// Dispatcher sleep when the event queue is empty.
    #[serde(default = "default_dispatch_idle_ms")]
    pub dispatch_idle_ms: u64,

    /// Reader pause while the event queue is full.
    #[serde(default = "default_overflow_pause_ms")]
    pub overflow_pause_ms: u64,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default = "default_token_check_secs")]
    pub token_check_secs: u64,

    // --- History backfill ----------------------------------------------------
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,

    #[serde(default = "default_history_page_delay_ms")]
    pub history_page_delay_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            dev_circuit: true,
            hosts: None,
            refresh_token: String::new(),
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            queue_capacity: default_queue_capacity(),
            subscriber_queue_capacity: default_queue_capacity(),
            bar_capacity: default_bar_capacity(),
            dispatch_idle_ms: default_dispatch_idle_ms(),
            overflow_pause_ms: default_overflow_pause_ms(),
            reconnect: ReconnectPolicy::default(),
            token_check_secs: default_token_check_secs(),
            history_page_size: default_history_page_size(),
            history_page_delay_ms: default_history_page_delay_ms(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            dev_circuit = config.dev_circuit,
            bind_addr = %config.bind_addr,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply `FEEDHUB_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(token) = lookup("FEEDHUB_REFRESH_TOKEN") {
            self.refresh_token = token;
        }
        if let Some(flag) = lookup("FEEDHUB_DEV_CIRCUIT") {
            self.dev_circuit = flag
                .trim()
                .parse()
                .with_context(|| format!("FEEDHUB_DEV_CIRCUIT must be true or false, got {flag}"))?;
        }
        if let Some(addr) = lookup("FEEDHUB_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(level) = lookup("FEEDHUB_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Endpoints in effect.
    pub fn hosts(&self) -> Hosts {
        match &self.hosts {
            Some(hosts) => hosts.clone(),
            None if self.dev_circuit => Hosts::development(),
            None => Hosts::production(),
        }
    }

    pub fn dispatch_idle(&self) -> Duration {
        Duration::from_millis(self.dispatch_idle_ms)
    }

    pub fn overflow_pause(&self) -> Duration {
        Duration::from_millis(self.overflow_pause_ms)
    }

    pub fn history_page_delay(&self) -> Duration {
        Duration::from_millis(self.history_page_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let config: FeedConfig =
            serde_json::from_str(r#"{"dev_circuit": false, "reconnect": {"max_ms": 5000}}"#).unwrap();
        assert!(!config.dev_circuit);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.bar_capacity, 5_000);
        assert_eq!(config.reconnect.initial_ms, 1_000);
        assert_eq!(config.reconnect.max_ms, 5_000);
        assert_eq!(config.hosts(), Hosts::production());
    }

    #[test]
    fn refresh_token_never_serialised() {
        let mut config = FeedConfig::default();
        config.refresh_token = "secret".into();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("FEEDHUB_REFRESH_TOKEN", "r-1"),
            ("FEEDHUB_DEV_CIRCUIT", "false"),
            ("FEEDHUB_BIND_ADDR", "127.0.0.1:9000"),
        ]
        .into_iter()
        .collect();
        let mut config = FeedConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.refresh_token, "r-1");
        assert!(!config.dev_circuit);
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.hosts().websocket, "wss://api.alor.ru/ws");
    }

    #[test]
    fn bad_flag_is_rejected() {
        let mut config = FeedConfig::default();
        assert!(config
            .apply_overrides(|k| (k == "FEEDHUB_DEV_CIRCUIT").then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        let mut delay = policy.initial();
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = policy.next(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(FeedConfig::load("/nonexistent/feedhub.json").is_err());
    }
}
