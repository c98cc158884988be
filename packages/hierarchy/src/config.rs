//! Engine configuration
//!
//! Defaults suit an interactive editor. Hosts usually deserialize this from
//! their settings file; the dev simulator also applies `NODESPACE_*`
//! environment overrides.

use crate::db::DEFAULT_REBALANCE_THRESHOLD;
use crate::services::DOMAIN_EVENT_CHANNEL_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for the debounce window; anything longer loses edits on crash
const MAX_CONTENT_DEBOUNCE_MS: u64 = 60_000;

pub const ENV_CONTENT_DEBOUNCE_MS: &str = "NODESPACE_CONTENT_DEBOUNCE_MS";
pub const ENV_WRITE_ORDERING_TIMEOUT_MS: &str = "NODESPACE_WRITE_ORDERING_TIMEOUT_MS";
pub const ENV_EVENT_CHANNEL_CAPACITY: &str = "NODESPACE_EVENT_CHANNEL_CAPACITY";
pub const ENV_REBALANCE_THRESHOLD: &str = "NODESPACE_REBALANCE_THRESHOLD";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Cannot parse {var}='{value}'")]
    Parse { var: String, value: String },

    #[error("Cannot deserialize configuration: {0}")]
    Deserialize(String),
}

/// Timing and capacity knobs for a document session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HierarchyConfig {
    /// Quiet period before a content edit is written
    pub content_debounce_ms: u64,

    /// How long a structural write waits for its parent's creation write
    pub write_ordering_timeout_ms: u64,

    /// Capacity of the async event stream
    pub event_channel_capacity: usize,

    /// Smallest sibling order gap tolerated before a scope is renumbered
    pub rebalance_threshold: f64,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            content_debounce_ms: 400,
            write_ordering_timeout_ms: 5_000,
            event_channel_capacity: DOMAIN_EVENT_CHANNEL_CAPACITY,
            rebalance_threshold: DEFAULT_REBALANCE_THRESHOLD,
        }
    }
}

impl HierarchyConfig {
    /// Build from a (possibly partial) JSON object; missing keys keep defaults
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Apply `NODESPACE_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any key lookup (environment, CLI map)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CONTENT_DEBOUNCE_MS) {
            self.content_debounce_ms = parse(ENV_CONTENT_DEBOUNCE_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_WRITE_ORDERING_TIMEOUT_MS) {
            self.write_ordering_timeout_ms = parse(ENV_WRITE_ORDERING_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_EVENT_CHANNEL_CAPACITY) {
            self.event_channel_capacity = parse(ENV_EVENT_CHANNEL_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_REBALANCE_THRESHOLD) {
            self.rebalance_threshold = parse(ENV_REBALANCE_THRESHOLD, &value)?;
        }
        self.validate().map_err(ConfigError::Invalid)?;
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.content_debounce_ms > MAX_CONTENT_DEBOUNCE_MS {
            return Err(format!(
                "content_debounce_ms cannot exceed {}",
                MAX_CONTENT_DEBOUNCE_MS
            ));
        }

        if self.write_ordering_timeout_ms == 0 {
            return Err("write_ordering_timeout_ms must be greater than 0".to_string());
        }

        if self.event_channel_capacity == 0 {
            return Err("event_channel_capacity must be greater than 0".to_string());
        }

        if !(self.rebalance_threshold > 0.0 && self.rebalance_threshold < 1.0) {
            return Err("rebalance_threshold must be between 0 and 1".to_string());
        }

        Ok(())
    }

    pub fn content_debounce(&self) -> Duration {
        Duration::from_millis(self.content_debounce_ms)
    }

    pub fn write_ordering_timeout(&self) -> Duration {
        Duration::from_millis(self.write_ordering_timeout_ms)
    }
}

fn parse<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Parse {
        var: var.to_string(),
        value: value.to_string(),
    })
}
