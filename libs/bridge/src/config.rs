//! Configuration for the forwarding bridge
//!
//! Loaded from TOML with defaults for every field:
//!
//! ```toml
//! [bridge]
//! name = "telemetry-bridge"
//! flow_control_prefix = "telemetry.flow-control"
//! downstream_prefix = "telemetry"
//! drain_ack_timeout_ms = 5000
//! sender_create_timeout_ms = 10000
//!
//! [downstream]
//! window = 100
//! ```
//!
//! `BRIDGE_DRAIN_ACK_TIMEOUT_MS` and `BRIDGE_SENDER_CREATE_TIMEOUT_MS`
//! override the matching timeouts when set.

use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    pub downstream: DownstreamSettings,
}

/// Core adapter behaviour
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Name used in logs
    pub name: String,

    /// Prefix of upstream flow-control channel addresses
    pub flow_control_prefix: String,

    /// Prefix of downstream sender addresses
    pub downstream_prefix: String,

    /// How long a drain announcement waits for the upstream acknowledgement
    pub drain_ack_timeout_ms: u64,

    /// How long an attach waits for the sender factory
    pub sender_create_timeout_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            name: "telemetry-bridge".to_string(),
            flow_control_prefix: "telemetry.flow-control".to_string(),
            downstream_prefix: "telemetry".to_string(),
            drain_ack_timeout_ms: 5000,
            sender_create_timeout_ms: 10000,
        }
    }
}

impl BridgeSettings {
    pub fn drain_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_ack_timeout_ms)
    }

    pub fn sender_create_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_create_timeout_ms)
    }
}

/// In-memory downstream used by development runs
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DownstreamSettings {
    /// Credit window of every memory sender
    pub window: usize,
}

impl Default for DownstreamSettings {
    fn default() -> Self {
        Self { window: 100 }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Io(format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate().map_err(BridgeError::invalid_config)?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BridgeError::invalid_config(format!("failed to parse TOML: {}", e)))?;
        config.validate().map_err(BridgeError::invalid_config)?;
        Ok(config)
    }

    /// Override timeouts from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_u64("BRIDGE_DRAIN_ACK_TIMEOUT_MS") {
            self.bridge.drain_ack_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("BRIDGE_SENDER_CREATE_TIMEOUT_MS") {
            self.bridge.sender_create_timeout_ms = ms;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        let bridge = &self.bridge;

        if bridge.flow_control_prefix.is_empty() {
            return Err("flow_control_prefix cannot be empty".to_string());
        }
        if bridge.downstream_prefix.is_empty() {
            return Err("downstream_prefix cannot be empty".to_string());
        }
        if bridge.downstream_prefix.contains('/') {
            return Err(format!(
                "downstream_prefix '{}' must not contain '/'",
                bridge.downstream_prefix
            ));
        }
        if bridge.drain_ack_timeout_ms == 0 {
            return Err("drain_ack_timeout_ms must be greater than 0".to_string());
        }
        if bridge.sender_create_timeout_ms == 0 {
            return Err("sender_create_timeout_ms must be greater than 0".to_string());
        }
        if self.downstream.window == 0 {
            return Err("downstream window must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    match env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("Ignoring {}={}: not a number", key, value);
                None
            }
        },
        Err(_) => None,
    }
}
