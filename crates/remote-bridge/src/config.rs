//! Bridge tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Timeout applied when a caller does not name one.
    pub default_timeout_ms: u64,
    /// Upper bound for caller supplied timeouts.
    pub max_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Ping cadence for live connections; 0 disables heartbeats.
    pub heartbeat_interval_ms: u64,
    /// A connection with no inbound traffic for this long is dropped.
    pub idle_timeout_ms: u64,
    /// In-flight commands allowed per tenant; 0 means unbounded.
    pub max_in_flight_per_tenant: u32,
    pub max_frame_bytes: usize,
    pub outbound_buffer: usize,
    pub event_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            sweep_interval_ms: 250,
            heartbeat_interval_ms: 15_000,
            idle_timeout_ms: 45_000,
            max_in_flight_per_tenant: 64,
            max_frame_bytes: 1024 * 1024,
            outbound_buffer: 64,
            event_buffer: 256,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.sweep_interval_ms == 0 {
            return Err(invalid("sweep_interval_ms must be greater than zero"));
        }
        if self.default_timeout_ms == 0 {
            return Err(invalid("default_timeout_ms must be greater than zero"));
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(invalid("default_timeout_ms exceeds max_timeout_ms"));
        }
        if self.outbound_buffer == 0 {
            return Err(invalid("outbound_buffer must be greater than zero"));
        }
        if self.heartbeat_interval_ms > 0 && self.idle_timeout_ms <= self.heartbeat_interval_ms {
            return Err(invalid(
                "idle_timeout_ms must be larger than heartbeat_interval_ms",
            ));
        }
        Ok(())
    }

    /// Resolves a caller supplied timeout, falling back to the default and
    /// clamping to the configured maximum.
    pub fn resolve_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

fn invalid(message: &str) -> BridgeError {
    BridgeError::InvalidArgument(format!("bridge config: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        BridgeConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_idle_timeout_below_heartbeat() {
        let cfg = BridgeConfig {
            heartbeat_interval_ms: 10_000,
            idle_timeout_ms: 5_000,
            ..BridgeConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(BridgeError::InvalidArgument(_))
        ));

        let no_heartbeat = BridgeConfig {
            heartbeat_interval_ms: 0,
            idle_timeout_ms: 0,
            ..BridgeConfig::default()
        };
        no_heartbeat.validate().unwrap();
    }

    #[test]
    fn resolve_timeout_clamps_and_defaults() {
        let cfg = BridgeConfig {
            default_timeout_ms: 2_000,
            max_timeout_ms: 10_000,
            ..BridgeConfig::default()
        };
        assert_eq!(cfg.resolve_timeout(None), Duration::from_secs(2));
        assert_eq!(cfg.resolve_timeout(Some(0)), Duration::from_secs(2));
        assert_eq!(cfg.resolve_timeout(Some(500)), Duration::from_millis(500));
        assert_eq!(cfg.resolve_timeout(Some(60_000)), Duration::from_secs(10));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: BridgeConfig =
            serde_json::from_str(r#"{"max_in_flight_per_tenant": 4}"#).unwrap();
        assert_eq!(cfg.max_in_flight_per_tenant, 4);
        assert_eq!(cfg.sweep_interval_ms, 250);
    }
}
