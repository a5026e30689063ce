// ── Runtime configuration ──
//
// These types describe how to reach one controller and how hard to try.
// They never touch disk; poolside-config builds them from profiles.

use std::time::Duration;

use poolside_api::{ConnectionConfig, DEFAULT_PORT};

use crate::model::AttributeMap;

/// Default ceiling on attributes per subscription request.
pub const DEFAULT_MAX_ATTRIBUTES_PER_REQUEST: usize = 50;

/// Configuration for one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    /// Session tuning: timeouts, frame cap, queue size, heartbeat.
    pub connection: ConnectionConfig,
    /// Which object types enter the model and what is subscribed for them.
    pub attributes: AttributeMap,
    pub max_attributes_per_request: usize,
}

impl ControllerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            connection: ConnectionConfig::default(),
            attributes: AttributeMap::default(),
            max_attributes_per_request: DEFAULT_MAX_ATTRIBUTES_PER_REQUEST,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_attributes(mut self, attributes: AttributeMap) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Reconnection policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Delay after the first failed attempt. Default: 30s.
    pub base_delay: Duration,
    /// Growth per consecutive failure. Default: 1.5.
    pub multiplier: f64,
    /// Backoff ceiling. Default: 600s.
    pub max_delay: Duration,
    /// Consecutive failures that open the circuit breaker. Default: 5.
    pub failure_threshold: u32,
    /// Pause while the breaker is open. Default: 300s.
    pub cooldown: Duration,
    /// Grace period before a loss is reported. Default: 15s.
    pub disconnect_debounce: Duration,
    /// A link that drops sooner than this after connecting counts as a
    /// failed attempt. Default: 60s.
    pub stable_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 1.5,
            max_delay: Duration::from_secs(600),
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
            disconnect_debounce: Duration::from_secs(15),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = SupervisorConfig::default();
        let delays: Vec<f64> = (1..=4)
            .map(|n| config.backoff_delay(n).as_secs_f64())
            .collect();
        assert_eq!(delays, vec![30.0, 45.0, 67.5, 101.25]);
        assert_eq!(config.backoff_delay(20), Duration::from_secs(600));
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn backoff_is_monotonic() {
        let config = SupervisorConfig::default();
        let mut previous = Duration::ZERO;
        for n in 1..=30 {
            let delay = config.backoff_delay(n);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn controller_config_defaults() {
        let config = ControllerConfig::new("10.0.0.5");
        assert_eq!(config.addr(), "10.0.0.5:6681");
        assert_eq!(config.max_attributes_per_request, 50);
    }
}
