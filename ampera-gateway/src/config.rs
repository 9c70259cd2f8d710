//! Gateway configuration
//!
//! Settings for the central-system listener, liveness windows and
//! billing guards.

use std::time::Duration;

use ampera_core::Money;

/// Complete gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP listen address for charge point WebSocket connections
    pub listen_addr: String,

    /// Heartbeat interval (seconds) advertised to charge points in the
    /// BootNotification response; also drives the liveness window
    pub heartbeat_interval: u32,

    /// How long a remote-start reservation waits for the charger's
    /// confirming StartTransaction
    pub pending_timeout: Duration,

    /// Cards below this balance are denied at session start (minor
    /// currency units; 0 disables the check)
    pub min_start_balance: Money,

    /// System default price per kWh when no pricing rule matches
    pub default_price_per_kwh: Money,

    /// Capacity of the live event ring
    pub event_capacity: usize,

    /// Timeout for outbound remote commands awaiting a charge point reply
    pub request_timeout: Duration,

    /// Watchdog sweep interval
    pub sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            heartbeat_interval: 300,
            pending_timeout: Duration::from_secs(90),
            min_start_balance: 0,
            default_price_per_kwh: ampera_core::pricing::DEFAULT_PRICE_PER_KWH,
            event_capacity: 256,
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, seconds: u32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn with_min_start_balance(mut self, minimum: Money) -> Self {
        self.min_start_balance = minimum;
        self
    }

    pub fn with_default_price(mut self, price_per_kwh: Money) -> Self {
        self.default_price_per_kwh = price_per_kwh;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = GatewayConfig::new("127.0.0.1:9901")
            .with_heartbeat_interval(60)
            .with_min_start_balance(500)
            .with_default_price(1_500);

        assert_eq!(config.listen_addr, "127.0.0.1:9901");
        assert_eq!(config.heartbeat_interval, 60);
        assert_eq!(config.min_start_balance, 500);
        assert_eq!(config.default_price_per_kwh, 1_500);
    }
}
