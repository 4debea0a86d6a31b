//! Host configuration.

use std::time::Duration;

/// Configuration for a replica host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Host's logical name (for logging)
    pub name: String,

    /// How long `demand` waits for the authoritative peer to respond
    /// (default: 5s)
    pub demand_timeout: Duration,

    /// Broadcast state changes buffered, so peers joining later replay
    /// them (default: true)
    pub buffer_state_changes: bool,

    /// Tick rate in Hz the host is expected to be driven at (default: 30)
    pub tick_rate_hz: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "netfsm-host".to_string(),
            demand_timeout: Duration::from_secs(5),
            buffer_state_changes: true,
            tick_rate_hz: 30,
        }
    }
}

impl HostConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Duration of one tick at `tick_rate_hz`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_default() {
        let config = HostConfig::default();
        assert_eq!(config.tick_rate_hz, 30);
        assert_eq!(config.demand_timeout, Duration::from_secs(5));
        assert!(config.buffer_state_changes);
    }

    #[test]
    fn test_tick_interval() {
        let config = HostConfig {
            tick_rate_hz: 50,
            ..HostConfig::named("fast")
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(20));
        assert_eq!(config.name, "fast");
    }
}
