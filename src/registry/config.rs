//! Registry configuration

use std::time::Duration;

/// Backend registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A backend counts as alive if it registered within this window
    pub alive_window: Duration,

    /// How long a stream stays pinned to its backend after its last pick
    pub pin_ttl: Duration,

    /// Interval between cleanup passes
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            alive_window: Duration::from_secs(300),
            pin_ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl RegistryConfig {
    /// Set the liveness window
    pub fn alive_window(mut self, window: Duration) -> Self {
        self.alive_window = window;
        self
    }

    /// Set the stream pin TTL
    pub fn pin_ttl(mut self, ttl: Duration) -> Self {
        self.pin_ttl = ttl;
        self
    }

    /// Set the cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Backends silent for this long are dropped from the registry
    pub fn eviction_window(&self) -> Duration {
        self.alive_window * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.alive_window, Duration::from_secs(300));
        assert_eq!(config.eviction_window(), Duration::from_secs(600));
    }

    #[test]
    fn test_builder_chaining() {
        let config = RegistryConfig::default()
            .alive_window(Duration::from_secs(10))
            .pin_ttl(Duration::from_secs(20))
            .cleanup_interval(Duration::from_millis(50));

        assert_eq!(config.alive_window, Duration::from_secs(10));
        assert_eq!(config.pin_ttl, Duration::from_secs(20));
        assert_eq!(config.cleanup_interval, Duration::from_millis(50));
    }
}
