//! Node management configuration.

use std::time::Duration;

use dockwarden_transport::TransportConfig;
use serde::{Deserialize, Serialize};

/// Settings shared by every managed node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Connect retry schedule.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Degraded-mode fallback polling.
    #[serde(default)]
    pub health: HealthConfig,
    /// Event stream ingestion.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Debounce and flapping detection.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Container recreation and stop handling.
    #[serde(default)]
    pub recreate: RecreateConfig,
    /// Session and engine transport.
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Exponential backoff for connect attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    #[serde(default = "ReconnectConfig::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for the delay.
    #[serde(default = "ReconnectConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Leading failed attempts logged at `warn`. Later failures log at `debug`.
    #[serde(default = "ReconnectConfig::default_fast_attempts")]
    pub fast_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: Self::default_initial_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            fast_attempts: Self::default_fast_attempts(),
        }
    }
}

impl ReconnectConfig {
    const fn default_initial_delay_ms() -> u64 {
        5_000
    }

    const fn default_max_delay_ms() -> u64 {
        30_000
    }

    const fn default_fast_attempts() -> u32 {
        3
    }

    /// Initial delay.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Degraded-mode polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval of the shell-exec fallback poll while degraded.
    #[serde(default = "HealthConfig::default_fallback_poll_secs")]
    pub fallback_poll_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            fallback_poll_secs: Self::default_fallback_poll_secs(),
        }
    }
}

impl HealthConfig {
    const fn default_fallback_poll_secs() -> u64 {
        30
    }

    /// Fallback poll interval.
    #[must_use]
    pub const fn fallback_poll(&self) -> Duration {
        Duration::from_secs(self.fallback_poll_secs)
    }
}

/// Event ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Window in which a repeated event key is discarded.
    #[serde(default = "IngestConfig::default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    /// Dedup entries kept before the set is cleared wholesale.
    #[serde(default = "IngestConfig::default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Delay before a terminated event stream is reopened.
    #[serde(default = "IngestConfig::default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: Self::default_dedup_window_ms(),
            dedup_capacity: Self::default_dedup_capacity(),
            restart_delay_secs: Self::default_restart_delay_secs(),
        }
    }
}

impl IngestConfig {
    const fn default_dedup_window_ms() -> u64 {
        100
    }

    const fn default_dedup_capacity() -> usize {
        200
    }

    const fn default_restart_delay_secs() -> u64 {
        5
    }

    /// Dedup window.
    #[must_use]
    pub const fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    /// Stream restart delay.
    #[must_use]
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

/// State-change monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How long a `start`/`stop` is held back waiting for its opposite.
    #[serde(default = "MonitorConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    /// Rolling window for counting transitions.
    #[serde(default = "MonitorConfig::default_flapping_window_secs")]
    pub flapping_window_secs: u64,
    /// Transitions within the window above which a container is flapping.
    #[serde(default = "MonitorConfig::default_flapping_threshold")]
    pub flapping_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: Self::default_debounce_ms(),
            flapping_window_secs: Self::default_flapping_window_secs(),
            flapping_threshold: Self::default_flapping_threshold(),
        }
    }
}

impl MonitorConfig {
    const fn default_debounce_ms() -> u64 {
        2_000
    }

    const fn default_flapping_window_secs() -> u64 {
        60
    }

    const fn default_flapping_threshold() -> usize {
        5
    }

    /// Debounce window.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Flapping window.
    #[must_use]
    pub const fn flapping_window(&self) -> Duration {
        Duration::from_secs(self.flapping_window_secs)
    }
}

/// Container stop and recreation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecreateConfig {
    /// Grace period given to a container on stop.
    #[serde(default = "RecreateConfig::default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl Default for RecreateConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: Self::default_stop_timeout_secs(),
        }
    }
}

impl RecreateConfig {
    const fn default_stop_timeout_secs() -> u64 {
        10
    }

    /// Stop grace period.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config.reconnect.initial_delay(), Duration::from_secs(5));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(30));
        assert_eq!(config.health.fallback_poll(), Duration::from_secs(30));
        assert_eq!(config.ingest.dedup_window(), Duration::from_millis(100));
        assert_eq!(config.ingest.dedup_capacity, 200);
        assert_eq!(config.ingest.restart_delay(), Duration::from_secs(5));
        assert_eq!(config.monitor.flapping_threshold, 5);
        assert_eq!(config.recreate.stop_timeout(), Duration::from_secs(10));
        assert_eq!(config.transport.command_timeout_secs, 120);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            [monitor]
            debounce_ms = 500

            [transport]
            shell_only = true
            "#,
        )
        .unwrap();
        assert_eq!(config.monitor.debounce(), Duration::from_millis(500));
        assert_eq!(config.monitor.flapping_window(), Duration::from_secs(60));
        assert!(config.transport.shell_only);
    }
}
