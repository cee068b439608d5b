//! Scheduler configuration

use std::time::Duration;

/// Scheduler timing options
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period; should not exceed the shortest channel interval
    pub tick_interval: Duration,

    /// How often disconnected sources are asked to reconnect
    pub connection_check_interval: Duration,

    /// How often throughput statistics are logged
    pub stats_interval: Duration,

    /// How often stale viewers are swept
    pub cleanup_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(5),
            connection_check_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Set the tick period
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the reconnect check period
    pub fn connection_check_interval(mut self, interval: Duration) -> Self {
        self.connection_check_interval = interval;
        self
    }

    /// Set the statistics period
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the viewer sweep period
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}
