use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::message::ProcessId;

/// Main configuration for a ring node deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Ring topology settings
    pub ring: TopologyConfig,
    /// Protocol timing settings
    pub timing: TimingConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Ring topology configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Number of participants in the ring
    pub process_count: usize,
    /// Participant that seeds the initial ping/pong pair
    pub coordinator: ProcessId,
}

/// Inclusive delay range in milliseconds, sampled uniformly per use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const fn zero() -> Self {
        Self {
            min_ms: 0,
            max_ms: 0,
        }
    }

    /// Draw a random duration from the range
    pub fn sample(&self) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(ms)
    }
}

/// Protocol timing configuration. The delays simulate the protected work and
/// de-synchronize forwarding so runs do not proceed in lock step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How long a participant stays in the critical section
    pub cs_hold: DelayRange,
    /// Pause before forwarding the ping token
    pub ping_forward_delay: DelayRange,
    /// Pause between forwarding ping and forwarding pong
    pub pong_forward_delay: DelayRange,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring: TopologyConfig {
                process_count: 4,
                coordinator: 0,
            },
            timing: TimingConfig {
                cs_hold: DelayRange::new(6000, 7000),
                ping_forward_delay: DelayRange::new(1000, 2000),
                pong_forward_delay: DelayRange::new(500, 1000),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl RingConfig {
    /// Load configuration from file, layered with `MISRA_`-prefixed
    /// environment variable overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MISRA").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.ring.process_count < 2 {
            return Err("process_count must be at least 2".to_string());
        }

        if self.ring.coordinator >= self.ring.process_count {
            return Err(format!(
                "coordinator {} is outside the ring of {} processes",
                self.ring.coordinator, self.ring.process_count
            ));
        }

        for (name, range) in [
            ("cs_hold", &self.timing.cs_hold),
            ("ping_forward_delay", &self.timing.ping_forward_delay),
            ("pong_forward_delay", &self.timing.pong_forward_delay),
        ] {
            if range.min_ms > range.max_ms {
                return Err(format!(
                    "timing.{} has min_ms {} greater than max_ms {}",
                    name, range.min_ms, range.max_ms
                ));
            }
        }

        Ok(())
    }
}
