use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::Priority;

/// Maps a sequence number to its transmission priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PriorityRule {
    /// High priority when `seq % n == 0`.
    EveryNth { n: u32 },
    Constant { priority: Priority },
    /// Code-only rule; cannot be expressed in a config file.
    #[serde(skip)]
    Custom(fn(u32) -> Priority),
}

impl Default for PriorityRule {
    fn default() -> Self {
        PriorityRule::EveryNth { n: 3 }
    }
}

impl PriorityRule {
    pub fn priority_of(&self, seq_num: u32) -> Priority {
        match *self {
            PriorityRule::EveryNth { n } => {
                if n != 0 && seq_num % n == 0 {
                    Priority::High
                } else {
                    Priority::Normal
                }
            }
            PriorityRule::Constant { priority } => priority,
            PriorityRule::Custom(rule) => rule(seq_num),
        }
    }
}

/// Parameters of one transfer, shared by both endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArqConfig {
    /// Maximum number of outstanding unacknowledged packets.
    pub window_capacity: usize,
    /// Number of messages in the finite transfer.
    pub total_messages: u32,
    /// Drop rate of the sender's fault injector.
    pub loss_probability: f64,
    /// How long the sender waits for any packet before re-queueing the window.
    pub ack_timeout_ms: u64,
    pub priority_rule: PriorityRule,
    /// Injected losses in a row after which a drain stops and leaves the
    /// rest of the queue for the next one.
    pub max_consecutive_losses: u32,
    /// Seed for the fault injector; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            window_capacity: 5,
            total_messages: 100,
            loss_probability: 0.1,
            ack_timeout_ms: 2000,
            priority_rule: PriorityRule::default(),
            max_consecutive_losses: 64,
            seed: None,
        }
    }
}

impl ArqConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Value placed in the one-byte window field of outgoing packets.
    pub fn advertised_window(&self) -> u8 {
        u8::try_from(self.window_capacity).unwrap_or(u8::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 || self.window_capacity > usize::from(u8::MAX) {
            return Err(ConfigError::WindowCapacity(self.window_capacity));
        }
        if !(0.0..1.0).contains(&self.loss_probability) {
            return Err(ConfigError::LossProbability(self.loss_probability));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_consecutive_losses == 0 {
            return Err(ConfigError::ZeroLossLimit);
        }
        if let PriorityRule::EveryNth { n: 0 } = self.priority_rule {
            return Err(ConfigError::ZeroModulus);
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ArqConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

/// Behaviour of the in-memory channel used by the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Probability that a sender datagram has one byte flipped in flight.
    pub corrupt_rate: f64,
    /// Probability that a sender datagram is delivered twice.
    pub duplicate_rate: f64,
    pub min_latency: u64,
    pub max_latency: u64,
    pub seed: u64,
    /// Simulated time after which a run is abandoned.
    pub max_duration_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            corrupt_rate: 0.0,
            duplicate_rate: 0.0,
            min_latency: 10,
            max_latency: 100,
            seed: 0,
            max_duration_ms: 600_000,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_latency > self.max_latency {
            return Err(ConfigError::LatencyRange {
                min: self.min_latency,
                max: self.max_latency,
            });
        }
        for (name, value) in [
            ("corrupt_rate", self.corrupt_rate),
            ("duplicate_rate", self.duplicate_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Rate { name, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("window capacity must be between 1 and 255, got {0}")]
    WindowCapacity(usize),
    #[error("loss probability must lie in [0, 1), got {0}")]
    LossProbability(f64),
    #[error("ack timeout must be non-zero")]
    ZeroTimeout,
    #[error("max consecutive losses must be non-zero")]
    ZeroLossLimit,
    #[error("priority rule modulus must be non-zero")]
    ZeroModulus,
    #[error("min latency {min} exceeds max latency {max}")]
    LatencyRange { min: u64, max: u64 },
    #[error("{name} must lie in [0, 1], got {value}")]
    Rate { name: &'static str, value: f64 },
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}
