//! Runtime and scheduler configuration.
//!
//! Both structs deserialize from JSON with every field optional, so a host
//! can override a single knob:
//!
//! ```rust
//! use trellis_core::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_json(r#"{ "yield_interval_ms": 8 }"#).unwrap();
//! assert_eq!(config.yield_interval_ms, 8);
//! assert_eq!(config.max_yield_interval_ms, 300);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReactiveError, Result};

/// Largest timeout a task may carry; tasks without a timeout use it.
pub const MAX_TASK_TIMEOUT_MS: u64 = 1_073_741_823;

/// Knobs for the update engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Size of the pure queue at which a flush is aborted as a runaway loop.
    pub max_pending_updates: usize,

    /// Emit a warning when computations are created outside any owner.
    pub warn_unowned: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_pending_updates: 1_000_000,
            warn_unowned: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.max_pending_updates == 0 {
            return Err(ReactiveError::Config(
                "max_pending_updates must be positive".into(),
            ));
        }
        Ok(config)
    }
}

/// Knobs for the cooperative task scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Length of one time slice before the scheduler considers yielding.
    pub yield_interval_ms: u64,

    /// Ceiling after which the scheduler yields even without pending input.
    pub max_yield_interval_ms: u64,

    /// Timeout applied to tasks scheduled without one.
    pub default_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            yield_interval_ms: 5,
            max_yield_interval_ms: 300,
            default_timeout_ms: MAX_TASK_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.yield_interval_ms > config.max_yield_interval_ms {
            return Err(ReactiveError::Config(format!(
                "yield_interval_ms ({}) exceeds max_yield_interval_ms ({})",
                config.yield_interval_ms, config.max_yield_interval_ms
            )));
        }
        Ok(config)
    }

    pub fn yield_interval(&self) -> Duration {
        Duration::from_millis(self.yield_interval_ms)
    }

    pub fn max_yield_interval(&self) -> Duration {
        Duration::from_millis(self.max_yield_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
