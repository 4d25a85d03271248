//! Motion tuning and state store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MotionError, Result};

/// Tuning for a single move request.
///
/// Speeds and the deviation threshold are consumed by planner/executor
/// factories; the polling frequencies drive the runner's replan watchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Target linear speed in meters per second.
    pub linear_m_per_sec: f64,
    /// Target angular speed in degrees per second.
    pub angular_degs_per_sec: f64,
    /// How far the component may wander off the plan, in meters.
    pub plan_deviation_m: f64,
    /// Position drift probe cadence. Zero disables the watcher.
    pub position_polling_freq_hz: f64,
    /// Obstacle probe cadence. Zero disables the watcher.
    pub obstacle_polling_freq_hz: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            linear_m_per_sec: 0.3,
            angular_degs_per_sec: 60.0,
            plan_deviation_m: 2.6,
            position_polling_freq_hz: 1.0,
            obstacle_polling_freq_hz: 1.0,
        }
    }
}

impl MotionConfig {
    /// Rejects negative or non-finite values. Zero polling frequencies are
    /// valid and disable the corresponding watcher.
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("linear_m_per_sec", self.linear_m_per_sec),
            ("angular_degs_per_sec", self.angular_degs_per_sec),
            ("plan_deviation_m", self.plan_deviation_m),
            ("position_polling_freq_hz", self.position_polling_freq_hz),
            ("obstacle_polling_freq_hz", self.obstacle_polling_freq_hz),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(MotionError::InvalidConfig(format!(
                    "{label} must be a non-negative finite number, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn polling(&self) -> Result<PollingConfig> {
        PollingConfig::new(self.position_polling_freq_hz, self.obstacle_polling_freq_hz)
    }
}

/// Validated watcher cadences handed to the execution runner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingConfig {
    position_freq_hz: f64,
    obstacle_freq_hz: f64,
}

impl PollingConfig {
    /// Zero disables a watcher; negative or non-finite frequencies are
    /// rejected.
    pub fn new(position_freq_hz: f64, obstacle_freq_hz: f64) -> Result<Self> {
        for (label, value) in [
            ("position_freq_hz", position_freq_hz),
            ("obstacle_freq_hz", obstacle_freq_hz),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(MotionError::InvalidConfig(format!(
                    "{label} must be a non-negative finite number, got {value}"
                )));
            }
        }
        Ok(Self {
            position_freq_hz,
            obstacle_freq_hz,
        })
    }

    /// Both watchers disabled.
    pub const fn disabled() -> Self {
        Self {
            position_freq_hz: 0.0,
            obstacle_freq_hz: 0.0,
        }
    }

    pub(crate) fn position_period(&self) -> Option<Duration> {
        Self::period(self.position_freq_hz)
    }

    pub(crate) fn obstacle_period(&self) -> Option<Duration> {
        Self::period(self.obstacle_freq_hz)
    }

    fn period(freq_hz: f64) -> Option<Duration> {
        (freq_hz > 0.0).then(|| Duration::from_secs_f64(1.0 / freq_hz))
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Construction options for [`crate::state::ExecutionState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// How long an execution is kept in history after its newest plan
    /// reached a terminal state.
    pub ttl: Duration,
    /// How often the sweeper looks for expired executions.
    pub ttl_check_interval: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            ttl_check_interval: Duration::from_secs(60),
        }
    }
}

impl StateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(MotionError::InvalidConfig("ttl must be nonzero".into()));
        }
        if self.ttl_check_interval.is_zero() {
            return Err(MotionError::InvalidConfig(
                "ttl_check_interval must be nonzero".into(),
            ));
        }
        Ok(())
    }
}
