// ABOUTME: Resource pressure sampling that scales admission ceilings under memory load
// ABOUTME: A periodic monitor classifies memory usage into normal, high, and critical levels
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::rate_limits;

/// Current degradation level applied to new request windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    /// Full ceiling
    #[default]
    Normal,
    /// Memory above the high threshold
    High,
    /// Memory above the critical threshold
    Critical,
}

impl DegradationLevel {
    /// Multiplier applied to the base request ceiling
    #[must_use]
    pub const fn factor(self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::High => rate_limits::HIGH_PRESSURE_FACTOR,
            Self::Critical => rate_limits::CRITICAL_PRESSURE_FACTOR,
        }
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::High => 1,
            Self::Critical => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::High,
            2 => Self::Critical,
            _ => Self::Normal,
        }
    }
}

/// Memory usage percentages that trigger degradation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    /// Usage above this is high pressure
    pub high_percent: f64,
    /// Usage above this is critical pressure
    pub critical_percent: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            high_percent: rate_limits::DEFAULT_HIGH_PRESSURE_PERCENT,
            critical_percent: rate_limits::DEFAULT_CRITICAL_PRESSURE_PERCENT,
        }
    }
}

impl PressureThresholds {
    /// Level for a used-memory percentage
    #[must_use]
    pub fn classify(&self, used_percent: f64) -> DegradationLevel {
        if used_percent > self.critical_percent {
            DegradationLevel::Critical
        } else if used_percent > self.high_percent {
            DegradationLevel::High
        } else {
            DegradationLevel::Normal
        }
    }
}

/// Source of memory occupancy samples
pub trait MemorySampler: Send + Sync {
    /// Percentage of memory in use, or `None` when it cannot be determined
    fn used_percent(&self) -> Option<f64>;
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMeminfoSampler;

impl ProcMeminfoSampler {
    fn parse(meminfo: &str) -> Option<f64> {
        let field = |name: &str| {
            meminfo
                .lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        };
        let total_kb = field("MemTotal:")?;
        let available_kb = field("MemAvailable:")?;
        if total_kb == 0 {
            return None;
        }
        let used_kb = total_kb.saturating_sub(available_kb);
        Some(used_kb as f64 / total_kb as f64 * 100.0)
    }
}

impl MemorySampler for ProcMeminfoSampler {
    #[cfg(target_os = "linux")]
    fn used_percent(&self) -> Option<f64> {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(meminfo) => Self::parse(&meminfo),
            Err(e) => {
                debug!(error = %e, "Cannot read /proc/meminfo");
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn used_percent(&self) -> Option<f64> {
        None
    }
}

/// Shared, lock-free holder of the current degradation level
#[derive(Debug, Default)]
pub struct PressureGauge {
    level: AtomicU8,
}

impl PressureGauge {
    /// Gauge starting at `Normal`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level
    #[must_use]
    pub fn level(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Replace the level, returning the previous one
    pub fn set(&self, level: DegradationLevel) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.swap(level.to_u8(), Ordering::Relaxed))
    }
}

/// Periodically samples memory and updates a [`PressureGauge`]
pub struct PressureMonitor {
    gauge: Arc<PressureGauge>,
    sampler: Arc<dyn MemorySampler>,
    thresholds: PressureThresholds,
    interval: Duration,
}

impl PressureMonitor {
    /// Monitor writing into `gauge`
    #[must_use]
    pub fn new(
        gauge: Arc<PressureGauge>,
        sampler: Arc<dyn MemorySampler>,
        thresholds: PressureThresholds,
        interval: Duration,
    ) -> Self {
        Self {
            gauge,
            sampler,
            thresholds,
            interval,
        }
    }

    /// Take one sample and publish the resulting level
    pub fn sample_once(&self) -> DegradationLevel {
        let level = self
            .sampler
            .used_percent()
            .map_or(DegradationLevel::Normal, |percent| {
                self.thresholds.classify(percent)
            });

        let previous = self.gauge.set(level);
        if previous != level {
            match level {
                DegradationLevel::Normal => {
                    info!(from = previous.as_str(), "Resource pressure cleared");
                }
                _ => warn!(
                    from = previous.as_str(),
                    to = level.as_str(),
                    factor = level.factor(),
                    "Resource pressure changed, scaling next request windows"
                ),
            }
        }
        level
    }

    /// Run the sampling loop until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sample_once();
                    }
                }
            }
            debug!("Pressure monitor stopped");
        })
    }
}
