//! # Anomaly Detector
//!
//! z-score classifier over [`RollingStatistics`] with a bounded anomaly log.
//!
//! A verdict is only produced once at least [`MIN_SAMPLES`] readings exist and
//! the spread is non-zero. Severity breakpoints are exclusive:
//!
//! | z-score     | severity |
//! |-------------|----------|
//! | `> 3.5`     | critical |
//! | `> 3.0`     | high     |
//! | `> 2.5`     | medium   |
//! | otherwise   | low      |

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use matrixon_common::ChannelId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stats::RollingStatistics;

/// Default z-score threshold
pub const DEFAULT_SENSITIVITY: f64 = 2.0;
/// Lowest accepted sensitivity
pub const MIN_SENSITIVITY: f64 = 1.0;
/// Highest accepted sensitivity
pub const MAX_SENSITIVITY: f64 = 3.5;
/// Readings required before any verdict
pub const MIN_SAMPLES: usize = 10;
/// Default bounded log size
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// How far a reading strayed from the rolling mean
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_z_score(z: f64) -> Self {
        if z > 3.5 {
            Severity::Critical
        } else if z > 3.0 {
            Severity::High
        } else if z > 2.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = matrixon_common::MatrixonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(matrixon_common::MatrixonError::Validation(format!(
                "unknown severity: {other}"
            ))),
        }
    }
}

/// A reading flagged as anomalous, immutable once logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRecord {
    pub channel: ChannelId,
    pub value: f64,
    pub z_score: f64,
    pub timestamp: DateTime<Utc>,
    pub stats: RollingStatistics,
    pub severity: Severity,
}

/// Outcome of assessing one reading
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Fewer than [`MIN_SAMPLES`] readings
    InsufficientData,
    /// Zero spread, z-score undefined
    Suppressed,
    Normal { z_score: f64 },
    Anomalous(AnomalyRecord),
}

impl Verdict {
    pub fn into_record(self) -> Option<AnomalyRecord> {
        match self {
            Verdict::Anomalous(record) => Some(record),
            _ => None,
        }
    }
}

/// Sensitivity plus bounded anomaly log for one owner context
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    sensitivity: f64,
    log: VecDeque<AnomalyRecord>,
    capacity: usize,
}

impl AnomalyDetector {
    pub fn new(sensitivity: f64, capacity: usize) -> Self {
        let mut detector = Self {
            sensitivity: DEFAULT_SENSITIVITY,
            log: VecDeque::new(),
            capacity: capacity.max(1),
        };
        detector.set_sensitivity(sensitivity);
        detector
    }

    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    /// Clamp into `[1.0, 3.5]`; NaN leaves the current value untouched
    pub fn set_sensitivity(&mut self, sensitivity: f64) -> f64 {
        if !sensitivity.is_nan() {
            self.sensitivity = sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY);
        }
        self.sensitivity
    }

    /// Classify `value` against `stats` without touching the log
    pub fn assess(
        &self,
        channel: ChannelId,
        value: f64,
        stats: &RollingStatistics,
        timestamp: DateTime<Utc>,
    ) -> Verdict {
        if stats.count < MIN_SAMPLES {
            return Verdict::InsufficientData;
        }
        let Some(z_score) = stats.z_score(value) else {
            return Verdict::Suppressed;
        };
        if z_score <= self.sensitivity {
            return Verdict::Normal { z_score };
        }

        Verdict::Anomalous(AnomalyRecord {
            channel,
            value,
            z_score,
            timestamp,
            stats: *stats,
            severity: Severity::from_z_score(z_score),
        })
    }

    /// Classify and, when anomalous, append to the log
    pub fn evaluate(
        &mut self,
        channel: ChannelId,
        value: f64,
        stats: &RollingStatistics,
        timestamp: DateTime<Utc>,
    ) -> Option<AnomalyRecord> {
        let record = self.assess(channel, value, stats, timestamp).into_record()?;

        debug!(
            "🚨 Anomaly on {}: value={} z={:.2} severity={}",
            channel, value, record.z_score, record.severity
        );

        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(record.clone());
        Some(record)
    }

    /// Up to `n` records, most recent first
    pub fn recent(&self, n: usize) -> Vec<AnomalyRecord> {
        self.log.iter().rev().take(n).cloned().collect()
    }

    /// Records for one channel, most recent first
    pub fn for_channel(&self, channel: ChannelId) -> Vec<AnomalyRecord> {
        self.log
            .iter()
            .rev()
            .filter(|record| record.channel == channel)
            .cloned()
            .collect()
    }

    pub fn latest_for_channel(&self, channel: ChannelId) -> Option<&AnomalyRecord> {
        self.log.iter().rev().find(|record| record.channel == channel)
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVITY, DEFAULT_LOG_CAPACITY)
    }
}
