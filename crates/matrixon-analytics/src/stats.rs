//! # Statistics Engine
//!
//! Rolling statistics over a channel history. This is the single source of
//! mean/standard deviation for the anomaly detector, the predictors and the
//! insight composers, so displayed numbers and detection thresholds agree.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::ChannelHistory;

/// Default number of points considered by [`StatisticsEngine::trend`]
pub const DEFAULT_TREND_WINDOW: usize = 10;

const ZERO_EPSILON: f64 = 1e-12;

/// Derived summary of a history slice
///
/// `count == 0` means "no data"; the zeroed fields are not a reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingStatistics {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

impl RollingStatistics {
    /// Population statistics (variance divides by `count`)
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let count = values.len();
        let mean = mean(values);
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        Self {
            count,
            mean,
            min,
            max,
            std_dev: variance.sqrt(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `|value - mean| / std_dev`; undefined without data or spread
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.count == 0 || self.std_dev == 0.0 {
            return None;
        }
        Some((value - self.mean).abs() / self.std_dev)
    }

    /// 0-100 score, higher when the spread is small relative to the level
    pub fn stability_score(&self) -> f64 {
        stability_score(self.mean, self.std_dev)
    }
}

/// Arithmetic mean, 0 for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// `100 - 100 * std_dev / |mean|` clamped to `[0, 100]`
///
/// A zero mean scores 100 only when there is no spread at all.
pub fn stability_score(mean: f64, std_dev: f64) -> f64 {
    if mean.abs() < ZERO_EPSILON {
        return if std_dev == 0.0 { 100.0 } else { 0.0 };
    }
    let cv = std_dev / mean.abs();
    (100.0 - cv * 100.0).clamp(0.0, 100.0)
}

/// Mean of the second half minus mean of the first half; 0 below two points
pub fn half_split_trend(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let (first, second) = values.split_at(values.len() / 2);
    mean(second) - mean(first)
}

/// Statistics over [`ChannelHistory`] slices
#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticsEngine;

impl StatisticsEngine {
    pub fn new() -> Self {
        StatisticsEngine
    }

    /// Statistics for the whole history or for points newer than `now - window`
    pub fn stats(
        &self,
        history: &ChannelHistory,
        window: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RollingStatistics {
        RollingStatistics::from_values(&history.values(window, now))
    }

    /// Short-term trend over the most recent `window_size` points
    pub fn trend(&self, history: &ChannelHistory, window_size: usize) -> f64 {
        half_split_trend(&history.recent_values(window_size))
    }
}
