//! # Prediction Engine
//!
//! Two independent short-horizon forecasters over a channel history plus an
//! arbiter that picks the more confident one.
//!
//! - Moving average: needs 5 of the last 20 points, confidence from the
//!   coefficient of variation.
//! - Linear regression: needs 10 of the last 30 points, ordinary least squares
//!   on `(index, value)`, confidence `100 * R^2`.

use std::fmt;

use matrixon_common::ChannelId;
use serde::{Deserialize, Serialize};

use crate::history::ChannelHistory;
use crate::stats::{self, RollingStatistics};

pub const MOVING_AVERAGE_WINDOW: usize = 20;
pub const MOVING_AVERAGE_MIN_SAMPLES: usize = 5;
pub const REGRESSION_WINDOW: usize = 30;
pub const REGRESSION_MIN_SAMPLES: usize = 10;

/// Default forecast horizon: six steps of ten seconds
pub const DEFAULT_HORIZON_MS: u64 = 6 * 10_000;

const SLOPE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredictionMethod {
    MovingAverage,
    LinearRegression,
}

impl fmt::Display for PredictionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredictionMethod::MovingAverage => f.write_str("moving-average"),
            PredictionMethod::LinearRegression => f.write_str("linear-regression"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    pub fn from_slope(slope: f64) -> Self {
        if slope.abs() < SLOPE_EPSILON {
            Trend::Stable
        } else if slope > 0.0 {
            Trend::Increasing
        } else {
            Trend::Decreasing
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Increasing => f.write_str("increasing"),
            Trend::Decreasing => f.write_str("decreasing"),
            Trend::Stable => f.write_str("stable"),
        }
    }
}

/// Forecast for one channel, derived on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub channel: ChannelId,
    pub predicted_value: f64,
    /// 0-100
    pub confidence: f64,
    pub method: PredictionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<Trend>,
    /// Regression slope per step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend_value: Option<f64>,
    pub horizon_ms: u64,
    pub sample_count: usize,
}

/// Slope, intercept and goodness of fit of an OLS line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearFit {
    /// Fit `value = slope * index + intercept`; `None` below two points
    pub fn fit(values: &[f64]) -> Option<Self> {
        let n = values.len();
        if n < 2 {
            return None;
        }

        let nf = n as f64;
        let sum_x: f64 = (0..n).map(|i| i as f64).sum();
        let sum_y: f64 = values.iter().sum();
        let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
        let sum_xx: f64 = (0..n).map(|i| (i as f64).powi(2)).sum();

        let denominator = nf * sum_xx - sum_x * sum_x;
        if denominator == 0.0 {
            return None;
        }
        let slope = (nf * sum_xy - sum_x * sum_y) / denominator;
        let intercept = (sum_y - slope * sum_x) / nf;

        let mean_y = sum_y / nf;
        let ss_tot: f64 = values.iter().map(|y| (y - mean_y).powi(2)).sum();
        let ss_res: f64 = values
            .iter()
            .enumerate()
            .map(|(i, y)| (y - (slope * i as f64 + intercept)).powi(2))
            .sum();
        let r_squared = if ss_tot == 0.0 { 1.0 } else { 1.0 - ss_res / ss_tot };

        Some(Self {
            slope,
            intercept,
            r_squared,
        })
    }

    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Forecasters sharing one horizon setting
#[derive(Debug, Clone, Copy)]
pub struct PredictionEngine {
    horizon_ms: u64,
}

impl PredictionEngine {
    pub fn new(horizon_ms: u64) -> Self {
        Self { horizon_ms }
    }

    pub fn horizon_ms(&self) -> u64 {
        self.horizon_ms
    }

    pub fn moving_average(&self, channel: ChannelId, history: &ChannelHistory) -> Option<Prediction> {
        let values = history.recent_values(MOVING_AVERAGE_WINDOW);
        if values.len() < MOVING_AVERAGE_MIN_SAMPLES {
            return None;
        }

        let summary = RollingStatistics::from_values(&values);
        Some(Prediction {
            channel,
            predicted_value: summary.mean,
            confidence: stats::stability_score(summary.mean, summary.std_dev),
            method: PredictionMethod::MovingAverage,
            trend: None,
            trend_value: None,
            horizon_ms: self.horizon_ms,
            sample_count: values.len(),
        })
    }

    pub fn linear_regression(&self, channel: ChannelId, history: &ChannelHistory) -> Option<Prediction> {
        let values = history.recent_values(REGRESSION_WINDOW);
        if values.len() < REGRESSION_MIN_SAMPLES {
            return None;
        }

        let fit = LinearFit::fit(&values)?;
        let confidence = (fit.r_squared * 100.0).clamp(0.0, 100.0);
        Some(Prediction {
            channel,
            predicted_value: fit.at(values.len() as f64),
            confidence: if confidence.is_nan() { 0.0 } else { confidence },
            method: PredictionMethod::LinearRegression,
            trend: Some(Trend::from_slope(fit.slope)),
            trend_value: Some(fit.slope),
            horizon_ms: self.horizon_ms,
            sample_count: values.len(),
        })
    }

    /// Most confident forecast; ties go to linear regression
    pub fn best(&self, channel: ChannelId, history: &ChannelHistory) -> Option<Prediction> {
        match (
            self.moving_average(channel, history),
            self.linear_regression(channel, history),
        ) {
            (None, None) => None,
            (Some(ma), None) => Some(ma),
            (None, Some(lr)) => Some(lr),
            (Some(ma), Some(lr)) => {
                if ma.confidence > lr.confidence {
                    Some(ma)
                } else {
                    Some(lr)
                }
            }
        }
    }
}

impl Default for PredictionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON_MS)
    }
}
