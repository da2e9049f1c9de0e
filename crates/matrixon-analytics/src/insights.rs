//! # Insight and Alert Composers
//!
//! Pure functions turning statistics, trends, predictions and anomaly records
//! into short human-readable summaries. They never touch engine state; the
//! [`AnalyticsEngine`](crate::AnalyticsEngine) gathers [`ChannelSnapshot`]s and
//! hands them over.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use matrixon_common::ChannelId;
use serde::{Deserialize, Serialize};

use crate::anomaly::{AnomalyRecord, Severity};
use crate::prediction::Prediction;
use crate::stats::RollingStatistics;

/// Trend magnitude that earns a trend insight
pub const TREND_INSIGHT_THRESHOLD: f64 = 0.5;
/// Prediction confidence that earns a prediction insight
pub const PREDICTION_INSIGHT_CONFIDENCE: f64 = 50.0;

/// Viewer-side description of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub channel: ChannelId,
    pub label: String,
    /// Full-scale value, used by the energy composer
    #[serde(default)]
    pub max: Option<f64>,
}

impl ChannelProfile {
    pub fn new(channel: ChannelId, label: impl Into<String>) -> Self {
        Self {
            channel,
            label: label.into(),
            max: None,
        }
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }
}

/// Everything the insight composer needs about one channel
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub profile: ChannelProfile,
    pub current: f64,
    /// Statistics over the last hour
    pub stats: RollingStatistics,
    pub trend: f64,
    pub prediction: Option<Prediction>,
    pub latest_anomaly: Option<AnomalyRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightKind {
    Status,
    Trend,
    Prediction,
    Anomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub kind: InsightKind,
    pub channel: ChannelId,
    pub label: String,
    pub text: String,
    pub priority: Priority,
}

/// Compose insights for every snapshot, highest priority first
///
/// The sort is stable, so insights of equal priority keep snapshot order.
pub fn compose_insights(snapshots: &[ChannelSnapshot], now: DateTime<Utc>) -> Vec<Insight> {
    let mut insights = Vec::new();

    for snapshot in snapshots {
        let profile = &snapshot.profile;
        let insight = |kind, text, priority| Insight {
            kind,
            channel: profile.channel,
            label: profile.label.clone(),
            text,
            priority,
        };

        if snapshot.stats.count > 0 {
            insights.push(insight(
                InsightKind::Status,
                status_text(&profile.label, snapshot.current, &snapshot.stats),
                Priority::Normal,
            ));
        }

        if snapshot.trend.abs() > TREND_INSIGHT_THRESHOLD {
            let direction = if snapshot.trend > 0.0 { "increasing" } else { "decreasing" };
            insights.push(insight(
                InsightKind::Trend,
                format!(
                    "{} is {} ({:.2} per reading). Current: {:.1}",
                    profile.label,
                    direction,
                    snapshot.trend.abs(),
                    snapshot.current
                ),
                Priority::Normal,
            ));
        }

        if let Some(prediction) = snapshot
            .prediction
            .as_ref()
            .filter(|p| p.confidence > PREDICTION_INSIGHT_CONFIDENCE)
        {
            insights.push(insight(
                InsightKind::Prediction,
                format!(
                    "{} predicted to be {:.1} in the next {} ({:.0}% confidence)",
                    profile.label,
                    prediction.predicted_value,
                    format_horizon(prediction.horizon_ms),
                    prediction.confidence
                ),
                Priority::Low,
            ));
        }

        if let Some(anomaly) = &snapshot.latest_anomaly {
            let priority = if anomaly.severity == Severity::Critical {
                Priority::High
            } else {
                Priority::Normal
            };
            insights.push(insight(
                InsightKind::Anomaly,
                format!(
                    "Unusual {} detected {}: {:.1} (expected: {:.1})",
                    profile.label,
                    format_elapsed(now - anomaly.timestamp),
                    anomaly.value,
                    anomaly.stats.mean
                ),
                priority,
            ));
        }
    }

    insights.sort_by_key(|insight| Reverse(insight.priority));
    insights
}

/// Stable strictly inside half a standard deviation; a flat channel never reads stable
fn status_text(label: &str, current: f64, stats: &RollingStatistics) -> String {
    let position = if (current - stats.mean).abs() < stats.std_dev * 0.5 {
        "stable"
    } else if current > stats.mean {
        "above average"
    } else {
        "below average"
    };
    format!("{label} is {position} at {current:.1} (avg: {:.1})", stats.mean)
}

/// `"Xh ago"`, `"Xm ago"` or `"Xs ago"`; future timestamps read as `"0s ago"`
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let seconds = elapsed.num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;

    if hours > 0 {
        format!("{hours}h ago")
    } else if minutes > 0 {
        format!("{minutes}m ago")
    } else {
        format!("{seconds}s ago")
    }
}

fn format_horizon(horizon_ms: u64) -> String {
    let seconds = horizon_ms / 1000;
    if seconds >= 3600 && seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else if seconds >= 60 && seconds % 60 == 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{seconds}s")
    }
}

/// Viewer-facing rendering of an anomaly record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub channel: ChannelId,
    pub label: String,
    pub severity: Severity,
    pub value: f64,
    pub expected: f64,
    pub z_score: f64,
    pub timestamp: DateTime<Utc>,
    pub age: String,
    pub message: String,
}

/// Render `records` (already most recent first) as alerts
///
/// A channel without a profile is labelled with its channel id.
pub fn compose_alerts(
    records: &[AnomalyRecord],
    profiles: &[ChannelProfile],
    severity: Option<Severity>,
    now: DateTime<Utc>,
) -> Vec<Alert> {
    records
        .iter()
        .filter(|record| severity.map_or(true, |wanted| record.severity == wanted))
        .map(|record| {
            let label = profiles
                .iter()
                .find(|profile| profile.channel == record.channel)
                .map(|profile| profile.label.clone())
                .unwrap_or_else(|| record.channel.to_string());
            Alert {
                channel: record.channel,
                label,
                severity: record.severity,
                value: record.value,
                expected: record.stats.mean,
                z_score: record.z_score,
                timestamp: record.timestamp,
                age: format_elapsed(now - record.timestamp),
                message: format!(
                    "Unusual reading: {:.1} (expected: {:.1})",
                    record.value, record.stats.mean
                ),
            }
        })
        .collect()
}
