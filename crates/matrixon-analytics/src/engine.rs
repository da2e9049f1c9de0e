//! # Analytics Engine
//!
//! Owner-scoped, per-channel sharded analytics state.
//!
//! Every `(OwnerContext, ChannelId)` pair owns one [`ChannelHistory`] behind
//! its own mutex, and every owner context owns one [`AnomalyDetector`]. Work on
//! different channels never contends. When both locks are needed they are
//! taken channel first, detector second.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use dashmap::DashMap;
use matrixon_common::{ChannelId, OwnerContext};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::anomaly::{AnomalyDetector, AnomalyRecord, Severity, DEFAULT_LOG_CAPACITY, DEFAULT_SENSITIVITY};
use crate::energy::{EnergyInput, EnergyOptimizer, EnergyReport, PowerRates};
use crate::history::{ChannelHistory, DataPoint, DEFAULT_HISTORY_CAPACITY};
use crate::insights::{self, Alert, ChannelProfile, ChannelSnapshot, Insight};
use crate::prediction::{Prediction, PredictionEngine};
use crate::stats::{RollingStatistics, StatisticsEngine, DEFAULT_TREND_WINDOW};

/// Window used for status insights
pub const INSIGHT_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Window used for energy estimates
pub const ENERGY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Analytics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Points retained per channel
    pub history_capacity: usize,
    /// Anomaly records retained per owner context
    pub anomaly_log_capacity: usize,
    /// Initial z-score threshold for new owner contexts
    pub sensitivity: f64,
    /// Forecast horizon in steps
    pub horizon_steps: u32,
    /// Duration of one forecast step
    pub step_ms: u64,
    pub power_rates: PowerRates,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            anomaly_log_capacity: DEFAULT_LOG_CAPACITY,
            sensitivity: DEFAULT_SENSITIVITY,
            horizon_steps: 6,
            step_ms: 10_000,
            power_rates: PowerRates::default(),
        }
    }
}

impl AnalyticsConfig {
    pub fn horizon_ms(&self) -> u64 {
        u64::from(self.horizon_steps).saturating_mul(self.step_ms)
    }
}

type ChannelKey = (OwnerContext, ChannelId);

/// Streaming analytics over every owner context and channel
#[derive(Debug)]
pub struct AnalyticsEngine {
    config: AnalyticsConfig,
    channels: DashMap<ChannelKey, Arc<Mutex<ChannelHistory>>>,
    detectors: DashMap<OwnerContext, Arc<Mutex<AnomalyDetector>>>,
    statistics: StatisticsEngine,
    predictor: PredictionEngine,
    energy: EnergyOptimizer,
}

impl AnalyticsEngine {
    pub fn new(config: AnalyticsConfig) -> Self {
        info!(
            "🔧 Initializing analytics engine (history={}, anomaly log={}, sensitivity={})",
            config.history_capacity, config.anomaly_log_capacity, config.sensitivity
        );
        Self {
            predictor: PredictionEngine::new(config.horizon_ms()),
            energy: EnergyOptimizer::new(config.power_rates),
            statistics: StatisticsEngine::new(),
            channels: DashMap::new(),
            detectors: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    // The Arc is cloned out so no DashMap shard guard lives across an await.
    fn history(&self, context: OwnerContext, channel: ChannelId) -> Option<Arc<Mutex<ChannelHistory>>> {
        self.channels.get(&(context, channel)).map(|entry| Arc::clone(entry.value()))
    }

    fn history_or_insert(&self, context: OwnerContext, channel: ChannelId) -> Arc<Mutex<ChannelHistory>> {
        let capacity = self.config.history_capacity;
        Arc::clone(
            self.channels
                .entry((context, channel))
                .or_insert_with(|| Arc::new(Mutex::new(ChannelHistory::new(capacity))))
                .value(),
        )
    }

    fn detector(&self, context: OwnerContext) -> Arc<Mutex<AnomalyDetector>> {
        let (sensitivity, capacity) = (self.config.sensitivity, self.config.anomaly_log_capacity);
        Arc::clone(
            self.detectors
                .entry(context)
                .or_insert_with(|| Arc::new(Mutex::new(AnomalyDetector::new(sensitivity, capacity))))
                .value(),
        )
    }

    // Read paths must not create detectors for owners that never ingested.
    fn detector_if_present(&self, context: OwnerContext) -> Option<Arc<Mutex<AnomalyDetector>>> {
        self.detectors.get(&context).map(|entry| Arc::clone(entry.value()))
    }

    /// Evaluate `value` against the prior history of the channel, then append it
    #[instrument(level = "debug", skip(self))]
    pub async fn ingest(
        &self,
        context: OwnerContext,
        channel: ChannelId,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<AnomalyRecord> {
        let history = self.history_or_insert(context, channel);
        let mut history = history.lock().await;

        let prior = RollingStatistics::from_values(&history.values(None, timestamp));
        let record = {
            let detector = self.detector(context);
            let mut detector = detector.lock().await;
            detector.evaluate(channel, value, &prior, timestamp)
        };
        history.push(value, timestamp);

        if let Some(record) = &record {
            counter!("matrixon_anomalies_total", 1, "severity" => record.severity.as_str());
        }
        record
    }

    /// Append without anomaly evaluation
    pub async fn push(&self, context: OwnerContext, channel: ChannelId, value: f64, timestamp: DateTime<Utc>) {
        let history = self.history_or_insert(context, channel);
        history.lock().await.push(value, timestamp);
    }

    pub async fn recent(&self, context: OwnerContext, channel: ChannelId, count: usize) -> Vec<DataPoint> {
        match self.history(context, channel) {
            Some(history) => history.lock().await.recent(count),
            None => Vec::new(),
        }
    }

    pub async fn windowed(&self, context: OwnerContext, channel: ChannelId, window: Duration) -> Vec<DataPoint> {
        self.windowed_at(context, channel, window, Utc::now()).await
    }

    pub async fn windowed_at(
        &self,
        context: OwnerContext,
        channel: ChannelId,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Vec<DataPoint> {
        match self.history(context, channel) {
            Some(history) => history.lock().await.windowed(window, now),
            None => Vec::new(),
        }
    }

    pub async fn range(
        &self,
        context: OwnerContext,
        channel: ChannelId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DataPoint> {
        match self.history(context, channel) {
            Some(history) => history.lock().await.range(start, end),
            None => Vec::new(),
        }
    }

    /// Reset one channel, or every channel of the context
    pub async fn clear(&self, context: OwnerContext, channel: Option<ChannelId>) {
        let targets: Vec<Arc<Mutex<ChannelHistory>>> = match channel {
            Some(channel) => self.history(context, channel).into_iter().collect(),
            None => self
                .channels
                .iter()
                .filter(|entry| entry.key().0 == context)
                .map(|entry| Arc::clone(entry.value()))
                .collect(),
        };
        for history in targets {
            history.lock().await.clear();
        }
        debug!("🧹 Cleared history for {} ({:?})", context, channel);
    }

    /// Channels of the context holding at least one point, in numeric order
    pub async fn channels(&self, context: OwnerContext) -> Vec<ChannelId> {
        let candidates: Vec<(ChannelId, Arc<Mutex<ChannelHistory>>)> = self
            .channels
            .iter()
            .filter(|entry| entry.key().0 == context)
            .map(|entry| (entry.key().1, Arc::clone(entry.value())))
            .collect();

        let mut channels = Vec::with_capacity(candidates.len());
        for (channel, history) in candidates {
            if !history.lock().await.is_empty() {
                channels.push(channel);
            }
        }
        channels.sort();
        channels
    }

    pub async fn stats(&self, context: OwnerContext, channel: ChannelId, window: Option<Duration>) -> RollingStatistics {
        self.stats_at(context, channel, window, Utc::now()).await
    }

    pub async fn stats_at(
        &self,
        context: OwnerContext,
        channel: ChannelId,
        window: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RollingStatistics {
        match self.history(context, channel) {
            Some(history) => self.statistics.stats(&*history.lock().await, window, now),
            None => RollingStatistics::default(),
        }
    }

    pub async fn trend(&self, context: OwnerContext, channel: ChannelId, window_size: usize) -> f64 {
        match self.history(context, channel) {
            Some(history) => self.statistics.trend(&*history.lock().await, window_size),
            None => 0.0,
        }
    }

    /// Evaluate `value` against the current history without appending it
    pub async fn evaluate(&self, context: OwnerContext, channel: ChannelId, value: f64) -> Option<AnomalyRecord> {
        let now = Utc::now();
        let stats = self.stats_at(context, channel, None, now).await;
        let detector = self.detector(context);
        let record = detector.lock().await.evaluate(channel, value, &stats, now);
        if let Some(record) = &record {
            counter!("matrixon_anomalies_total", 1, "severity" => record.severity.as_str());
        }
        record
    }

    pub async fn recent_anomalies(&self, context: OwnerContext, limit: usize) -> Vec<AnomalyRecord> {
        match self.detector_if_present(context) {
            Some(detector) => detector.lock().await.recent(limit),
            None => Vec::new(),
        }
    }

    pub async fn anomalies_for_channel(&self, context: OwnerContext, channel: ChannelId) -> Vec<AnomalyRecord> {
        match self.detector_if_present(context) {
            Some(detector) => detector.lock().await.for_channel(channel),
            None => Vec::new(),
        }
    }

    pub async fn clear_anomalies(&self, context: OwnerContext) {
        if let Some(detector) = self.detector_if_present(context) {
            detector.lock().await.clear();
        }
        info!("🧹 Cleared anomaly log for {}", context);
    }

    pub async fn sensitivity(&self, context: OwnerContext) -> f64 {
        match self.detector_if_present(context) {
            Some(detector) => detector.lock().await.sensitivity(),
            None => self.config.sensitivity,
        }
    }

    /// Store the clamped sensitivity and return it
    pub async fn set_sensitivity(&self, context: OwnerContext, sensitivity: f64) -> f64 {
        let applied = self.detector(context).lock().await.set_sensitivity(sensitivity);
        info!("🎚️ Sensitivity for {} set to {}", context, applied);
        applied
    }

    pub async fn predict_moving_average(&self, context: OwnerContext, channel: ChannelId) -> Option<Prediction> {
        let history = self.history(context, channel)?;
        let history = history.lock().await;
        self.predictor.moving_average(channel, &history)
    }

    pub async fn predict_linear_regression(&self, context: OwnerContext, channel: ChannelId) -> Option<Prediction> {
        let history = self.history(context, channel)?;
        let history = history.lock().await;
        self.predictor.linear_regression(channel, &history)
    }

    /// Most confident forecast for the channel
    pub async fn predict(&self, context: OwnerContext, channel: ChannelId) -> Option<Prediction> {
        let history = self.history(context, channel)?;
        let history = history.lock().await;
        self.predictor.best(channel, &history)
    }

    /// Gather the insight inputs for one channel
    pub async fn snapshot(
        &self,
        context: OwnerContext,
        profile: ChannelProfile,
        current: f64,
        now: DateTime<Utc>,
    ) -> ChannelSnapshot {
        let channel = profile.channel;
        let (stats, trend, prediction) = match self.history(context, channel) {
            Some(history) => {
                let history = history.lock().await;
                (
                    self.statistics.stats(&history, Some(INSIGHT_WINDOW), now),
                    self.statistics.trend(&history, DEFAULT_TREND_WINDOW),
                    self.predictor.best(channel, &history),
                )
            }
            None => (RollingStatistics::default(), 0.0, None),
        };
        let latest_anomaly = match self.detector_if_present(context) {
            Some(detector) => detector.lock().await.latest_for_channel(channel).cloned(),
            None => None,
        };

        ChannelSnapshot {
            profile,
            current,
            stats,
            trend,
            prediction,
            latest_anomaly,
        }
    }

    /// Insights for the given `(profile, current value)` pairs, highest priority first
    #[instrument(level = "debug", skip(self, channels))]
    pub async fn insights(
        &self,
        context: OwnerContext,
        channels: Vec<(ChannelProfile, f64)>,
        now: DateTime<Utc>,
    ) -> Vec<Insight> {
        let mut snapshots = Vec::with_capacity(channels.len());
        for (profile, current) in channels {
            snapshots.push(self.snapshot(context, profile, current, now).await);
        }
        insights::compose_insights(&snapshots, now)
    }

    /// Recent anomalies rendered as alerts, most recent first
    pub async fn alerts(
        &self,
        context: OwnerContext,
        profiles: &[ChannelProfile],
        limit: usize,
        severity: Option<Severity>,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let records = self.recent_anomalies(context, limit).await;
        insights::compose_alerts(&records, profiles, severity, now)
    }

    /// Energy report over the last 24 hours; the tariff follows the local clock
    #[instrument(level = "debug", skip(self, channels))]
    pub async fn energy_report(
        &self,
        context: OwnerContext,
        channels: Vec<(ChannelProfile, f64)>,
        now: DateTime<Utc>,
    ) -> EnergyReport {
        let mut inputs = Vec::with_capacity(channels.len());
        for (profile, current) in channels {
            let stats = self.stats_at(context, profile.channel, Some(ENERGY_WINDOW), now).await;
            inputs.push(EnergyInput { profile, stats, current });
        }
        self.energy.report(&inputs, now.with_timezone(&Local).hour())
    }
}

impl Default for AnalyticsEngine {
    fn default() -> Self {
        Self::new(AnalyticsConfig::default())
    }
}
