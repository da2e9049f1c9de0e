//! # Matrixon Analytics - Streaming Telemetry Analytics
//!
//! **Project:** Matrixon - Telemetry Ingestion & Analytics
//! **Module:** matrixon-analytics - rolling statistics, anomaly detection, forecasting
//! **Author:** arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
//! **License:** Apache 2.0 / MIT
//!
//! ## Description
//!
//! Incremental analytics over bounded in-memory channel history. Nothing here
//! queries durable storage: every number is derived from the most recent
//! readings held per `(owner context, channel)`.
//!
//! ## Components
//!
//! - [`history`] - fixed-capacity FIFO per channel
//! - [`stats`] - count/mean/min/max/population standard deviation, half-split trend
//! - [`anomaly`] - z-score detector with a bounded anomaly log
//! - [`prediction`] - moving average and least-squares forecasters
//! - [`insights`], [`energy`] - human-readable summaries, alerts and cost estimates
//! - [`engine`] - the sharded [`AnalyticsEngine`] tying them together
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use matrixon_analytics::{AnalyticsConfig, AnalyticsEngine};
//! use matrixon_common::{ChannelId, OwnerContext, OwnerId};
//!
//! # async fn demo() {
//! let engine = AnalyticsEngine::new(AnalyticsConfig::default());
//! let owner = OwnerContext::Owner(OwnerId(7));
//!
//! if let Some(anomaly) = engine.ingest(owner, ChannelId::new(0), 24.5, Utc::now()).await {
//!     println!("{} anomaly: {}", anomaly.severity, anomaly.value);
//! }
//! let prediction = engine.predict(owner, ChannelId::new(0)).await;
//! # }
//! ```

pub mod anomaly;
pub mod energy;
pub mod engine;
pub mod history;
pub mod insights;
pub mod prediction;
pub mod stats;

pub use anomaly::{AnomalyDetector, AnomalyRecord, Severity, Verdict};
pub use energy::{EnergyOptimizer, EnergyReport, PowerRates, Recommendation};
pub use engine::{AnalyticsConfig, AnalyticsEngine};
pub use history::{ChannelHistory, DataPoint};
pub use insights::{Alert, ChannelProfile, Insight, InsightKind, Priority};
pub use prediction::{Prediction, PredictionEngine, PredictionMethod, Trend};
pub use stats::{RollingStatistics, StatisticsEngine};
