//! # Energy Composer
//!
//! Rough efficiency and cost estimates derived from 24 h channel statistics.
//! The model is deliberately simple: each channel is assumed to draw
//! `0.1 kWh/day` at full scale, scaled by its mean over its full-scale value.

use serde::{Deserialize, Serialize};

use crate::insights::ChannelProfile;
use crate::stats::{self, RollingStatistics};

/// Channels need more samples than this to count towards efficiency
pub const EFFICIENCY_MIN_SAMPLES: usize = 10;
/// Full-scale value assumed when a profile has none
pub const DEFAULT_FULL_SCALE: f64 = 100.0;
/// Daily consumption of one channel running at full scale
pub const KWH_PER_CHANNEL_DAY: f64 = 0.1;
/// Peak tariff applies from `PEAK_START_HOUR` up to, not including, `PEAK_END_HOUR`
pub const PEAK_START_HOUR: u32 = 9;
pub const PEAK_END_HOUR: u32 = 21;

/// Price per kWh
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerRates {
    pub peak: f64,
    pub off_peak: f64,
}

impl Default for PowerRates {
    fn default() -> Self {
        Self {
            peak: 0.15,
            off_peak: 0.08,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RatePeriod {
    Peak,
    OffPeak,
}

pub fn is_peak_hour(hour: u32) -> bool {
    (PEAK_START_HOUR..PEAK_END_HOUR).contains(&hour)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub daily: f64,
    pub monthly: f64,
    pub yearly: f64,
    pub rate: RatePeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationKind {
    Stability,
    Scheduling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: RecommendationPriority,
    pub label: String,
    pub message: String,
    pub potential_savings: String,
}

/// One channel as seen by the energy composer
#[derive(Debug, Clone)]
pub struct EnergyInput {
    pub profile: ChannelProfile,
    /// Statistics over the last 24 hours
    pub stats: RollingStatistics,
    pub current: f64,
}

impl EnergyInput {
    fn full_scale(&self) -> f64 {
        self.profile.max.filter(|max| *max != 0.0).unwrap_or(DEFAULT_FULL_SCALE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyReport {
    pub efficiency_score: u32,
    pub daily_kwh: f64,
    pub cost: CostEstimate,
    pub recommendations: Vec<Recommendation>,
}

/// Efficiency, consumption and cost estimates under a tariff
#[derive(Debug, Clone, Default)]
pub struct EnergyOptimizer {
    rates: PowerRates,
}

impl EnergyOptimizer {
    pub fn new(rates: PowerRates) -> Self {
        Self { rates }
    }

    pub fn rates(&self) -> PowerRates {
        self.rates
    }

    pub fn set_rates(&mut self, peak: f64, off_peak: f64) {
        self.rates = PowerRates { peak, off_peak };
    }

    /// Mean stability score over channels with enough samples, rounded; 0 when none qualify
    pub fn efficiency_score(&self, inputs: &[EnergyInput]) -> u32 {
        let scores: Vec<f64> = inputs
            .iter()
            .filter(|input| input.stats.count > EFFICIENCY_MIN_SAMPLES)
            .map(|input| stats::stability_score(input.stats.mean, input.stats.std_dev))
            .collect();

        if scores.is_empty() {
            0
        } else {
            stats::mean(&scores).round() as u32
        }
    }

    pub fn estimate_daily_kwh(&self, inputs: &[EnergyInput]) -> f64 {
        inputs
            .iter()
            .filter(|input| input.stats.count > 0)
            .map(|input| input.stats.mean / input.full_scale() * KWH_PER_CHANNEL_DAY)
            .sum()
    }

    /// Cost of `daily_kwh` at the tariff in force at `hour` (0-23)
    pub fn cost(&self, daily_kwh: f64, hour: u32) -> CostEstimate {
        let (rate, period) = if is_peak_hour(hour) {
            (self.rates.peak, RatePeriod::Peak)
        } else {
            (self.rates.off_peak, RatePeriod::OffPeak)
        };
        let daily = daily_kwh * rate;
        CostEstimate {
            daily,
            monthly: daily * 30.0,
            yearly: daily * 365.0,
            rate: period,
        }
    }

    pub fn recommendations(&self, inputs: &[EnergyInput], hour: u32) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        for input in inputs {
            let label = &input.profile.label;

            if input.stats.std_dev > input.stats.mean * 0.3 {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::Stability,
                    priority: RecommendationPriority::Medium,
                    label: label.clone(),
                    message: format!(
                        "{label} shows high variability. Consider stabilizing the system for better efficiency."
                    ),
                    potential_savings: "10-15%".to_string(),
                });
            }

            if is_peak_hour(hour) && input.current > input.full_scale() * 0.7 {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::Scheduling,
                    priority: RecommendationPriority::High,
                    label: label.clone(),
                    message: format!(
                        "{label} is running high during peak hours. Consider scheduling for off-peak times."
                    ),
                    potential_savings: "20-30%".to_string(),
                });
            }
        }

        recommendations
    }

    pub fn report(&self, inputs: &[EnergyInput], hour: u32) -> EnergyReport {
        let daily_kwh = self.estimate_daily_kwh(inputs);
        EnergyReport {
            efficiency_score: self.efficiency_score(inputs),
            daily_kwh,
            cost: self.cost(daily_kwh, hour),
            recommendations: self.recommendations(inputs, hour),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixon_common::ChannelId;

    fn input(label: &str, count: usize, mean: f64, std_dev: f64, current: f64) -> EnergyInput {
        EnergyInput {
            profile: ChannelProfile::new(ChannelId::new(0), label),
            stats: RollingStatistics {
                count,
                mean,
                min: mean - std_dev,
                max: mean + std_dev,
                std_dev,
            },
            current,
        }
    }

    #[test]
    fn test_efficiency_score_skips_sparse_channels() {
        let optimizer = EnergyOptimizer::default();
        let inputs = vec![
            input("Fan", 20, 50.0, 5.0, 50.0),    // 90
            input("Pump", 20, 50.0, 2.0, 40.0),   // 96
            input("Heater", 10, 10.0, 10.0, 0.0), // not enough samples
        ];
        assert_eq!(optimizer.efficiency_score(&inputs), 93);
        assert_eq!(optimizer.efficiency_score(&[]), 0);
    }

    #[test]
    fn test_daily_kwh_uses_full_scale() {
        let optimizer = EnergyOptimizer::default();
        let mut lamp = input("Lamp", 5, 250.0, 0.0, 0.0);
        lamp.profile = lamp.profile.with_max(500.0);
        let inputs = vec![input("Fan", 5, 50.0, 0.0, 0.0), lamp, input("Idle", 0, 0.0, 0.0, 0.0)];

        let kwh = optimizer.estimate_daily_kwh(&inputs);
        assert!((kwh - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_cost_by_period() {
        let optimizer = EnergyOptimizer::default();
        let peak = optimizer.cost(2.0, 12);
        assert_eq!(peak.rate, RatePeriod::Peak);
        assert!((peak.daily - 0.3).abs() < 1e-12);
        assert!((peak.monthly - 9.0).abs() < 1e-9);

        let night = optimizer.cost(2.0, 21);
        assert_eq!(night.rate, RatePeriod::OffPeak);
        assert!((night.yearly - 58.4).abs() < 1e-9);
        assert_eq!(optimizer.cost(1.0, 8).rate, RatePeriod::OffPeak);
        assert_eq!(optimizer.cost(1.0, 9).rate, RatePeriod::Peak);
    }

    #[test]
    fn test_recommendations() {
        let optimizer = EnergyOptimizer::default();
        let inputs = vec![input("Heater", 30, 50.0, 20.0, 80.0), input("Fan", 30, 50.0, 1.0, 10.0)];

        let daytime = optimizer.recommendations(&inputs, 14);
        assert_eq!(daytime.len(), 2);
        assert_eq!(daytime[0].kind, RecommendationKind::Stability);
        assert_eq!(daytime[0].potential_savings, "10-15%");
        assert_eq!(daytime[1].kind, RecommendationKind::Scheduling);
        assert_eq!(daytime[1].priority, RecommendationPriority::High);

        let night = optimizer.recommendations(&inputs, 23);
        assert_eq!(night.len(), 1);
    }

    #[test]
    fn test_custom_rates() {
        let mut optimizer = EnergyOptimizer::default();
        optimizer.set_rates(0.30, 0.10);
        let report = optimizer.report(&[input("Fan", 20, 100.0, 0.0, 0.0)], 10);
        assert!((report.daily_kwh - 0.1).abs() < 1e-12);
        assert!((report.cost.daily - 0.03).abs() < 1e-12);
        assert_eq!(report.efficiency_score, 100);
    }
}
