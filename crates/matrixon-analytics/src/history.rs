//! # Channel History Buffer
//!
//! Fixed-capacity FIFO of `(value, timestamp)` points for one channel.
//! Insertion order is arrival order; timestamps are not re-sorted.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of points retained per channel
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// One recorded reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Bounded history of a single channel
#[derive(Debug, Clone)]
pub struct ChannelHistory {
    points: VecDeque<DataPoint>,
    capacity: usize,
}

impl ChannelHistory {
    /// Create an empty history; a zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
        }
    }

    /// Append a point, returning the evicted oldest point on overflow
    pub fn push(&mut self, value: f64, timestamp: DateTime<Utc>) -> Option<DataPoint> {
        let evicted = if self.points.len() == self.capacity {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(DataPoint { value, timestamp });
        evicted
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Last `count` points in arrival order
    pub fn recent(&self, count: usize) -> Vec<DataPoint> {
        let skip = self.points.len().saturating_sub(count);
        self.points.iter().skip(skip).copied().collect()
    }

    /// Values of the last `count` points in arrival order
    pub fn recent_values(&self, count: usize) -> Vec<f64> {
        let skip = self.points.len().saturating_sub(count);
        self.points.iter().skip(skip).map(|p| p.value).collect()
    }

    /// Points with `timestamp >= now - window`
    pub fn windowed(&self, window: Duration, now: DateTime<Utc>) -> Vec<DataPoint> {
        match cutoff(window, now) {
            Some(cutoff) => self
                .points
                .iter()
                .filter(|p| p.timestamp >= cutoff)
                .copied()
                .collect(),
            None => self.points.iter().copied().collect(),
        }
    }

    /// Points with `start <= timestamp <= end`
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DataPoint> {
        self.points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .copied()
            .collect()
    }

    /// Values selected by an optional time window
    pub fn values(&self, window: Option<Duration>, now: DateTime<Utc>) -> Vec<f64> {
        match window {
            Some(window) => self.windowed(window, now).into_iter().map(|p| p.value).collect(),
            None => self.points.iter().map(|p| p.value).collect(),
        }
    }

    pub fn last(&self) -> Option<DataPoint> {
        self.points.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataPoint> {
        self.points.iter()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

impl Default for ChannelHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// `now - window`, or `None` when the window reaches past the representable range
fn cutoff(window: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
}
