//! Incremental statistics over sampled observations
//!
//! [`RunningStats`] accumulates the per-line CPU-utilization distribution;
//! its mean scales attributed CPU percentages. [`FootprintSeries`] holds the
//! memory-footprint time series, globally and per line. Both travel inside
//! the persisted statistics store, so both are serde-serializable and know
//! how to merge with a store contributed by a child process.

use serde::{Deserialize, Serialize};

/// Running mean over a stream of observations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
}

impl RunningStats {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        self.mean += (x - self.mean) / self.count as f64;
    }

    /// Number of observations recorded
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of all observations, 0.0 when empty
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Fold another accumulator into this one (weighted by observation count)
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        let total = self.count + other.count;
        self.mean = (self.mean * self.count as f64 + other.mean * other.count as f64)
            / total as f64;
        self.count = total;
    }
}

/// One observation of the allocation time series.
///
/// Serializes as a two-element array `[timestamp, footprint_mb]`, which is
/// the wire form the report structure uses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FootprintSample(pub f64, pub f64);

impl FootprintSample {
    /// Timestamp of the observation (seconds)
    pub fn timestamp(&self) -> f64 {
        self.0
    }

    /// Memory footprint at that time (MB)
    pub fn footprint_mb(&self) -> f64 {
        self.1
    }
}

/// Ordered collection of footprint samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FootprintSeries {
    samples: Vec<FootprintSample>,
}

impl FootprintSeries {
    /// Create an empty series
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample
    pub fn push(&mut self, timestamp: f64, footprint_mb: f64) {
        self.samples.push(FootprintSample(timestamp, footprint_mb));
    }

    /// All recorded samples, in insertion order
    pub fn samples(&self) -> &[FootprintSample] {
        &self.samples
    }

    /// True when no sample carries a non-zero timestamp or footprint.
    ///
    /// Drives the "attach only if any non-zero entries exist" rule for
    /// per-line memory samples.
    pub fn is_all_zero(&self) -> bool {
        self.samples.iter().all(|s| s.0 == 0.0 && s.1 == 0.0)
    }

    /// True when the series holds no samples at all
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append all samples from another series (child-process merge)
    pub fn merge(&mut self, other: &FootprintSeries) {
        self.samples.extend_from_slice(&other.samples);
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
