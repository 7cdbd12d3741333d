//! Timecode Noise Statistics
//!
//! Robust statistics over the long sample ring buffer, used for status
//! reporting and diagnostics. They never feed back into the correction path.
//!
//! ## The Problem
//! Each decoded LTC frame is stamped with the capture time of the audio block
//! it arrived in, not the exact instant its sync word ended. Block scheduling
//! and decoder latency show up as jitter between the timecode delta and the
//! reference-clock delta of consecutive samples.
//!
//! ## The Solution
//! Per consecutive pair, `error = Δtimecode - Δreference`. We report:
//! - median and MAD (Median Absolute Deviation), resistant to outliers
//! - standard deviation, the usual jitter figure
//! - spike count: samples deviating more than `K * max(MAD, floor)` from median
//!
//! A large mean error with low MAD is real rate mismatch; a large MAD is noise.

use crate::history::Sample;

/// MAD multiplier for spike detection (balanced)
const K_SPIKE: f64 = 5.0;
/// Minimum MAD floor so a near-perfect signal doesn't flag every sample (seconds)
const MIN_MAD_FLOOR: f64 = 0.000_5;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NoiseStats {
    /// Number of pair errors the statistics were computed from
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub mad: f64,
    pub stddev: f64,
    pub spikes: usize,
}

impl NoiseStats {
    /// Needs at least two pairs (three samples); otherwise all zero.
    pub fn from_samples(samples: &[Sample]) -> Self {
        let errors: Vec<f64> = samples
            .windows(2)
            .map(|w| {
                let d_tc = w[1].timecode_seconds - w[0].timecode_seconds;
                let d_ref = w[1].reference_clock - w[0].reference_clock;
                d_tc - d_ref
            })
            .collect();

        if errors.len() < 2 {
            return NoiseStats::default();
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;

        let median = median_of(&errors);
        let deviations: Vec<f64> = errors.iter().map(|e| (e - median).abs()).collect();
        let mad = median_of(&deviations);

        let threshold = K_SPIKE * mad.max(MIN_MAD_FLOOR);
        let spikes = deviations.iter().filter(|&&d| d > threshold).count();

        NoiseStats {
            count: errors.len(),
            mean,
            median,
            mad,
            stddev: variance.sqrt(),
            spikes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Spike share in percent
    pub fn spike_ratio(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.spikes as f64 / self.count as f64 * 100.0
        }
    }
}

fn median_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted[sorted.len() / 2]
}
