//! Pattern Analyzer - classifies the most recent samples
//!
//! Looks at the last `min(5, count)` samples and decides, in priority order:
//! 1. **Stopped**: timecode is not advancing (every pair moved less than `stop_threshold`)
//! 2. **Jumped**: the newest sample moved more than `jump_threshold` from the previous one
//! 3. **Stable**: every pair advanced in step with the reference clock (within `sync_threshold`)
//!
//! Anything else is `Indeterminate`: moderate noise that is neither a jump nor
//! stable. The caller leaves its state unchanged for those.

use crate::config::AnalyzerConfig;
use crate::history::Sample;

/// Samples inspected per classification
pub const WINDOW: usize = 5;
/// Minimum samples before anything is classified
pub const MIN_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Fewer than `MIN_SAMPLES`
    Insufficient,
    Stopped,
    Jumped,
    Stable,
    /// None of the rules matched
    Indeterminate,
}

#[derive(Debug, Clone)]
pub struct PatternAnalyzer {
    stop_threshold: f64,
    jump_threshold: f64,
    sync_threshold: f64,
}

impl Default for PatternAnalyzer {
    fn default() -> Self {
        Self::new(&AnalyzerConfig::default())
    }
}

impl PatternAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Self {
        PatternAnalyzer {
            stop_threshold: config.stop_threshold,
            jump_threshold: config.jump_threshold,
            sync_threshold: config.sync_threshold,
        }
    }

    /// `samples` must be chronological (oldest first)
    pub fn classify(&self, samples: &[Sample]) -> Pattern {
        if samples.len() < MIN_SAMPLES {
            return Pattern::Insufficient;
        }

        let window = &samples[samples.len() - WINDOW.min(samples.len())..];
        let count = window.len();

        let stopped_pairs = window
            .windows(2)
            .filter(|w| (w[1].timecode_seconds - w[0].timecode_seconds).abs() < self.stop_threshold)
            .count();
        if stopped_pairs >= count - 1 {
            return Pattern::Stopped;
        }

        let last = &window[count - 1];
        let prev = &window[count - 2];
        if (last.timecode_seconds - prev.timecode_seconds).abs() > self.jump_threshold {
            return Pattern::Jumped;
        }

        let stable = window.windows(2).all(|w| {
            let d_tc = w[1].timecode_seconds - w[0].timecode_seconds;
            let d_ref = w[1].reference_clock - w[0].reference_clock;
            (d_tc - d_ref).abs() < self.sync_threshold
        });
        if stable {
            return Pattern::Stable;
        }

        Pattern::Indeterminate
    }
}
