use log::debug;
use crate::config::DriftConfig;

/// Which correction tier a drift measurement fell into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftTier {
    /// Inside the small deadzone, left alone
    None,
    Slow,
    Normal,
    /// Too far off to pull in gradually
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub tier: DriftTier,
    /// |anchor - expected| before correction, seconds
    pub drift: f64,
    /// New timecode anchor
    pub anchor: f64,
    /// True when the clock should be reported as drifting
    pub drifting: bool,
}

/// Tiered drift corrector.
///
/// Small drift is noise and is ignored; medium drift is pulled in slowly;
/// larger drift is pulled in faster and flagged; anything beyond the large
/// threshold is a hard re-anchor.
pub struct DriftServo {
    deadzone_small: f64,
    deadzone_medium: f64,
    threshold_large: f64,
    slow_rate: f64,
    normal_rate: f64,
}

impl DriftServo {
    pub fn new(config: &DriftConfig) -> Self {
        DriftServo {
            deadzone_small: config.deadzone_small,
            deadzone_medium: config.deadzone_medium,
            threshold_large: config.threshold_large,
            slow_rate: config.slow_rate,
            normal_rate: config.normal_rate,
        }
    }

    /// Compute the correction that moves `anchor` towards `expected` (both
    /// timecode seconds at the same reference instant).
    pub fn evaluate(&self, anchor: f64, expected: f64) -> Correction {
        let error = expected - anchor;
        let drift = error.abs();

        let (tier, new_anchor, drifting) = if drift <= self.deadzone_small {
            (DriftTier::None, anchor, false)
        } else if drift <= self.deadzone_medium {
            (DriftTier::Slow, anchor + error * self.slow_rate, false)
        } else if drift <= self.threshold_large {
            (DriftTier::Normal, anchor + error * self.normal_rate, true)
        } else {
            (DriftTier::Hard, expected, false)
        };

        debug!("[Servo] Drift={:+.1}ms Tier={:?} Adj={:+.3}ms",
            error * 1000.0, tier, (new_anchor - anchor) * 1000.0);

        Correction {
            tier,
            drift,
            anchor: new_anchor,
            drifting,
        }
    }
}

impl Default for DriftServo {
    fn default() -> Self {
        Self::new(&DriftConfig::default())
    }
}
