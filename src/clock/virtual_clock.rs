//! Free-running output clock anchored to the reference clock.
//!
//! Between LTC updates the clock advances by reference-clock deltas only, so
//! decoder jitter never reaches the output. The controller re-anchors it on
//! lock, on jumps, and through the drift servo.

use log::debug;

/// Deltas above this are treated as a reference glitch (suspend, stalled loop)
const MAX_TICK_DELTA: f64 = 1.0;

#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    anchor_reference_time: f64,
    anchor_timecode_time: f64,
    running: bool,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by the reference delta since the last tick.
    ///
    /// A negative delta, or one above 1s, only rebases the anchor without
    /// advancing timecode.
    pub fn tick(&mut self, now: f64) {
        let delta = now - self.anchor_reference_time;
        if !(0.0..=MAX_TICK_DELTA).contains(&delta) {
            if self.running {
                debug!("[Clock] Reference delta {:+.3}s out of range, rebasing", delta);
            }
            self.anchor_reference_time = now;
            return;
        }
        if self.running {
            self.anchor_timecode_time += delta;
        }
        self.anchor_reference_time = now;
    }

    /// Hard re-anchor: `target` timecode seconds at reference time `at`
    pub fn reanchor(&mut self, target: f64, at: f64) {
        self.anchor_timecode_time = target;
        self.anchor_reference_time = at;
    }

    /// Move the timecode anchor without touching the reference anchor
    pub fn set_anchor_timecode(&mut self, value: f64) {
        self.anchor_timecode_time = value;
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stops output and zeroes the timecode anchor
    pub fn stop(&mut self) {
        self.running = false;
        self.anchor_timecode_time = 0.0;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Timecode seconds at the last tick; 0 when not running
    pub fn current_seconds(&self) -> f64 {
        if self.running {
            self.anchor_timecode_time
        } else {
            0.0
        }
    }

    pub fn anchor_timecode_time(&self) -> f64 {
        self.anchor_timecode_time
    }

    pub fn anchor_reference_time(&self) -> f64 {
        self.anchor_reference_time
    }
}
