//! Downstream synchronizer - drives an external timeline from the virtual clock
//!
//! Two ways to start following:
//! - **Immediate**: position the target and play right away
//! - **Gated**: pause, wait for the next multiple of `gate_interval` on the
//!   reference clock, then position and play. Several machines gated on a
//!   shared reference start on the same instant.
//!
//! While running, a position error only triggers a hard resync after it has
//! persisted for `continuous_observation_time`. Short glitches are ignored.

use log::{info, warn, debug};
use crate::config::{PlaybackConfig, TimingMode};
use crate::events::SignalTransition;
use crate::traits::{PlaybackState, PlaybackTarget};

/// A gate closer than this is not worth waiting for
pub const MIN_GATE_LEAD: f64 = 0.1;

/// Fraction of the error applied per nudge in continuous mode
const NUDGE_GAIN: f64 = 0.1;

pub struct PlaybackSync<P: PlaybackTarget> {
    target: P,
    config: PlaybackConfig,
    pending_gate: Option<f64>,
    out_of_sync_since: Option<f64>,
    hard_sync_count: u64,
    nudge_count: u64,
}

impl<P: PlaybackTarget> PlaybackSync<P> {
    pub fn new(target: P, config: &PlaybackConfig) -> Self {
        PlaybackSync {
            target,
            config: config.clone(),
            pending_gate: None,
            out_of_sync_since: None,
            hard_sync_count: 0,
            nudge_count: 0,
        }
    }

    pub fn target(&self) -> &P {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut P {
        &mut self.target
    }

    pub fn set_config(&mut self, config: &PlaybackConfig) {
        self.config = config.clone();
    }

    /// Reference time of the scheduled gated start, if one is pending
    pub fn pending_gate(&self) -> Option<f64> {
        self.pending_gate
    }

    pub fn hard_sync_count(&self) -> u64 {
        self.hard_sync_count
    }

    pub fn nudge_count(&self) -> u64 {
        self.nudge_count
    }

    /// Timeline position the clock maps to
    pub fn target_position(&self, clock_seconds: f64) -> f64 {
        let position = clock_seconds + self.config.timeline_offset;
        if self.config.snap_to_fps && self.config.playback_fps > 0.0 {
            (position * self.config.playback_fps).round() / self.config.playback_fps
        } else {
            position
        }
    }

    /// First multiple of the gate interval at or after `now`
    pub fn next_gate(&self, now: f64) -> f64 {
        (now / self.config.gate_interval).ceil() * self.config.gate_interval
    }

    pub fn handle(&mut self, transition: SignalTransition, now: f64, clock_seconds: f64) {
        match transition {
            SignalTransition::Started => self.on_started(now, clock_seconds),
            SignalTransition::Stopped => self.on_stopped(),
        }
    }

    pub fn on_started(&mut self, now: f64, clock_seconds: f64) {
        self.out_of_sync_since = None;

        if self.config.gated_start {
            let gate = self.next_gate(now);
            if gate - now >= MIN_GATE_LEAD {
                info!("[Playback] Gated start at {:.3} ({:.0}ms)", gate, (gate - now) * 1000.0);
                if let Err(e) = self.target.pause() {
                    warn!("[Playback] Pause failed: {}", e);
                }
                self.pending_gate = Some(gate);
                return;
            }
            debug!("[Playback] Gate {:.3} too close, starting now", gate);
        }

        self.pending_gate = None;
        self.hard_sync(clock_seconds);
    }

    pub fn on_stopped(&mut self) {
        if self.pending_gate.take().is_some() {
            info!("[Playback] Pending gated start cancelled");
        }
        self.out_of_sync_since = None;
        if let Err(e) = self.target.pause() {
            warn!("[Playback] Pause failed: {}", e);
        }
    }

    /// Per-tick follow. `signal_running` is the debounced signal state.
    pub fn tick(&mut self, now: f64, clock_seconds: f64, signal_running: bool) {
        if let Some(gate) = self.pending_gate {
            if now >= gate {
                self.pending_gate = None;
                info!("[Playback] Gate reached");
                self.hard_sync(clock_seconds);
            }
            return;
        }

        if !signal_running {
            // A gap breaks the observation window
            self.out_of_sync_since = None;
            return;
        }

        let target = self.target_position(clock_seconds);
        let position = self.target.position();
        let error = target - position;
        let diff = error.abs();

        if diff > self.config.sync_threshold {
            let since = *self.out_of_sync_since.get_or_insert(now);
            if now - since >= self.config.continuous_observation_time {
                info!("[Playback] Off by {:.0}ms for {:.2}s - resync", diff * 1000.0, now - since);
                if let Err(e) = self.target.set_position(target) {
                    warn!("[Playback] Seek failed: {}", e);
                }
                self.hard_sync_count += 1;
                self.out_of_sync_since = None;
            }
        } else {
            self.out_of_sync_since = None;
            if self.config.timing_mode == TimingMode::Continuous
                && diff > 0.0
                && diff < 1.0 / self.config.playback_fps
            {
                if let Err(e) = self.target.set_position(position + error * NUDGE_GAIN) {
                    warn!("[Playback] Nudge failed: {}", e);
                }
                self.nudge_count += 1;
            }
        }

        if self.target.state() != PlaybackState::Playing {
            debug!("[Playback] Target not playing, resuming");
            if let Err(e) = self.target.play() {
                warn!("[Playback] Play failed: {}", e);
            }
        }
    }

    fn hard_sync(&mut self, clock_seconds: f64) {
        let target = self.target_position(clock_seconds);
        info!("[Playback] Hard sync to {:.3}s", target);
        if let Err(e) = self.target.set_position(target) {
            warn!("[Playback] Seek failed: {}", e);
        }
        if let Err(e) = self.target.play() {
            warn!("[Playback] Play failed: {}", e);
        }
        self.hard_sync_count += 1;
    }
}
