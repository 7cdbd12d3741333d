//! LTC Controller - Core chase synchronization logic
//!
//! This controller turns a noisy, intermittent stream of decoded LTC frames
//! into a free-running virtual clock:
//! 1. **Sample**: each valid decode is stamped with its capture time and pushed
//!    into the bounded history
//! 2. **Classify**: the pattern analyzer decides whether timecode stopped,
//!    jumped, or is advancing in step with the reference clock
//! 3. **Correct**: stable streams lock the clock and then feed the tiered drift
//!    servo; jumps hard re-anchor it
//!
//! Key features:
//! - Output advances on reference-clock deltas only (jitter never reaches it)
//! - Tiered drift correction with deadzones (no correction for noise)
//! - Decode timeout drops to NoSignal and relocks automatically
//! - Debounced Started/Stopped plus timecode-reached events

use anyhow::Result;
use chrono::Utc;
use log::{info, warn, debug};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use crate::analyzer::{self, Pattern, PatternAnalyzer};
use crate::clock::{ReferenceClock, VirtualClock};
use crate::config::SystemConfig;
use crate::events::{
    EventDispatcher, SignalState, SignalStateMachine, SignalTransition, SyncEvent,
    TimecodeEvent, TimecodeEventSet, TimecodePayload,
};
use crate::history::{Sample, SampleHistory};
use crate::noise::NoiseStats;
use crate::servo::{DriftServo, DriftTier};
use crate::status::SyncStatus;
use crate::timecode::{frames_to_seconds, TimecodeFormat};
use crate::traits::{Decoded, DecodedBlock, TimecodeSource};

// Smallest level change worth a SignalLevelChanged event
const LEVEL_CHANGE_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    NoSignal,
    Syncing,
    Locked,
    Drifting,
}

impl SyncState {
    pub fn label(self) -> &'static str {
        match self {
            SyncState::NoSignal => "NO-SIGNAL",
            SyncState::Syncing => "SYNC",
            SyncState::Locked => "LOCK",
            SyncState::Drifting => "DRIFT",
        }
    }
}

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Main LTC chase controller
pub struct LtcController<R, S>
where
    R: ReferenceClock,
    S: TimecodeSource,
{
    // Collaborators
    clock: R,
    source: S,
    config: SystemConfig,

    // Configured format, and the one in effect after decoder drop-frame overrides
    format: TimecodeFormat,
    active_format: TimecodeFormat,

    // Synchronization
    history: SampleHistory,
    analyzer: PatternAnalyzer,
    servo: DriftServo,
    vclock: VirtualClock,
    sync_state: SyncState,
    last_drift: f64,

    // Signal tracking
    signal: SignalStateMachine,
    decoding: bool,
    has_signal: bool,
    last_decode_time: f64,
    last_decoded: Option<String>,
    last_decoded_seconds: f64,
    last_level: Option<f32>,

    // Events
    events: TimecodeEventSet,
    dispatcher: EventDispatcher,

    // Classifier counters
    jump_count: u64,
    hard_reanchor_count: u64,
    indeterminate_count: u64,
    stopped_count: u64,

    // Shared status for the host
    status_shared: Arc<RwLock<SyncStatus>>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl<R, S> LtcController<R, S>
where
    R: ReferenceClock,
    S: TimecodeSource,
{
    pub fn new(
        clock: R,
        source: S,
        status_shared: Arc<RwLock<SyncStatus>>,
        config: SystemConfig,
    ) -> Self {
        let config = config.sanitized();
        let format = config.timecode_format();

        info!("=== LTC Controller Initialization ===");
        info!("Frame rate: {} ({:.3} fps, drop-frame {})", format.rate, format.actual_fps(),
              if format.drop_frame { "on" } else { "off" });
        info!("Analyzer: window={}, stop<{}s, jump>{}s, sync<{}s",
              config.analyzer.buffer_capacity, config.analyzer.stop_threshold,
              config.analyzer.jump_threshold, config.analyzer.sync_threshold);
        info!("Servo: deadzones {:.0}/{:.0}/{:.0}ms, rates {}/{}",
              config.drift.deadzone_small * 1000.0, config.drift.deadzone_medium * 1000.0,
              config.drift.threshold_large * 1000.0, config.drift.slow_rate, config.drift.normal_rate);
        info!("Signal: start {}s, stop {}s, timeout {}s",
              config.signal.start_hysteresis, config.signal.stop_hysteresis, config.signal.decode_timeout);
        info!("=== Ready ===");

        LtcController {
            clock,
            source,
            format,
            active_format: format,
            history: SampleHistory::new(config.analyzer.buffer_capacity),
            analyzer: PatternAnalyzer::new(&config.analyzer),
            servo: DriftServo::new(&config.drift),
            vclock: VirtualClock::new(),
            sync_state: SyncState::NoSignal,
            last_drift: 0.0,
            signal: SignalStateMachine::new(&config.signal),
            decoding: false,
            has_signal: false,
            last_decode_time: 0.0,
            last_decoded: None,
            last_decoded_seconds: 0.0,
            last_level: None,
            events: TimecodeEventSet::new(),
            dispatcher: EventDispatcher::new(),
            jump_count: 0,
            hard_reanchor_count: 0,
            indeterminate_count: 0,
            stopped_count: 0,
            status_shared,
            config,
        }
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn get_status_shared(&self) -> Arc<RwLock<SyncStatus>> {
        self.status_shared.clone()
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Format in effect, including any decoder drop-frame override
    pub fn format(&self) -> TimecodeFormat {
        self.active_format
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn signal_state(&self) -> SignalState {
        self.signal.state()
    }

    pub fn has_signal(&self) -> bool {
        self.has_signal
    }

    pub fn is_running(&self) -> bool {
        self.vclock.is_running()
    }

    /// Virtual clock position in seconds (0 when not running)
    pub fn current_seconds(&self) -> f64 {
        self.vclock.current_seconds()
    }

    pub fn current_timecode(&self) -> String {
        self.active_format.seconds_to_string(self.current_seconds())
    }

    pub fn last_decoded(&self) -> Option<&str> {
        self.last_decoded.as_deref()
    }

    /// Last drift measured by the servo (expected - clock), seconds
    pub fn last_drift(&self) -> f64 {
        self.last_drift
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    pub fn noise_stats(&self) -> NoiseStats {
        NoiseStats::from_samples(&self.history.ring())
    }

    pub fn events(&self) -> &TimecodeEventSet {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut TimecodeEventSet {
        &mut self.events
    }

    pub fn add_event(&mut self, event: TimecodeEvent) {
        self.events.add(event);
    }

    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.dispatcher.subscribe(handler);
    }

    /// Apply a new configuration. Values are clamped; a frame-rate change
    /// invalidates the sample history.
    pub fn set_config(&mut self, config: SystemConfig) {
        let config = config.sanitized();
        let format = config.timecode_format();

        self.analyzer = PatternAnalyzer::new(&config.analyzer);
        self.servo = DriftServo::new(&config.drift);
        self.history.set_capacity(config.analyzer.buffer_capacity);
        self.signal.set_hysteresis(&config.signal);

        if format != self.format {
            info!("[LTC] Frame rate {} -> {} (drop-frame {}), clearing history",
                  self.format.rate, format.rate, format.drop_frame);
            self.history.clear_all();
            self.format = format;
            self.active_format = format;
        }
        self.config = config;
    }

    pub fn log_status(&self) {
        self.update_shared_status();
        if let Ok(status) = self.status_shared.read() {
            info!("[LTC] {}", status.summary());
        }
    }

    /// Poll the source, ingest everything pending, then tick.
    pub fn process_loop_iteration(&mut self) -> Result<Option<SignalTransition>> {
        let now = self.clock.now();
        while let Some(block) = self.source.poll()? {
            self.ingest(block, now);
        }
        Ok(self.tick(now))
    }

    /// Stop capture: stops and drains the source, then stops the clock.
    pub fn stop_capture(&mut self) {
        if let Err(e) = self.source.stop() {
            warn!("Source stop failed: {}", e);
        }
        loop {
            match self.source.poll() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    warn!("Source drain failed: {}", e);
                    break;
                }
            }
        }

        self.decoding = false;
        self.has_signal = false;
        self.vclock.stop();
        self.sync_state = SyncState::NoSignal;
        self.history.clear();
        info!("[LTC] Capture stopped");
        self.update_shared_status();
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Feed one decoded block. `now` is the reference time of processing.
    pub fn ingest(&mut self, block: DecodedBlock, now: f64) {
        // Bring the anchor to `now` so corrections compare like with like
        self.vclock.tick(now);

        if let Some(level) = block.level {
            self.update_level(level);
        }

        for decoded in block.results {
            self.ingest_decoded(decoded, block.capture_time, now);
        }
    }

    fn ingest_decoded(&mut self, decoded: Decoded, capture_time: f64, now: f64) {
        if !decoded.valid {
            debug!("[LTC] Decoder flagged '{}' invalid", decoded.timecode);
            return;
        }

        let format = self.format.with_decoded_flag(decoded.drop_frame);
        let frames = match format.to_frames(&decoded.timecode) {
            Some(frames) => frames,
            None => {
                debug!("[LTC] Rejected malformed timecode '{}'", decoded.timecode);
                return;
            }
        };
        if format != self.active_format {
            info!("[LTC] Decoder reports drop-frame {}", if format.drop_frame { "on" } else { "off" });
            self.active_format = format;
        }

        let seconds = frames_to_seconds(frames, format.actual_fps());
        let timecode = format.frames_to_string(frames);

        self.decoding = true;
        self.has_signal = true;
        self.last_decode_time = capture_time;
        self.last_decoded_seconds = seconds;

        if self.last_decoded.as_deref() != Some(timecode.as_str()) {
            let payload = self.payload_at(frames, capture_time);
            self.dispatcher.dispatch(&SyncEvent::TimecodeUpdated(payload));
            self.last_decoded = Some(timecode.clone());
        }

        self.history.push(Sample::new(capture_time, seconds, timecode));
        self.analyze(now);
    }

    fn update_level(&mut self, level: f32) {
        let changed = match self.last_level {
            Some(last) => (last - level).abs() >= LEVEL_CHANGE_EPSILON,
            None => true,
        };
        if changed {
            self.last_level = Some(level);
            self.dispatcher.dispatch(&SyncEvent::SignalLevelChanged { level });
        }
    }

    // ========================================================================
    // CLASSIFICATION AND CORRECTION
    // ========================================================================

    fn analyze(&mut self, now: f64) {
        let samples = self.history.last_n(analyzer::WINDOW);
        let last = match samples.last() {
            Some(s) => s.clone(),
            None => return,
        };

        match self.analyzer.classify(&samples) {
            Pattern::Insufficient => {
                if self.sync_state != SyncState::Syncing {
                    info!("[LTC] Syncing ({} samples)", samples.len());
                }
                self.sync_state = SyncState::Syncing;
            }
            Pattern::Stopped => {
                // Stop handling belongs to the decode timeout
                self.stopped_count += 1;
                debug!("[Analyzer] Timecode not advancing at {} (left to decode timeout)", last.timecode);
            }
            Pattern::Jumped => {
                let target = Self::expected_at(&last, now);
                info!("[LTC] Jump to {} - hard reanchor", last.timecode);
                self.vclock.reanchor(target, now);
                self.vclock.start();
                self.sync_state = SyncState::Locked;
                self.last_drift = 0.0;
                self.jump_count += 1;
            }
            Pattern::Stable => match self.sync_state {
                SyncState::NoSignal | SyncState::Syncing => self.initial_lock(&last, now),
                SyncState::Locked | SyncState::Drifting => self.correct_drift(&last, now),
            },
            Pattern::Indeterminate => {
                self.indeterminate_count += 1;
                debug!("[Analyzer] Indeterminate window ending {} (state {:?} kept, {} total)",
                       last.timecode, self.sync_state, self.indeterminate_count);
            }
        }
    }

    /// Timecode the sample implies for reference time `now`
    fn expected_at(sample: &Sample, now: f64) -> f64 {
        sample.timecode_seconds + (now - sample.reference_clock)
    }

    fn initial_lock(&mut self, last: &Sample, now: f64) {
        let target = Self::expected_at(last, now);
        self.vclock.reanchor(target, now);
        self.vclock.start();
        self.sync_state = SyncState::Locked;
        self.last_drift = 0.0;
        info!("[LTC] === LOCKED === {}", last.timecode);
    }

    fn correct_drift(&mut self, last: &Sample, now: f64) {
        let expected = Self::expected_at(last, now);
        let anchor = self.vclock.anchor_timecode_time();
        let correction = self.servo.evaluate(anchor, expected);
        self.last_drift = expected - anchor;

        if correction.tier == DriftTier::Hard {
            self.vclock.reanchor(correction.anchor, now);
            self.hard_reanchor_count += 1;
            info!("[LTC] Drift {:+.1}ms beyond {:.0}ms - hard reanchor",
                  self.last_drift * 1000.0, self.config.drift.threshold_large * 1000.0);
        } else {
            self.vclock.set_anchor_timecode(correction.anchor);
        }

        let state = if correction.drifting { SyncState::Drifting } else { SyncState::Locked };
        if state != self.sync_state {
            info!("[LTC] {} -> {} (drift {:+.1}ms)", self.sync_state.label(), state.label(),
                  self.last_drift * 1000.0);
            self.sync_state = state;
        }
    }

    // ========================================================================
    // TICK
    // ========================================================================

    /// Advance the clock, run the decode timeout and the signal state machine,
    /// fire per-tick events. Returns the Started/Stopped transition if one fired.
    pub fn tick(&mut self, now: f64) -> Option<SignalTransition> {
        self.vclock.tick(now);

        let timed_out = self.decoding
            && now - self.last_decode_time > self.config.signal.decode_timeout;
        let transition = if timed_out {
            self.handle_decode_timeout(now);
            self.signal.force_absent(now)
        } else {
            self.signal.update(self.has_signal, now)
        };

        if let Some(t) = transition {
            self.on_transition(t, now);
        }

        match self.signal.state() {
            SignalState::Running if self.has_signal => {
                let payload = self.payload_now(now);
                self.dispatcher.dispatch(&SyncEvent::Receiving(payload));
                self.check_timecode_events(now);
            }
            SignalState::Stopped => {
                let payload = self.payload_now(now);
                self.dispatcher.dispatch(&SyncEvent::NoSignalTick(payload));
            }
            _ => {}
        }

        self.update_shared_status();
        transition
    }

    fn handle_decode_timeout(&mut self, now: f64) {
        warn!("[LTC] No valid decode for {:.2}s - signal lost", now - self.last_decode_time);
        self.decoding = false;
        self.has_signal = false;
        self.vclock.stop();
        self.sync_state = SyncState::NoSignal;
        self.last_drift = 0.0;
        self.history.clear();
    }

    fn on_transition(&mut self, transition: SignalTransition, now: f64) {
        let payload = self.payload_now(now);
        match transition {
            SignalTransition::Started => {
                info!("[Signal] === STARTED === {}", payload.timecode);
                self.dispatcher.dispatch(&SyncEvent::Started(payload));
            }
            SignalTransition::Stopped => {
                info!("[Signal] === STOPPED === {}", payload.timecode);
                self.events.reset_all();
                self.dispatcher.dispatch(&SyncEvent::Stopped(payload));
            }
        }
    }

    fn check_timecode_events(&mut self, now: f64) {
        let position = self.position_seconds();
        let fired = self.events.check(position, &self.active_format);
        for name in fired {
            let payload = self.payload_now(now);
            self.dispatcher.dispatch(&SyncEvent::TimecodeReached { name, payload });
        }
    }

    // ========================================================================
    // UTILITY METHODS
    // ========================================================================

    /// Clock position when running, otherwise the last decoded position
    fn position_seconds(&self) -> f64 {
        if self.vclock.is_running() {
            self.vclock.current_seconds()
        } else {
            self.last_decoded_seconds
        }
    }

    fn payload_now(&self, now: f64) -> TimecodePayload {
        let frames = self.active_format.seconds_to_frames(self.position_seconds());
        self.payload_at(frames, now)
    }

    fn payload_at(&self, frames: i64, reference_clock: f64) -> TimecodePayload {
        TimecodePayload {
            timecode: self.active_format.frames_to_string(frames),
            reference_clock,
            absolute_frame: frames,
            drop_frame: self.active_format.drop_frame,
            fps: self.active_format.actual_fps(),
        }
    }

    fn update_shared_status(&self) {
        let noise = self.noise_stats();
        if let Ok(mut status) = self.status_shared.write() {
            status.mode = self.sync_state.label().to_string();
            status.running = self.vclock.is_running();
            status.current_seconds = self.current_seconds();
            status.timecode = self.current_timecode();
            status.drift_ms = self.last_drift * 1000.0;
            status.frame_rate = self.active_format.rate.label().to_string();
            status.drop_frame = self.active_format.drop_frame;

            status.signal = format!("{:?}", self.signal.state());
            status.has_signal = self.has_signal;
            status.last_decoded = self.last_decoded.clone();
            status.level = self.last_level.unwrap_or(0.0);

            status.samples = self.history.len();
            status.jitter_ms = noise.stddev * 1000.0;
            status.noise_spikes = noise.spikes;
            status.jump_count = self.jump_count;
            status.hard_reanchor_count = self.hard_reanchor_count;
            status.indeterminate_count = self.indeterminate_count;
            status.stopped_count = self.stopped_count;
            status.updated_ts = Utc::now().timestamp().max(0) as u64;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockReferenceClock;
    use crate::timecode::{to_timecode_string, FrameRate};
    use crate::traits::MockTimecodeSource;
    use std::sync::Mutex;

    const FRAME: f64 = 1.0 / 30.0;

    fn create_controller(config: SystemConfig) -> LtcController<MockReferenceClock, MockTimecodeSource> {
        let _ = env_logger::builder().is_test(true).try_init();
        let status = Arc::new(RwLock::new(SyncStatus::default()));
        LtcController::new(MockReferenceClock::new(), MockTimecodeSource::new(), status, config)
    }

    fn tc(frames: i64) -> String {
        to_timecode_string(frames, false, 30)
    }

    /// Feed `count` consecutive 30fps frames starting at `start_frame`, one per
    /// block, ticking after each. Returns the reference time of the last frame.
    fn feed(
        ctl: &mut LtcController<MockReferenceClock, MockTimecodeSource>,
        start_frame: i64,
        start_time: f64,
        count: usize,
    ) -> f64 {
        let mut t = start_time;
        for i in 0..count {
            t = start_time + i as f64 * FRAME;
            ctl.ingest(DecodedBlock::single(t, tc(start_frame + i as i64)), t);
            ctl.tick(t);
        }
        t
    }

    fn collect_events(
        ctl: &mut LtcController<MockReferenceClock, MockTimecodeSource>,
    ) -> Arc<Mutex<Vec<SyncEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctl.subscribe(move |e: &SyncEvent| sink.lock().unwrap().push(e.clone()));
        seen
    }

    fn count_kind(events: &[SyncEvent], kind: &str) -> usize {
        events.iter().filter(|e| e.kind() == kind).count()
    }

    #[test]
    fn test_initial_state() {
        let ctl = create_controller(SystemConfig::default());
        assert_eq!(ctl.sync_state(), SyncState::NoSignal);
        assert_eq!(ctl.signal_state(), SignalState::Stopped);
        assert!(!ctl.is_running());
        assert_eq!(ctl.current_seconds(), 0.0);
        assert_eq!(ctl.current_timecode(), "00:00:00:00");
    }

    #[test]
    fn test_locks_after_three_stable_samples() {
        let mut ctl = create_controller(SystemConfig::default());
        feed(&mut ctl, 300, 1.0, 2);
        assert_eq!(ctl.sync_state(), SyncState::Syncing);
        assert!(!ctl.is_running());

        let t = feed(&mut ctl, 302, 1.0 + 2.0 * FRAME, 1);
        assert_eq!(ctl.sync_state(), SyncState::Locked);
        assert!(ctl.is_running());
        assert!((ctl.current_seconds() - 302.0 / 30.0).abs() < 1e-9);
        assert_eq!(ctl.current_timecode(), "00:00:10:02");

        // Free-runs between decodes
        ctl.tick(t + 0.5);
        assert!((ctl.current_seconds() - (302.0 / 30.0 + 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_jump_hard_reanchors() {
        let mut ctl = create_controller(SystemConfig::default());
        let t0 = 1.0;
        ctl.ingest(DecodedBlock::single(t0, "00:00:10:00"), t0);
        ctl.ingest(DecodedBlock::single(t0 + FRAME, "00:00:10:01"), t0 + FRAME);
        ctl.ingest(DecodedBlock::single(t0 + 2.0 * FRAME, "00:00:50:00"), t0 + 2.0 * FRAME);

        assert_eq!(ctl.sync_state(), SyncState::Locked);
        assert!(ctl.is_running());
        assert_eq!(ctl.current_seconds(), 50.0);
        assert_eq!(ctl.get_status_shared().read().unwrap().jump_count, 0); // status not yet ticked
        ctl.tick(t0 + 2.0 * FRAME);
        let status = ctl.get_status_shared().read().unwrap().clone();
        assert_eq!(status.jump_count, 1);
        assert_eq!(status.hard_reanchor_count, 0);
    }

    #[test]
    fn test_jump_while_locked() {
        let mut ctl = create_controller(SystemConfig::default());
        let t = feed(&mut ctl, 0, 0.0, 10);
        assert_eq!(ctl.sync_state(), SyncState::Locked);

        let t_jump = t + FRAME;
        ctl.ingest(DecodedBlock::single(t_jump, "01:00:00:00"), t_jump);
        assert_eq!(ctl.current_seconds(), 3600.0);
        assert_eq!(ctl.sync_state(), SyncState::Locked);
    }

    #[test]
    fn test_small_drift_applies_slow_rate() {
        let mut ctl = create_controller(SystemConfig::default());
        let t = feed(&mut ctl, 0, 0.0, 10);
        let before = ctl.current_seconds();

        // Next frame decodes 50ms "late" against the free-running clock:
        // inside the slow tier (30..100ms)
        let t_next = t + FRAME + 0.05;
        ctl.ingest(DecodedBlock::single(t_next, tc(10)), t_next);

        let free_run = before + FRAME + 0.05;
        let expected = 10.0 / 30.0;
        let corrected = free_run + (expected - free_run) * 0.01;
        assert!((ctl.current_seconds() - corrected).abs() < 1e-9);
        assert!((ctl.last_drift() - (expected - free_run)).abs() < 1e-9);
        assert_eq!(ctl.sync_state(), SyncState::Locked);
    }

    #[test]
    fn test_medium_drift_reports_drifting() {
        let mut config = SystemConfig::default();
        // Let a 150ms step through the stability check
        config.analyzer.sync_threshold = 0.2;
        let mut ctl = create_controller(config);
        let t = feed(&mut ctl, 0, 0.0, 10);

        let t_next = t + FRAME + 0.15;
        ctl.ingest(DecodedBlock::single(t_next, tc(10)), t_next);
        assert_eq!(ctl.sync_state(), SyncState::Drifting);

        // Back in step: drift now under 100ms, state returns to Locked
        let mut t = t_next;
        for frame in 11..20 {
            t += FRAME;
            ctl.ingest(DecodedBlock::single(t, tc(frame)), t);
        }
        assert_eq!(ctl.sync_state(), SyncState::Locked);
    }

    #[test]
    fn test_indeterminate_keeps_state() {
        let mut ctl = create_controller(SystemConfig::default());
        let t = feed(&mut ctl, 0, 0.0, 10);
        let before = ctl.current_seconds();

        // 0.5s off: neither a jump (>1s) nor stable (<0.1s)
        let t_next = t + FRAME;
        ctl.ingest(DecodedBlock::single(t_next, tc(10 + 15)), t_next);
        ctl.tick(t_next);

        assert_eq!(ctl.sync_state(), SyncState::Locked);
        assert!((ctl.current_seconds() - (before + FRAME)).abs() < 1e-9);
        assert_eq!(ctl.get_status_shared().read().unwrap().indeterminate_count, 1);
    }

    #[test]
    fn test_frozen_timecode_is_counted_not_acted_on() {
        let mut ctl = create_controller(SystemConfig::default());
        let t = feed(&mut ctl, 0, 0.0, 10);
        let mut t = t;
        for _ in 0..5 {
            t += FRAME;
            ctl.ingest(DecodedBlock::single(t, tc(9)), t);
            ctl.tick(t);
        }
        let status = ctl.get_status_shared().read().unwrap().clone();
        assert!(status.stopped_count >= 1);
        assert!(ctl.is_running());
    }

    #[test]
    fn test_invalid_and_malformed_ignored() {
        let mut ctl = create_controller(SystemConfig::default());
        let block = DecodedBlock::new(1.0, vec![
            Decoded::invalid("00:00:01:00"),
            Decoded::valid("garbage"),
            Decoded::valid("00:00:01:45"),
        ]);
        ctl.ingest(block, 1.0);
        ctl.tick(1.0);
        assert_eq!(ctl.sample_count(), 0);
        assert!(!ctl.has_signal());
        assert_eq!(ctl.last_decoded(), None);
        assert_eq!(ctl.sync_state(), SyncState::NoSignal);
    }

    #[test]
    fn test_decode_timeout_and_recovery() {
        let mut ctl = create_controller(SystemConfig::default());
        let events = collect_events(&mut ctl);

        let t = feed(&mut ctl, 0, 0.0, 15);
        assert_eq!(ctl.signal_state(), SignalState::Running);

        // Within timeout: still fine
        assert_eq!(ctl.tick(t + 0.4), None);
        assert!(ctl.is_running());

        // Past timeout: NoSignal, clock zeroed, stopping
        assert_eq!(ctl.tick(t + 0.6), None);
        assert_eq!(ctl.sync_state(), SyncState::NoSignal);
        assert!(!ctl.is_running());
        assert_eq!(ctl.current_seconds(), 0.0);
        assert_eq!(ctl.sample_count(), 0);
        assert_eq!(ctl.signal_state(), SignalState::Stopping);

        assert_eq!(ctl.tick(t + 1.2), Some(SignalTransition::Stopped));
        assert_eq!(ctl.signal_state(), SignalState::Stopped);

        // Signal returns
        let resume = t + 5.0;
        feed(&mut ctl, 900, resume, 10);
        assert_eq!(ctl.sync_state(), SyncState::Locked);
        assert!(ctl.is_running());
        assert!((ctl.current_seconds() - 909.0 / 30.0).abs() < 1e-6);

        let events = events.lock().unwrap();
        assert_eq!(count_kind(&events, "Started"), 2);
        assert_eq!(count_kind(&events, "Stopped"), 1);
    }

    #[test]
    fn test_events_dispatched() {
        let mut ctl = create_controller(SystemConfig::default());
        ctl.add_event(TimecodeEvent::new("cue", "00:00:00:15"));
        let events = collect_events(&mut ctl);

        ctl.tick(0.0 - FRAME);
        feed(&mut ctl, 0, 0.0, 30);

        let events = events.lock().unwrap();
        assert_eq!(count_kind(&events, "Started"), 1);
        assert_eq!(count_kind(&events, "TimecodeUpdated"), 30);
        assert!(count_kind(&events, "Receiving") > 20);
        assert_eq!(count_kind(&events, "NoSignalTick"), 1);
        assert_eq!(count_kind(&events, "Stopped"), 0);

        let reached: Vec<&SyncEvent> = events.iter()
            .filter(|e| matches!(e, SyncEvent::TimecodeReached { .. }))
            .collect();
        assert_eq!(reached.len(), 1);
        if let SyncEvent::TimecodeReached { name, payload } = reached[0] {
            assert_eq!(name, "cue");
            assert_eq!(payload.timecode, "00:00:00:15");
            assert_eq!(payload.absolute_frame, 15);
            assert_eq!(payload.fps, 30.0);
            assert!(!payload.drop_frame);
        }

        if let Some(SyncEvent::Started(payload)) = events.iter().find(|e| e.kind() == "Started") {
            // Started fires once the start hysteresis (0.1s = 3 frames) has elapsed
            assert!((3..=4).contains(&payload.absolute_frame));
        } else {
            panic!("no Started event");
        }
    }

    #[test]
    fn test_stopped_rearms_events() {
        let mut ctl = create_controller(SystemConfig::default());
        ctl.add_event(TimecodeEvent::new("cue", "00:00:00:15"));
        let t = feed(&mut ctl, 0, 0.0, 30);
        assert!(ctl.events().get("cue").unwrap().is_triggered());

        ctl.tick(t + 0.6);
        ctl.tick(t + 1.2);
        assert_eq!(ctl.signal_state(), SignalState::Stopped);
        assert!(!ctl.events().get("cue").unwrap().is_triggered());
    }

    #[test]
    fn test_level_changes_debounced() {
        let mut ctl = create_controller(SystemConfig::default());
        let events = collect_events(&mut ctl);
        for level in [0.5f32, 0.505, 0.6, 0.6] {
            let mut block = DecodedBlock::new(1.0, Vec::new());
            block.level = Some(level);
            ctl.ingest(block, 1.0);
        }
        let events = events.lock().unwrap();
        let levels: Vec<f32> = events.iter().filter_map(|e| match e {
            SyncEvent::SignalLevelChanged { level } => Some(*level),
            _ => None,
        }).collect();
        assert_eq!(levels, vec![0.5, 0.6]);
    }

    #[test]
    fn test_decoder_drop_frame_flag_overrides() {
        let mut config = SystemConfig::default();
        config.timecode.frame_rate = FrameRate::Fps2997Ndf;
        let mut ctl = create_controller(config);
        assert!(!ctl.format().drop_frame);

        let block = DecodedBlock::new(1.0, vec![Decoded {
            timecode: "00:01:00;02".to_string(),
            valid: true,
            drop_frame: Some(true),
        }]);
        ctl.ingest(block, 1.0);
        assert!(ctl.format().drop_frame);
        assert_eq!(ctl.last_decoded(), Some("00:01:00:02"));
        assert_eq!(ctl.sample_count(), 1);
    }

    #[test]
    fn test_set_config_clears_history_on_rate_change() {
        let mut ctl = create_controller(SystemConfig::default());
        feed(&mut ctl, 0, 0.0, 5);
        assert_eq!(ctl.sample_count(), 5);

        let mut config = SystemConfig::default();
        config.analyzer.buffer_capacity = 2;
        ctl.set_config(config.clone());
        assert_eq!(ctl.config().analyzer.buffer_capacity, 5);
        assert_eq!(ctl.sample_count(), 5);

        config.timecode.frame_rate = FrameRate::Fps25;
        ctl.set_config(config);
        assert_eq!(ctl.sample_count(), 0);
        assert_eq!(ctl.format().rate, FrameRate::Fps25);
    }

    #[test]
    fn test_process_loop_iteration_drains_source() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut clock = MockReferenceClock::new();
        clock.expect_now().return_const(2.0);

        let mut source = MockTimecodeSource::new();
        let mut seq = mockall::Sequence::new();
        source.expect_poll()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| Ok(Some(DecodedBlock::single(1.99, "01:00:00:00"))));
        source.expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(None));

        let status = Arc::new(RwLock::new(SyncStatus::default()));
        let mut ctl = LtcController::new(clock, source, status.clone(), SystemConfig::default());
        let transition = ctl.process_loop_iteration().unwrap();

        assert_eq!(transition, None);
        assert!(ctl.has_signal());
        assert_eq!(ctl.sample_count(), 2);
        assert_eq!(ctl.signal_state(), SignalState::Starting);
        assert_eq!(status.read().unwrap().last_decoded.as_deref(), Some("01:00:00:00"));
    }

    #[test]
    fn test_source_error_propagates() {
        let mut clock = MockReferenceClock::new();
        clock.expect_now().return_const(0.0);
        let mut source = MockTimecodeSource::new();
        source.expect_poll().returning(|| Err(anyhow::anyhow!("device unplugged")));

        let status = Arc::new(RwLock::new(SyncStatus::default()));
        let mut ctl = LtcController::new(clock, source, status, SystemConfig::default());
        assert!(ctl.process_loop_iteration().is_err());
    }

    #[test]
    fn test_stop_capture_drains_and_stops_clock() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut source = MockTimecodeSource::new();
        source.expect_stop().times(1).returning(|| Ok(()));
        let mut seq = mockall::Sequence::new();
        source.expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Some(DecodedBlock::single(0.5, "00:00:00:15"))));
        source.expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(None));

        let status = Arc::new(RwLock::new(SyncStatus::default()));
        let mut ctl = LtcController::new(MockReferenceClock::new(), source, status, SystemConfig::default());
        feed(&mut ctl, 0, 0.0, 10);
        assert!(ctl.is_running());

        ctl.stop_capture();
        assert!(!ctl.is_running());
        assert!(!ctl.has_signal());
        assert_eq!(ctl.sync_state(), SyncState::NoSignal);
        assert_eq!(ctl.current_seconds(), 0.0);
    }

    #[test]
    fn test_status_reflects_lock() {
        let mut ctl = create_controller(SystemConfig::default());
        feed(&mut ctl, 0, 0.0, 20);
        ctl.log_status();
        let status = ctl.get_status_shared().read().unwrap().clone();
        assert!(status.is_locked());
        assert!(status.running);
        assert_eq!(status.signal, "Running");
        assert_eq!(status.frame_rate, "30");
        assert_eq!(status.samples, 15);
        assert!(status.jitter_ms < 1e-6);
        assert!(status.updated_ts > 0);
    }
}
