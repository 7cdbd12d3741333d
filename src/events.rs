//! Signal presence state machine and timecode events
//!
//! ## Signal presence
//! `Stopped → Starting → Running → Stopping → Stopped`, debounced in both
//! directions:
//! - Starting must see the signal for `start_hysteresis` before `Started` fires
//! - Stopping must see silence for `stop_hysteresis` before `Stopped` fires
//!
//! A signal flickering faster than the hysteresis never fires either event;
//! a sustained transition fires exactly one.
//!
//! ## Timecode events
//! Named targets ("fire at 01:00:00:00"). An event fires once the position has
//! reached its target, within `tolerance_frames` after it. One-shot events
//! re-arm on a rewind past their target or when the signal stops.
//!
//! ## Dispatch
//! All notifications go through one observer list, [`EventDispatcher`].

use log::{debug, info};
use serde::Serialize;
use std::fmt;
use crate::config::SignalConfig;
use crate::timecode::TimecodeFormat;

/// A checked position this far behind the previous one counts as a rewind
pub const REWIND_THRESHOLD: f64 = 1.0;

/// Float slack on the reached-target comparison, seconds
const MATCH_EPSILON: f64 = 1e-6;

/// Narrowest usable window. The engine ticks every few ms, so a zero-frame
/// window would almost never contain a checked position.
pub const MIN_TOLERANCE_FRAMES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalTransition {
    Started,
    Stopped,
}

#[derive(Debug)]
pub struct SignalStateMachine {
    state: SignalState,
    entered_at: f64,
    start_hysteresis: f64,
    stop_hysteresis: f64,
}

impl SignalStateMachine {
    pub fn new(config: &SignalConfig) -> Self {
        SignalStateMachine {
            state: SignalState::Stopped,
            entered_at: 0.0,
            start_hysteresis: config.start_hysteresis,
            stop_hysteresis: config.stop_hysteresis,
        }
    }

    pub fn state(&self) -> SignalState {
        self.state
    }

    /// Seconds spent in the current state
    pub fn time_in_state(&self, now: f64) -> f64 {
        now - self.entered_at
    }

    pub fn set_hysteresis(&mut self, config: &SignalConfig) {
        self.start_hysteresis = config.start_hysteresis;
        self.stop_hysteresis = config.stop_hysteresis;
    }

    /// Feed one observation. Returns a transition only when one fires.
    pub fn update(&mut self, signal_present: bool, now: f64) -> Option<SignalTransition> {
        let elapsed = now - self.entered_at;
        match (self.state, signal_present) {
            (SignalState::Stopped, true) => {
                self.enter(SignalState::Starting, now);
                None
            }
            (SignalState::Starting, true) if elapsed >= self.start_hysteresis => {
                self.enter(SignalState::Running, now);
                Some(SignalTransition::Started)
            }
            (SignalState::Starting, false) => {
                self.enter(SignalState::Stopped, now);
                None
            }
            (SignalState::Running, false) => {
                self.enter(SignalState::Stopping, now);
                None
            }
            (SignalState::Stopping, true) => {
                self.enter(SignalState::Running, now);
                None
            }
            (SignalState::Stopping, false) if elapsed >= self.stop_hysteresis => {
                self.enter(SignalState::Stopped, now);
                Some(SignalTransition::Stopped)
            }
            _ => None,
        }
    }

    /// Push "signal absent" right away, outside the regular polling
    pub fn force_absent(&mut self, now: f64) -> Option<SignalTransition> {
        self.update(false, now)
    }

    fn enter(&mut self, state: SignalState, now: f64) {
        debug!("[Signal] {:?} -> {:?}", self.state, state);
        self.state = state;
        self.entered_at = now;
    }
}

// ============================================================================
// TIMECODE EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimecodeEvent {
    pub name: String,
    pub target_timecode: String,
    pub tolerance_frames: u32,
    pub one_shot: bool,
    pub enabled: bool,
    triggered: bool,
}

impl TimecodeEvent {
    /// One-shot, enabled, tolerance of 2 frames
    pub fn new(name: impl Into<String>, target_timecode: impl Into<String>) -> Self {
        TimecodeEvent {
            name: name.into(),
            target_timecode: target_timecode.into(),
            tolerance_frames: 2,
            one_shot: true,
            enabled: true,
            triggered: false,
        }
    }

    /// Clamped to at least `MIN_TOLERANCE_FRAMES`
    pub fn with_tolerance(mut self, frames: u32) -> Self {
        self.tolerance_frames = frames.max(MIN_TOLERANCE_FRAMES);
        self
    }

    /// Fires on every check inside its window instead of once
    pub fn repeating(mut self) -> Self {
        self.one_shot = false;
        self
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }
}

#[derive(Debug, Default)]
pub struct TimecodeEventSet {
    events: Vec<TimecodeEvent>,
    last_checked: Option<f64>,
}

impl TimecodeEventSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an existing event with the same name
    pub fn add(&mut self, event: TimecodeEvent) {
        self.events.retain(|e| e.name != event.name);
        info!("[Event] Registered '{}' at {} (±{} frames{})", event.name, event.target_timecode,
            event.tolerance_frames, if event.one_shot { ", one-shot" } else { "" });
        self.events.push(event);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.events.len();
        self.events.retain(|e| e.name != name);
        self.events.len() != before
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.events.iter_mut().find(|e| e.name == name) {
            Some(event) => {
                event.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&TimecodeEvent> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimecodeEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Check the position against every enabled event, returning the names
    /// that fired. Handles rewind detection first.
    pub fn check(&mut self, current_seconds: f64, format: &TimecodeFormat) -> Vec<String> {
        if let Some(prev) = self.last_checked {
            if current_seconds < prev - REWIND_THRESHOLD {
                self.reset_after(current_seconds, format);
            }
        }
        self.last_checked = Some(current_seconds);

        let fps = format.actual_fps();
        let mut fired = Vec::new();
        for event in self.events.iter_mut().filter(|e| e.enabled) {
            if event.one_shot && event.triggered {
                continue;
            }
            let target = match format.to_seconds(&event.target_timecode) {
                Some(t) => t,
                None => {
                    debug!("[Event] '{}' has invalid target {}", event.name, event.target_timecode);
                    continue;
                }
            };
            let window = event.tolerance_frames.max(MIN_TOLERANCE_FRAMES) as f64 / fps;
            let delta = current_seconds - target;
            if delta >= -MATCH_EPSILON && delta <= window + MATCH_EPSILON {
                if event.one_shot {
                    event.triggered = true;
                }
                info!("[Event] '{}' reached at {:.3}s", event.name, current_seconds);
                fired.push(event.name.clone());
            }
        }
        fired
    }

    /// Re-arm triggered one-shot events whose target lies after `current_seconds`
    fn reset_after(&mut self, current_seconds: f64, format: &TimecodeFormat) {
        for event in self.events.iter_mut().filter(|e| e.one_shot && e.triggered) {
            if let Some(target) = format.to_seconds(&event.target_timecode) {
                if target > current_seconds {
                    debug!("[Event] Rewind re-arms '{}'", event.name);
                    event.triggered = false;
                }
            }
        }
    }

    /// Re-arm everything and forget the last checked position
    pub fn reset_all(&mut self) {
        for event in self.events.iter_mut() {
            event.triggered = false;
        }
        self.last_checked = None;
    }
}

// ============================================================================
// EVENT PAYLOADS AND DISPATCH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimecodePayload {
    pub timecode: String,
    pub reference_clock: f64,
    pub absolute_frame: i64,
    pub drop_frame: bool,
    pub fps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum SyncEvent {
    Started(TimecodePayload),
    Stopped(TimecodePayload),
    Receiving(TimecodePayload),
    NoSignalTick(TimecodePayload),
    TimecodeUpdated(TimecodePayload),
    SignalLevelChanged { level: f32 },
    TimecodeReached { name: String, payload: TimecodePayload },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Started(_) => "Started",
            SyncEvent::Stopped(_) => "Stopped",
            SyncEvent::Receiving(_) => "Receiving",
            SyncEvent::NoSignalTick(_) => "NoSignalTick",
            SyncEvent::TimecodeUpdated(_) => "TimecodeUpdated",
            SyncEvent::SignalLevelChanged { .. } => "SignalLevelChanged",
            SyncEvent::TimecodeReached { .. } => "TimecodeReached",
        }
    }
}

pub type EventHandler = Box<dyn FnMut(&SyncEvent) + Send>;

/// Single observer list; every handler sees every event once
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<EventHandler>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn dispatch(&mut self, event: &SyncEvent) {
        for handler in self.handlers.iter_mut() {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timecode::FrameRate;
    use std::sync::{Arc, Mutex};

    fn machine() -> SignalStateMachine {
        SignalStateMachine::new(&SignalConfig::default())
    }

    fn fps30() -> TimecodeFormat {
        TimecodeFormat::from_rate(FrameRate::Fps30)
    }

    fn seconds(tc: &str) -> f64 {
        fps30().to_seconds(tc).unwrap()
    }

    #[test]
    fn test_sustained_signal_fires_one_started() {
        let mut sm = machine();
        let mut started = 0;
        for i in 0..100 {
            if sm.update(true, i as f64 * 0.01) == Some(SignalTransition::Started) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(sm.state(), SignalState::Running);
    }

    #[test]
    fn test_started_waits_for_hysteresis() {
        let mut sm = machine();
        assert_eq!(sm.update(true, 0.0), None);
        assert_eq!(sm.state(), SignalState::Starting);
        assert_eq!(sm.update(true, 0.05), None);
        assert_eq!(sm.update(true, 0.1), Some(SignalTransition::Started));
    }

    #[test]
    fn test_flicker_fires_nothing() {
        let mut sm = machine();
        let mut transitions = Vec::new();
        // Toggle every 40ms: shorter than both hysteresis windows
        for i in 0..200 {
            let present = (i / 4) % 2 == 0;
            if let Some(t) = sm.update(present, i as f64 * 0.01) {
                transitions.push(t);
            }
        }
        assert!(transitions.is_empty(), "got {:?}", transitions);
    }

    #[test]
    fn test_dropout_shorter_than_stop_hysteresis_is_ignored() {
        let mut sm = machine();
        let mut transitions = Vec::new();
        let mut t = 0.0;
        let mut feed = |sm: &mut SignalStateMachine, present: bool, secs: f64| {
            let steps = (secs / 0.01) as usize;
            for _ in 0..steps {
                t += 0.01;
                if let Some(tr) = sm.update(present, t) {
                    transitions.push(tr);
                }
            }
        };
        feed(&mut sm, true, 1.0);
        feed(&mut sm, false, 0.3);
        feed(&mut sm, true, 1.0);
        feed(&mut sm, false, 0.3);
        feed(&mut sm, true, 1.0);
        assert_eq!(transitions, vec![SignalTransition::Started]);
        assert_eq!(sm.state(), SignalState::Running);
    }

    #[test]
    fn test_sustained_loss_fires_one_stopped() {
        let mut sm = machine();
        for i in 0..50 {
            sm.update(true, i as f64 * 0.01);
        }
        let mut stopped = 0;
        for i in 50..300 {
            if sm.update(false, i as f64 * 0.01) == Some(SignalTransition::Stopped) {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
        assert_eq!(sm.state(), SignalState::Stopped);
    }

    #[test]
    fn test_starting_aborts_silently() {
        let mut sm = machine();
        sm.update(true, 0.0);
        assert_eq!(sm.update(false, 0.05), None);
        assert_eq!(sm.state(), SignalState::Stopped);
    }

    #[test]
    fn test_force_absent_enters_stopping() {
        let mut sm = machine();
        sm.update(true, 0.0);
        sm.update(true, 0.2);
        assert_eq!(sm.state(), SignalState::Running);
        assert_eq!(sm.force_absent(0.3), None);
        assert_eq!(sm.state(), SignalState::Stopping);
        assert_eq!(sm.force_absent(0.8), Some(SignalTransition::Stopped));
    }

    #[test]
    fn test_one_shot_fires_once_when_reached() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("10s", "00:00:10:00").with_tolerance(2));
        let fmt = fps30();

        let mut fired_at = Vec::new();
        for tc in ["00:00:09:29", "00:00:10:00", "00:00:10:01", "00:00:15:00"] {
            if !set.check(seconds(tc), &fmt).is_empty() {
                fired_at.push(tc);
            }
        }
        assert_eq!(fired_at, vec!["00:00:10:00"]);
        assert!(set.get("10s").unwrap().is_triggered());
    }

    #[test]
    fn test_fires_inside_tolerance_after_target() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("late", "00:00:10:00").with_tolerance(2));
        let fmt = fps30();
        assert!(set.check(seconds("00:00:09:28"), &fmt).is_empty());
        // Skipped 10:00 and 10:01 entirely
        assert_eq!(set.check(seconds("00:00:10:02"), &fmt), vec!["late".to_string()]);
    }

    #[test]
    fn test_zero_tolerance_widened_to_one_frame() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("exact", "00:00:10:00").with_tolerance(0));
        assert_eq!(set.get("exact").unwrap().tolerance_frames, MIN_TOLERANCE_FRAMES);

        // A 5ms tick past the target still lands in the window
        let fmt = fps30();
        assert!(set.check(seconds("00:00:09:29"), &fmt).is_empty());
        assert_eq!(set.check(seconds("00:00:10:00") + 0.005, &fmt), vec!["exact".to_string()]);
    }

    #[test]
    fn test_missed_window_does_not_fire() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("late", "00:00:10:00").with_tolerance(2));
        let fmt = fps30();
        assert!(set.check(seconds("00:00:09:00"), &fmt).is_empty());
        assert!(set.check(seconds("00:00:10:03"), &fmt).is_empty());
    }

    #[test]
    fn test_rewind_rearms_one_shot() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("30s", "00:00:30:00"));
        let fmt = fps30();

        assert_eq!(set.check(seconds("00:00:30:00"), &fmt).len(), 1);
        assert!(set.check(seconds("00:00:30:01"), &fmt).is_empty());

        assert!(set.check(seconds("00:00:05:00"), &fmt).is_empty());
        assert!(!set.get("30s").unwrap().is_triggered());

        assert_eq!(set.check(seconds("00:00:30:00"), &fmt), vec!["30s".to_string()]);
    }

    #[test]
    fn test_small_step_back_is_not_a_rewind() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("30s", "00:00:30:00"));
        let fmt = fps30();
        set.check(seconds("00:00:30:00"), &fmt);
        set.check(seconds("00:00:29:20"), &fmt);
        assert!(set.get("30s").unwrap().is_triggered());
    }

    #[test]
    fn test_rewind_keeps_events_before_position() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("early", "00:00:02:00"));
        set.add(TimecodeEvent::new("late", "00:00:30:00"));
        let fmt = fps30();
        set.check(seconds("00:00:02:00"), &fmt);
        set.check(seconds("00:00:30:00"), &fmt);
        set.check(seconds("00:00:10:00"), &fmt);
        assert!(set.get("early").unwrap().is_triggered());
        assert!(!set.get("late").unwrap().is_triggered());
    }

    #[test]
    fn test_repeating_and_disabled_events() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("rep", "00:00:01:00").with_tolerance(3).repeating());
        set.add(TimecodeEvent::new("off", "00:00:01:00"));
        assert!(set.set_enabled("off", false));
        let fmt = fps30();

        assert_eq!(set.check(seconds("00:00:01:00"), &fmt), vec!["rep".to_string()]);
        assert_eq!(set.check(seconds("00:00:01:01"), &fmt), vec!["rep".to_string()]);
        assert!(!set.get("off").unwrap().is_triggered());
    }

    #[test]
    fn test_reset_all_and_remove() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("a", "00:00:01:00"));
        let fmt = fps30();
        set.check(seconds("00:00:01:00"), &fmt);
        set.reset_all();
        assert!(!set.get("a").unwrap().is_triggered());
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_add_replaces_same_name() {
        let mut set = TimecodeEventSet::new();
        set.add(TimecodeEvent::new("cue", "00:00:01:00"));
        set.add(TimecodeEvent::new("cue", "00:00:02:00"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("cue").unwrap().target_timecode, "00:00:02:00");
    }

    #[test]
    fn test_dispatcher_calls_every_handler_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        for id in 0..2 {
            let seen = seen.clone();
            dispatcher.subscribe(move |e: &SyncEvent| seen.lock().unwrap().push((id, e.kind())));
        }
        dispatcher.dispatch(&SyncEvent::SignalLevelChanged { level: 0.5 });
        assert_eq!(*seen.lock().unwrap(), vec![(0, "SignalLevelChanged"), (1, "SignalLevelChanged")]);
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_string(&SyncEvent::SignalLevelChanged { level: 0.25 }).unwrap();
        assert_eq!(json, r#"{"event":"SignalLevelChanged","level":0.25}"#);
    }
}
