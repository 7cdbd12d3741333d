use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use crate::timecode::{FrameRate, TimecodeFormat};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub timecode: TimecodeConfig,
    pub analyzer: AnalyzerConfig,
    pub drift: DriftConfig,
    pub signal: SignalConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimecodeConfig {
    pub frame_rate: FrameRate,
    pub drop_frame: bool,            // only honoured on 30-base rates
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub buffer_capacity: usize,      // short FIFO, 5..=30
    pub stop_threshold: f64,         // seconds; pair counts as frozen below this
    pub jump_threshold: f64,         // seconds; newest pair above this is a jump
    pub sync_threshold: f64,         // seconds; |Δtc - Δref| must stay below this to be stable
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub deadzone_small: f64,         // no correction at or below
    pub deadzone_medium: f64,        // slow_rate up to here
    pub threshold_large: f64,        // normal_rate up to here, hard reanchor above
    pub slow_rate: f64,
    pub normal_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub start_hysteresis: f64,       // seconds of signal before Started
    pub stop_hysteresis: f64,        // seconds of silence before Stopped
    pub decode_timeout: f64,         // seconds without a valid decode before NoSignal
}

/// How the playback target is driven between hard resyncs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimingMode {
    /// Target plays on its own clock; only hard resyncs
    #[default]
    EventDriven,
    /// Target position is driven every tick; sub-frame differences get nudged
    Continuous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub sync_threshold: f64,              // seconds of allowed position error
    pub continuous_observation_time: f64, // error must persist this long before a resync
    pub timeline_offset: f64,             // added to the clock before positioning
    pub gated_start: bool,
    pub gate_interval: f64,
    pub snap_to_fps: bool,
    pub playback_fps: f64,
    pub timing_mode: TimingMode,
}

impl Default for TimecodeConfig {
    fn default() -> Self {
        let frame_rate = FrameRate::default();
        TimecodeConfig {
            frame_rate,
            drop_frame: frame_rate.is_drop_frame(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            buffer_capacity: 15,
            stop_threshold: 0.001,
            jump_threshold: 1.0,
            sync_threshold: 0.1,
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig {
            deadzone_small: 0.03,  // ~1 frame at 30fps
            deadzone_medium: 0.1,
            threshold_large: 0.3,
            slow_rate: 0.01,
            normal_rate: 0.1,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            start_hysteresis: 0.1,
            stop_hysteresis: 0.5,
            decode_timeout: 0.5,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            sync_threshold: 0.1,
            continuous_observation_time: 0.5,
            timeline_offset: 0.0,
            gated_start: false,
            gate_interval: 0.5,
            snap_to_fps: false,
            playback_fps: 30.0,
            timing_mode: TimingMode::EventDriven,
        }
    }
}

/// Clamp finite values, replace NaN/inf with the default
fn clamp_or(value: f64, min: f64, max: f64, default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        default
    }
}

impl SystemConfig {
    /// Clamp every field into its valid range. Never fails.
    pub fn sanitize(&mut self) {
        let tc = &mut self.timecode;
        tc.drop_frame = tc.drop_frame && tc.frame_rate.supports_drop_frame();

        let d = AnalyzerConfig::default();
        let a = &mut self.analyzer;
        a.buffer_capacity = a.buffer_capacity.clamp(5, 30);
        a.stop_threshold = clamp_or(a.stop_threshold, 1e-6, 0.1, d.stop_threshold);
        a.jump_threshold = clamp_or(a.jump_threshold, 0.1, 3600.0, d.jump_threshold);
        a.sync_threshold = clamp_or(a.sync_threshold, 0.001, 1.0, d.sync_threshold);

        // Deadzones must stay ordered: small <= medium <= large
        let d = DriftConfig::default();
        let dr = &mut self.drift;
        dr.deadzone_small = clamp_or(dr.deadzone_small, 0.0, 1.0, d.deadzone_small);
        dr.deadzone_medium = clamp_or(dr.deadzone_medium, dr.deadzone_small, 5.0, d.deadzone_medium.max(dr.deadzone_small));
        dr.threshold_large = clamp_or(dr.threshold_large, dr.deadzone_medium, 60.0, d.threshold_large.max(dr.deadzone_medium));
        dr.slow_rate = clamp_or(dr.slow_rate, 0.0001, 1.0, d.slow_rate);
        dr.normal_rate = clamp_or(dr.normal_rate, dr.slow_rate, 1.0, d.normal_rate.max(dr.slow_rate));

        let d = SignalConfig::default();
        let s = &mut self.signal;
        s.start_hysteresis = clamp_or(s.start_hysteresis, 0.0, 10.0, d.start_hysteresis);
        s.stop_hysteresis = clamp_or(s.stop_hysteresis, 0.0, 10.0, d.stop_hysteresis);
        s.decode_timeout = clamp_or(s.decode_timeout, 0.05, 60.0, d.decode_timeout);

        let d = PlaybackConfig::default();
        let p = &mut self.playback;
        p.sync_threshold = clamp_or(p.sync_threshold, 0.001, 10.0, d.sync_threshold);
        p.continuous_observation_time = clamp_or(p.continuous_observation_time, 0.0, 10.0, d.continuous_observation_time);
        p.timeline_offset = clamp_or(p.timeline_offset, -86_400.0, 86_400.0, d.timeline_offset);
        p.gate_interval = clamp_or(p.gate_interval, 0.01, 60.0, d.gate_interval);
        p.playback_fps = clamp_or(p.playback_fps, 1.0, 240.0, d.playback_fps);
    }

    pub fn sanitized(mut self) -> Self {
        self.sanitize();
        self
    }

    pub fn timecode_format(&self) -> TimecodeFormat {
        TimecodeFormat::new(self.timecode.frame_rate, self.timecode.drop_frame)
    }

    /// Read a JSON config. Missing sections take defaults; values are clamped.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

/// Device-level settings remembered between runs. Saved and loaded explicitly
/// by the host at its own lifecycle points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSettings {
    pub device_name: Option<String>,
    pub frame_rate: FrameRate,
    pub sample_rate: u32,
    pub drop_frame: bool,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        PersistedSettings {
            device_name: None,
            frame_rate: FrameRate::default(),
            sample_rate: 48_000,
            drop_frame: FrameRate::default().is_drop_frame(),
        }
    }
}

impl PersistedSettings {
    /// Missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(PersistedSettings::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Copy the timecode part into a runtime config
    pub fn apply_to(&self, config: &mut SystemConfig) {
        config.timecode.frame_rate = self.frame_rate;
        config.timecode.drop_frame = self.drop_frame;
        config.sanitize();
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}
