use serde::{Deserialize, Serialize};

/// Engine status snapshot, shared with the host through `Arc<RwLock<_>>`
///
/// Contains everything a monitor needs to:
/// - Display sync state (no signal, syncing, locked, drifting)
/// - Show the chased timecode and the last decoded one
/// - Judge signal quality (jitter, spikes, classifier counters)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncStatus {
    // ========================================================================
    // Clock
    // ========================================================================
    /// Sync state: "NO-SIGNAL", "SYNC", "LOCK" or "DRIFT"
    pub mode: String,

    /// True while the virtual clock is running
    pub running: bool,

    /// Virtual clock position as `HH:MM:SS:FF`
    pub timecode: String,

    /// Virtual clock position in seconds
    pub current_seconds: f64,

    /// Last drift measured by the servo (milliseconds, expected - clock)
    pub drift_ms: f64,

    /// Frame rate label, e.g. "29.97df"
    pub frame_rate: String,

    /// Effective drop-frame flag
    pub drop_frame: bool,

    // ========================================================================
    // Signal
    // ========================================================================
    /// Debounced signal state: "Stopped", "Starting", "Running", "Stopping"
    pub signal: String,

    /// Raw (undebounced) signal presence
    pub has_signal: bool,

    /// Most recent valid decode
    pub last_decoded: Option<String>,

    /// Last reported input level (0.0..=1.0)
    pub level: f32,

    // ========================================================================
    // Diagnostics
    // ========================================================================
    /// Samples in the analyzer window
    pub samples: usize,

    /// Standard deviation of per-pair timing error over the ring buffer (ms)
    pub jitter_ms: f64,

    /// Spikes in the ring buffer
    pub noise_spikes: usize,

    /// Classifier counters. `indeterminate` and `stopped` leave state untouched,
    /// so they are tracked here to keep them visible.
    pub jump_count: u64,
    pub hard_reanchor_count: u64,
    pub indeterminate_count: u64,
    pub stopped_count: u64,

    /// Unix timestamp of last status update
    pub updated_ts: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            mode: "NO-SIGNAL".to_string(),
            running: false,
            timecode: "00:00:00:00".to_string(),
            current_seconds: 0.0,
            drift_ms: 0.0,
            frame_rate: String::new(),
            drop_frame: false,

            signal: "Stopped".to_string(),
            has_signal: false,
            last_decoded: None,
            level: 0.0,

            samples: 0,
            jitter_ms: 0.0,
            noise_spikes: 0,
            jump_count: 0,
            hard_reanchor_count: 0,
            indeterminate_count: 0,
            stopped_count: 0,
            updated_ts: 0,
        }
    }
}

impl SyncStatus {
    pub fn is_locked(&self) -> bool {
        self.mode == "LOCK"
    }

    /// One-line summary for periodic logging
    pub fn summary(&self) -> String {
        format!(
            "{:9} {} drift:{:+.1}ms jitter:{:.2}ms signal:{} samples:{}",
            self.mode, self.timecode, self.drift_ms, self.jitter_ms, self.signal, self.samples
        )
    }
}
