use anyhow::Result;

/// One demodulator result
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub timecode: String,
    pub valid: bool,
    /// Drop-frame bit as decoded from the LTC frame, when the demodulator reports it
    pub drop_frame: Option<bool>,
}

impl Decoded {
    pub fn valid(timecode: impl Into<String>) -> Self {
        Decoded {
            timecode: timecode.into(),
            valid: true,
            drop_frame: None,
        }
    }

    pub fn invalid(timecode: impl Into<String>) -> Self {
        Decoded {
            timecode: timecode.into(),
            valid: false,
            drop_frame: None,
        }
    }
}

/// Everything decoded from one captured audio block
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedBlock {
    /// Reference-clock time the block was captured at, seconds
    pub capture_time: f64,
    pub results: Vec<Decoded>,
    /// Linear peak level of the block (0.0..=1.0), if the capture side measures it
    pub level: Option<f32>,
}

impl DecodedBlock {
    pub fn new(capture_time: f64, results: Vec<Decoded>) -> Self {
        DecodedBlock {
            capture_time,
            results,
            level: None,
        }
    }

    pub fn single(capture_time: f64, timecode: impl Into<String>) -> Self {
        Self::new(capture_time, vec![Decoded::valid(timecode)])
    }
}

/// Audio capture + LTC demodulator
#[cfg_attr(test, mockall::automock)]
pub trait TimecodeSource {
    /// Next decoded block. Returns Ok(None) when nothing is pending (never blocks).
    fn poll(&mut self) -> Result<Option<DecodedBlock>>;

    /// Stop capturing and drop anything still queued. Default impl does nothing.
    fn stop(&mut self) -> Result<()> { Ok(()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

/// External timeline driven by the downstream synchronizer
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackTarget {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    /// Current playback position, seconds
    fn position(&self) -> f64;
    fn set_position(&mut self, seconds: f64) -> Result<()>;
    fn state(&self) -> PlaybackState;
}
