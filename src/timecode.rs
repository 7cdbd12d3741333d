//! SMPTE Timecode Codec
//!
//! Converts between `HH:MM:SS:FF` strings, absolute frame counts and seconds.
//!
//! ## Drop-frame
//! NTSC 29.97 timecode counts on a nominal base of 30 but skips the frame
//! labels `;00` and `;01` at the start of every minute, except minutes
//! divisible by ten. Over ten minutes that removes 18 labels, so a ten minute
//! block holds 17982 frames and the label sequence stays aligned with real
//! elapsed time (to within 2.6 frames per day).
//!
//! Labels that drop-frame counting skips (e.g. `00:01:00;00`) are rejected as
//! invalid input, which makes `frames -> string -> frames` exact.
//!
//! Seconds always go through absolute frames, never through float arithmetic
//! on the individual fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SECONDS_PER_DAY: i64 = 86_400;

/// Guards `floor()` against values like 299.99999999 that should be 300.
const FRAME_EPSILON: f64 = 1e-6;

/// Supported LTC frame-rate modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FrameRate {
    /// Film, 24 fps
    Fps24,
    /// PAL / EBU, 25 fps
    Fps25,
    /// NTSC 29.97 drop-frame
    Fps2997Df,
    /// NTSC 29.97 non-drop (timecode runs slow against wall clock)
    Fps2997Ndf,
    /// 30 fps
    #[default]
    Fps30,
}

impl FrameRate {
    /// Integer frame base used for timecode labels
    pub fn nominal_fps(self) -> u32 {
        match self {
            FrameRate::Fps24 => 24,
            FrameRate::Fps25 => 25,
            FrameRate::Fps2997Df | FrameRate::Fps2997Ndf | FrameRate::Fps30 => 30,
        }
    }

    /// Real frames per second of the signal
    pub fn actual_fps(self) -> f64 {
        match self {
            FrameRate::Fps24 => 24.0,
            FrameRate::Fps25 => 25.0,
            FrameRate::Fps2997Df | FrameRate::Fps2997Ndf => 30_000.0 / 1001.0,
            FrameRate::Fps30 => 30.0,
        }
    }

    /// Drop-frame flag implied by the mode
    pub fn is_drop_frame(self) -> bool {
        matches!(self, FrameRate::Fps2997Df)
    }

    /// Whether a drop-frame flag can be honoured at all for this base
    pub fn supports_drop_frame(self) -> bool {
        drop_applies(true, self.nominal_fps())
    }

    pub fn label(self) -> &'static str {
        match self {
            FrameRate::Fps24 => "24",
            FrameRate::Fps25 => "25",
            FrameRate::Fps2997Df => "29.97df",
            FrameRate::Fps2997Ndf => "29.97",
            FrameRate::Fps30 => "30",
        }
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for FrameRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "24" => Ok(FrameRate::Fps24),
            "25" => Ok(FrameRate::Fps25),
            "29.97df" | "2997df" | "df" => Ok(FrameRate::Fps2997Df),
            "29.97" | "29.97ndf" | "2997" | "ndf" => Ok(FrameRate::Fps2997Ndf),
            "30" => Ok(FrameRate::Fps30),
            other => Err(format!(
                "unknown frame rate '{}' (expected 24, 25, 29.97df, 29.97, 30)",
                other
            )),
        }
    }
}

/// A parsed `HH:MM:SS:FF` label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timecode {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub frames: u32,
}

impl Timecode {
    pub fn new(hours: u32, minutes: u32, seconds: u32, frames: u32) -> Self {
        Timecode { hours, minutes, seconds, frames }
    }

    /// Parse the field syntax only. Accepts `:`, `;` and `.` separators.
    /// Range checks happen in [`Timecode::is_valid`].
    pub fn parse(s: &str) -> Option<Self> {
        let mut fields = [0u32; 4];
        let mut count = 0;
        for part in s.trim().split([':', ';', '.']) {
            if count == 4 || part.is_empty() || part.len() > 2 {
                return None;
            }
            if !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            fields[count] = part.parse().ok()?;
            count += 1;
        }
        if count != 4 {
            return None;
        }
        Some(Timecode::new(fields[0], fields[1], fields[2], fields[3]))
    }

    pub fn is_valid(&self, drop_frame: bool, nominal_fps: u32) -> bool {
        if nominal_fps == 0
            || self.hours >= 24
            || self.minutes >= 60
            || self.seconds >= 60
            || self.frames >= nominal_fps
        {
            return false;
        }
        if drop_applies(drop_frame, nominal_fps) {
            let skipped = dropped_per_minute(nominal_fps) as u32;
            if self.seconds == 0 && self.frames < skipped && self.minutes % 10 != 0 {
                return false;
            }
        }
        true
    }

    /// Absolute frame count since 00:00:00:00
    pub fn to_frames(&self, drop_frame: bool, nominal_fps: u32) -> Option<i64> {
        if !self.is_valid(drop_frame, nominal_fps) {
            return None;
        }
        let fps = nominal_fps as i64;
        let (h, m, s, f) = (
            self.hours as i64,
            self.minutes as i64,
            self.seconds as i64,
            self.frames as i64,
        );
        let frames_at_base = (h * 3600 + m * 60 + s) * fps + f;
        if drop_applies(drop_frame, nominal_fps) {
            let total_minutes = h * 60 + m;
            let dropped = dropped_per_minute(nominal_fps) * (total_minutes - total_minutes / 10);
            Some(frames_at_base - dropped)
        } else {
            Some(frames_at_base)
        }
    }

    /// Inverse of [`Timecode::to_frames`]. Negative input clamps to zero,
    /// input past 24h wraps.
    pub fn from_frames(frames: i64, drop_frame: bool, nominal_fps: u32) -> Self {
        if nominal_fps == 0 {
            return Timecode::default();
        }
        let fps = nominal_fps as i64;
        let frames = frames.max(0) % frames_per_day(drop_frame, nominal_fps);

        let label_frames = if drop_applies(drop_frame, nominal_fps) {
            let drop = dropped_per_minute(nominal_fps);
            let per_minute = fps * 60 - drop;
            let per_ten_minutes = fps * 600 - drop * 9;

            let blocks = frames / per_ten_minutes;
            let rem = frames % per_ten_minutes;

            // First minute of each block keeps all its labels
            let mut restored = frames + drop * 9 * blocks;
            if rem >= drop {
                restored += drop * ((rem - drop) / per_minute);
            }
            restored
        } else {
            frames
        };

        let f = label_frames % fps;
        let total_seconds = label_frames / fps;
        Timecode {
            hours: (total_seconds / 3600) as u32,
            minutes: ((total_seconds / 60) % 60) as u32,
            seconds: (total_seconds % 60) as u32,
            frames: f as u32,
        }
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frames
        )
    }
}

fn drop_applies(drop_frame: bool, nominal_fps: u32) -> bool {
    drop_frame && nominal_fps >= 30 && nominal_fps % 30 == 0
}

/// 2 labels per minute at 30, 4 at 60
fn dropped_per_minute(nominal_fps: u32) -> i64 {
    nominal_fps as i64 / 15
}

fn frames_per_day(drop_frame: bool, nominal_fps: u32) -> i64 {
    let fps = nominal_fps as i64;
    if drop_applies(drop_frame, nominal_fps) {
        let per_ten_minutes = fps * 600 - dropped_per_minute(nominal_fps) * 9;
        per_ten_minutes * 6 * 24
    } else {
        SECONDS_PER_DAY * fps
    }
}

/// `HH:MM:SS:FF` → absolute frames. `None` for malformed or out-of-range input.
pub fn to_absolute_frames(tc: &str, drop_frame: bool, nominal_fps: u32) -> Option<i64> {
    Timecode::parse(tc)?.to_frames(drop_frame, nominal_fps)
}

/// Absolute frames → `HH:MM:SS:FF`, wrapping at 24h.
pub fn to_timecode_string(frames: i64, drop_frame: bool, nominal_fps: u32) -> String {
    Timecode::from_frames(frames, drop_frame, nominal_fps).to_string()
}

pub fn frames_to_seconds(frames: i64, actual_fps: f64) -> f64 {
    if actual_fps <= 0.0 {
        return 0.0;
    }
    frames as f64 / actual_fps
}

/// Floors to the frame containing `seconds`. Negative (and NaN) clamp to 0.
pub fn seconds_to_frames(seconds: f64, actual_fps: f64) -> i64 {
    if !(seconds > 0.0) || actual_fps <= 0.0 {
        return 0;
    }
    (seconds * actual_fps + FRAME_EPSILON).floor() as i64
}

/// Frame-rate mode plus the effective drop-frame flag
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimecodeFormat {
    pub rate: FrameRate,
    pub drop_frame: bool,
}

impl TimecodeFormat {
    pub fn new(rate: FrameRate, drop_frame: bool) -> Self {
        TimecodeFormat {
            rate,
            drop_frame: drop_frame && rate.supports_drop_frame(),
        }
    }

    pub fn from_rate(rate: FrameRate) -> Self {
        Self::new(rate, rate.is_drop_frame())
    }

    /// Same rate, drop flag replaced by the decoder's flag when it reports one
    pub fn with_decoded_flag(self, decoded: Option<bool>) -> Self {
        match decoded {
            Some(flag) => Self::new(self.rate, flag),
            None => self,
        }
    }

    pub fn nominal_fps(&self) -> u32 {
        self.rate.nominal_fps()
    }

    pub fn actual_fps(&self) -> f64 {
        self.rate.actual_fps()
    }

    pub fn frame_duration(&self) -> f64 {
        1.0 / self.actual_fps()
    }

    pub fn to_frames(&self, tc: &str) -> Option<i64> {
        to_absolute_frames(tc, self.drop_frame, self.nominal_fps())
    }

    pub fn to_seconds(&self, tc: &str) -> Option<f64> {
        self.to_frames(tc).map(|frames| frames_to_seconds(frames, self.actual_fps()))
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> i64 {
        seconds_to_frames(seconds, self.actual_fps())
    }

    pub fn frames_to_string(&self, frames: i64) -> String {
        to_timecode_string(frames, self.drop_frame, self.nominal_fps())
    }

    pub fn seconds_to_string(&self, seconds: f64) -> String {
        self.frames_to_string(self.seconds_to_frames(seconds))
    }
}

impl Default for TimecodeFormat {
    fn default() -> Self {
        Self::from_rate(FrameRate::default())
    }
}
