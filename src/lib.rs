pub mod timecode;
pub mod history;
pub mod noise;
pub mod analyzer;
pub mod servo;
pub mod clock;
pub mod events;
pub mod traits;
pub mod controller;
pub mod playback;
pub mod status;
pub mod config;
