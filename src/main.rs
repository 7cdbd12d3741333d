use anyhow::{Result, anyhow};
use clap::Parser;
use log::{info, warn, debug, trace, LevelFilter};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use ltcsync::clock::{MonotonicClock, ReferenceClock};
use ltcsync::config::{PersistedSettings, SystemConfig};
use ltcsync::controller::LtcController;
use ltcsync::events::{SignalState, SyncEvent, TimecodeEvent};
use ltcsync::playback::PlaybackSync;
use ltcsync::status::SyncStatus;
use ltcsync::timecode::{FrameRate, TimecodeFormat};
use ltcsync::traits::{Decoded, DecodedBlock, PlaybackState, PlaybackTarget, TimecodeSource};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chase LTC timecode with a jitter-free virtual clock", long_about = None)]
struct Args {
    /// 24, 25, 29.97df, 29.97 or 30
    #[arg(long)]
    frame_rate: Option<FrameRate>,

    #[arg(long, default_value_t = false)]
    drop_frame: bool,

    /// JSON tuning file (SystemConfig)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device settings file, loaded at start and saved on exit
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Generate LTC internally instead of reading decoded timecodes from stdin
    #[arg(long, default_value_t = false)]
    simulate: bool,

    #[arg(long, default_value = "01:00:00:00")]
    sim_start: String,

    /// Rate error of the simulated source, parts per million
    #[arg(long, default_value_t = 0.0)]
    sim_ppm: f64,

    /// Timeline offset in seconds
    #[arg(long)]
    offset: Option<f64>,

    /// Start playback on the next gate instead of immediately
    #[arg(long, default_value_t = false)]
    gated: bool,

    /// Timecode event, repeatable: NAME=HH:MM:SS:FF
    #[arg(long = "cue", value_name = "NAME=TIMECODE")]
    cues: Vec<String>,

    /// Seconds between status lines
    #[arg(long, default_value_t = 10)]
    status_interval: u64,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

// ============================================================================
// INPUT: producer thread -> channel -> TimecodeSource
// ============================================================================

struct ChannelSource {
    rx: Receiver<DecodedBlock>,
    producing: Arc<AtomicBool>,
    disconnected: bool,
}

impl TimecodeSource for ChannelSource {
    fn poll(&mut self) -> Result<Option<DecodedBlock>> {
        match self.rx.try_recv() {
            Ok(block) => Ok(Some(block)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                if !self.disconnected {
                    info!("[Input] Producer finished");
                    self.disconnected = true;
                }
                Ok(None)
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.producing.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Reads one decoded timecode per line: `HH:MM:SS:FF [level]`.
/// A leading `!` marks a frame the decoder flagged invalid.
fn spawn_stdin_reader(tx: Sender<DecodedBlock>, producing: Arc<AtomicBool>, origin: Instant) {
    thread::spawn(move || {
        let clock = MonotonicClock::with_origin(origin);
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if !producing.load(Ordering::SeqCst) {
                break;
            }
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("[Input] stdin read failed: {}", e);
                    break;
                }
            };
            let mut parts = line.split_whitespace();
            let token = match parts.next() {
                Some(t) => t,
                None => continue,
            };
            let decoded = match token.strip_prefix('!') {
                Some(tc) => Decoded::invalid(tc),
                None => Decoded::valid(token),
            };
            let mut block = DecodedBlock::new(clock.now(), vec![decoded]);
            block.level = parts.next().and_then(|l| l.parse::<f32>().ok());
            if tx.send(block).is_err() {
                break;
            }
        }
    });
}

/// Emits LTC frames in real time, running `ppm` fast (or slow) against the
/// local clock
fn spawn_simulator(
    tx: Sender<DecodedBlock>,
    producing: Arc<AtomicBool>,
    origin: Instant,
    format: TimecodeFormat,
    start_frame: i64,
    ppm: f64,
) {
    thread::spawn(move || {
        let clock = MonotonicClock::with_origin(origin);
        let frame_period = format.frame_duration() / (1.0 + ppm * 1e-6);
        let t0 = clock.now();
        let mut frame = 0i64;

        info!("[Sim] Generating {} from {} ({:+.1} ppm)", format.rate,
              format.frames_to_string(start_frame), ppm);

        while producing.load(Ordering::SeqCst) {
            let due = t0 + frame as f64 * frame_period;
            let wait = due - clock.now();
            if wait > 0.0 {
                thread::sleep(Duration::from_secs_f64(wait));
            }

            let mut block = DecodedBlock::single(clock.now(), format.frames_to_string(start_frame + frame));
            block.level = Some(0.8);
            if tx.send(block).is_err() {
                break;
            }
            frame += 1;
        }
    });
}

// ============================================================================
// OUTPUT: simulated media timeline
// ============================================================================

struct SimulatedTimeline {
    base: f64,
    since: Instant,
    state: PlaybackState,
}

impl SimulatedTimeline {
    fn new() -> Self {
        SimulatedTimeline {
            base: 0.0,
            since: Instant::now(),
            state: PlaybackState::Stopped,
        }
    }
}

impl PlaybackTarget for SimulatedTimeline {
    fn play(&mut self) -> Result<()> {
        if self.state != PlaybackState::Playing {
            self.base = self.position();
            self.since = Instant::now();
            self.state = PlaybackState::Playing;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.base = self.position();
        self.state = PlaybackState::Paused;
        Ok(())
    }

    fn position(&self) -> f64 {
        match self.state {
            PlaybackState::Playing => self.base + self.since.elapsed().as_secs_f64(),
            _ => self.base,
        }
    }

    fn set_position(&mut self, seconds: f64) -> Result<()> {
        debug!("[Timeline] Seek {:.3} -> {:.3}", self.position(), seconds);
        self.base = seconds;
        self.since = Instant::now();
        Ok(())
    }

    fn state(&self) -> PlaybackState {
        self.state
    }
}

// ============================================================================
// STARTUP
// ============================================================================

fn load_config(args: &Args) -> (SystemConfig, PersistedSettings) {
    let mut config = match &args.config {
        Some(path) => match SystemConfig::load(path) {
            Ok(c) => {
                info!("Loaded config from {}", path.display());
                c
            }
            Err(e) => {
                warn!("{:#}. Using defaults.", e);
                SystemConfig::default()
            }
        },
        None => SystemConfig::default(),
    };

    let settings = match &args.settings {
        Some(path) => PersistedSettings::load(path).unwrap_or_else(|e| {
            warn!("{:#}. Using default settings.", e);
            PersistedSettings::default()
        }),
        None => PersistedSettings::default(),
    };
    if args.settings.is_some() {
        settings.apply_to(&mut config);
    }

    // Command line wins
    if let Some(rate) = args.frame_rate {
        config.timecode.frame_rate = rate;
        config.timecode.drop_frame = rate.is_drop_frame();
    }
    if args.drop_frame {
        config.timecode.drop_frame = true;
    }
    if let Some(offset) = args.offset {
        config.playback.timeline_offset = offset;
    }
    if args.gated {
        config.playback.gated_start = true;
    }
    config.sanitize();

    (config, settings)
}

fn parse_cue(spec: &str) -> Result<TimecodeEvent> {
    let (name, tc) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("Cue '{}' must be NAME=HH:MM:SS:FF", spec))?;
    Ok(TimecodeEvent::new(name.trim(), tc.trim()))
}

fn log_event(event: &SyncEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize {} event: {}", event.kind(), e);
            return;
        }
    };
    match event {
        SyncEvent::Receiving(_) | SyncEvent::NoSignalTick(_) => trace!("{}", json),
        SyncEvent::TimecodeUpdated(_) | SyncEvent::SignalLevelChanged { .. } => debug!("{}", json),
        _ => info!("{}", json),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(None)
        .filter_level(args.log_level)
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let (config, mut settings) = load_config(&args);
    let format = config.timecode_format();

    let origin = Instant::now();
    let producing = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();

    if args.simulate {
        let start_frame = format
            .to_frames(&args.sim_start)
            .ok_or_else(|| anyhow!("Invalid --sim-start '{}' for {}", args.sim_start, format.rate))?;
        spawn_simulator(tx, producing.clone(), origin, format, start_frame, args.sim_ppm);
    } else {
        info!("Reading decoded timecode from stdin");
        spawn_stdin_reader(tx, producing.clone(), origin);
    }

    let source = ChannelSource {
        rx,
        producing,
        disconnected: false,
    };
    let status = Arc::new(RwLock::new(SyncStatus::default()));
    let mut controller = LtcController::new(
        MonotonicClock::with_origin(origin),
        source,
        status,
        config.clone(),
    );

    for cue in &args.cues {
        match parse_cue(cue) {
            Ok(event) => {
                info!("[Event] Watching '{}' at {}", event.name, event.target_timecode);
                controller.add_event(event);
            }
            Err(e) => warn!("{}", e),
        }
    }
    controller.subscribe(log_event);

    let clock = MonotonicClock::with_origin(origin);
    let mut playback = PlaybackSync::new(SimulatedTimeline::new(), &config.playback);

    info!("Starting LTC Loop...");
    let status_every = Duration::from_secs(args.status_interval.max(1));
    let mut last_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        match controller.process_loop_iteration() {
            Ok(Some(transition)) => {
                playback.handle(transition, clock.now(), controller.current_seconds());
            }
            Ok(None) => {}
            Err(e) => warn!("Error in loop: {}", e),
        }

        playback.tick(
            clock.now(),
            controller.current_seconds(),
            controller.signal_state() == SignalState::Running,
        );

        if last_log.elapsed() >= status_every {
            controller.log_status();
            info!("[Playback] Timeline {:.3}s ({:?}, {} resyncs)",
                  playback.target().position(), playback.target().state(), playback.hard_sync_count());
            last_log = Instant::now();
        }

        thread::sleep(Duration::from_millis(5));
    }

    controller.stop_capture();

    if let Some(path) = &args.settings {
        settings.frame_rate = controller.config().timecode.frame_rate;
        settings.drop_frame = controller.format().drop_frame;
        match settings.save(path) {
            Ok(()) => info!("Saved settings to {}", path.display()),
            Err(e) => warn!("{:#}", e),
        }
    }

    info!("Exiting.");
    Ok(())
}
