//! Timing primitives for the transport and scheduler.
//!
//! - [`TickTime`] - Fixed-point tick position for sub-tick accuracy
//! - [`TimeSignature`] - Musical time signature (e.g., 4/4, 3/4)
//! - [`Subdivision`] - Step grid resolution for step patterns
//! - [`Transport`] - Tempo, run state and musical position
//!
//! All musical time is expressed in integer [`Ticks`] since session start.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Integer ticks since session start.
pub type Ticks = u64;

/// Default resolution in ticks per quarter note.
pub const DEFAULT_TICKS_PER_BEAT: u32 = 192;

/// Supported tempo range (inclusive).
pub const MIN_BPM: f64 = 20.0;
pub const MAX_BPM: f64 = 300.0;

/// Fixed-point tick position with 16 fractional bits.
///
/// Keeps sub-tick precision between integer ticks while staying
/// deterministic across long sessions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TickTime {
    raw: u64,
}

impl TickTime {
    const SCALE: u64 = 65_536;

    /// Zero tick time constant.
    pub const ZERO: TickTime = TickTime { raw: 0 };

    /// Create from a whole number of ticks.
    #[inline]
    pub fn from_ticks(ticks: Ticks) -> Self {
        Self {
            raw: ticks.saturating_mul(Self::SCALE),
        }
    }

    /// Create from a fractional tick count. Negative values clamp to zero.
    #[inline]
    pub fn from_float(value: f64) -> Self {
        Self {
            raw: (value.max(0.0) * Self::SCALE as f64).round() as u64,
        }
    }

    /// Convert to a floating-point tick count.
    #[inline]
    pub fn to_float(self) -> f64 {
        self.raw as f64 / Self::SCALE as f64
    }

    /// Whole ticks, rounded down.
    #[inline]
    pub fn floor(self) -> Ticks {
        self.raw / Self::SCALE
    }

    /// Whole ticks, rounded up.
    #[inline]
    pub fn ceil(self) -> Ticks {
        self.raw.div_ceil(Self::SCALE)
    }
}

impl std::ops::Add for TickTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            raw: self.raw.saturating_add(rhs.raw),
        }
    }
}

impl std::ops::Sub for TickTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            raw: self.raw.saturating_sub(rhs.raw),
        }
    }
}

/// Musical time signature (numerator/denominator).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    /// Create a new time signature.
    ///
    /// Values are clamped to at least 1 to prevent division by zero.
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator: numerator.max(1),
            denominator: denominator.max(1),
        }
    }

    /// Quarter-note beats per bar (6/8 has 3).
    pub fn beats_per_bar(&self) -> f64 {
        self.numerator as f64 * (4.0 / self.denominator as f64)
    }

    /// Ticks per bar at the given resolution.
    pub fn ticks_per_bar(&self, ticks_per_beat: u32) -> Ticks {
        (self.beats_per_bar() * ticks_per_beat as f64).round() as Ticks
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

/// Step grid resolution of a [`StepPattern`](crate::model::StepPattern).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subdivision {
    Quarter,
    Eighth,
    #[default]
    Sixteenth,
    ThirtySecond,
    EighthTriplet,
    SixteenthTriplet,
}

impl Subdivision {
    /// Length of one step in ticks.
    ///
    /// Fails when the step does not land on a whole tick at this resolution.
    pub fn ticks_per_step(self, ticks_per_beat: u32) -> Result<Ticks> {
        // (numerator, denominator) of a quarter note
        let (num, den) = match self {
            Subdivision::Quarter => (1, 1),
            Subdivision::Eighth => (1, 2),
            Subdivision::Sixteenth => (1, 4),
            Subdivision::ThirtySecond => (1, 8),
            Subdivision::EighthTriplet => (1, 3),
            Subdivision::SixteenthTriplet => (1, 6),
        };
        let scaled = ticks_per_beat as u64 * num;
        if scaled % den != 0 || scaled < den {
            return Err(Error::MalformedScheduleInput(format!(
                "{:?} steps do not fit a {} ticks-per-beat grid",
                self, ticks_per_beat
            )));
        }
        Ok(scaled / den)
    }

    /// Parse a Tone-style subdivision string ("16n", "8t", ...).
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "4n" => Some(Subdivision::Quarter),
            "8n" => Some(Subdivision::Eighth),
            "16n" => Some(Subdivision::Sixteenth),
            "32n" => Some(Subdivision::ThirtySecond),
            "8t" => Some(Subdivision::EighthTriplet),
            "16t" => Some(Subdivision::SixteenthTriplet),
            _ => None,
        }
    }
}

fn notation_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)([nmt])(\.)?$").ok())
        .as_ref()
}

fn position_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+):(\d+):(\d+(?:\.\d+)?)$").ok())
        .as_ref()
}

/// Convert musical notation to a tick count.
///
/// Accepts note values (`"16n"`, `"2n"`, `"4n."`), triplets (`"8t"`),
/// measures (`"1m"`, `"4m"`) and transport positions (`"bar:beat:sixteenth"`).
pub fn parse_notation(text: &str, ticks_per_beat: u32, signature: TimeSignature) -> Result<Ticks> {
    let text = text.trim();
    let malformed = || Error::MalformedScheduleInput(format!("unrecognized notation '{}'", text));
    let ppq = ticks_per_beat as f64;

    let ticks = if let Some(caps) = notation_regex().and_then(|re| re.captures(text)) {
        let value: f64 = caps[1].parse().map_err(|_| malformed())?;
        if value <= 0.0 {
            return Err(malformed());
        }
        let base = match &caps[2] {
            "n" => ppq * 4.0 / value,
            "t" => ppq * 4.0 / value * 2.0 / 3.0,
            "m" => ppq * signature.beats_per_bar() * value,
            _ => return Err(malformed()),
        };
        if caps.get(3).is_some() {
            base * 1.5
        } else {
            base
        }
    } else if let Some(caps) = position_regex().and_then(|re| re.captures(text)) {
        let bars: f64 = caps[1].parse().map_err(|_| malformed())?;
        let beats: f64 = caps[2].parse().map_err(|_| malformed())?;
        let sixteenths: f64 = caps[3].parse().map_err(|_| malformed())?;
        bars * signature.beats_per_bar() * ppq + beats * ppq + sixteenths * ppq / 4.0
    } else {
        return Err(malformed());
    };

    let rounded = ticks.round();
    if (ticks - rounded).abs() > 1e-6 {
        return Err(Error::MalformedScheduleInput(format!(
            "'{}' is not a whole number of ticks at {} ticks per beat",
            text, ticks_per_beat
        )));
    }
    Ok(rounded as Ticks)
}

/// Observable transport state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransportState {
    pub bpm: f64,
    pub position_ticks: Ticks,
    pub running: bool,
}

/// Tempo, run state and musical position.
///
/// Position is derived from an anchor (tick position at a known instant) plus
/// the wall-clock time elapsed since. Tempo changes and pauses move the anchor
/// to the current position, so position never jumps and never accumulates
/// per-tick rounding.
#[derive(Clone, Debug)]
pub struct Transport {
    bpm: f64,
    ticks_per_beat: u32,
    signature: TimeSignature,
    running: bool,
    anchor_instant: Option<Instant>,
    anchor_position: TickTime,
}

impl Transport {
    /// Create a stopped transport at tick 0.
    pub fn new(bpm: f64, ticks_per_beat: u32, signature: TimeSignature) -> Result<Self> {
        validate_bpm(bpm)?;
        if ticks_per_beat == 0 {
            return Err(Error::Config("ticks_per_beat must be at least 1".to_string()));
        }
        Ok(Self {
            bpm,
            ticks_per_beat,
            signature,
            running: false,
            anchor_instant: None,
            anchor_position: TickTime::ZERO,
        })
    }

    /// Set the tempo, preserving the current position.
    pub fn set_tempo(&mut self, bpm: f64, now: Instant) -> Result<()> {
        validate_bpm(bpm)?;
        self.reanchor(now);
        log::debug!("[TRANSPORT] Tempo {} -> {} BPM at tick {}", self.bpm, bpm, self.anchor_position.floor());
        self.bpm = bpm;
        Ok(())
    }

    /// Start advancing. Returns `false` if already running.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.running {
            return false;
        }
        self.anchor_instant = Some(now);
        self.running = true;
        true
    }

    /// Stop and rewind to tick 0.
    pub fn stop(&mut self) {
        self.running = false;
        self.anchor_instant = None;
        self.anchor_position = TickTime::ZERO;
    }

    /// Halt advancement, keeping the current position.
    pub fn pause(&mut self, now: Instant) {
        self.reanchor(now);
        self.running = false;
        self.anchor_instant = None;
    }

    fn reanchor(&mut self, now: Instant) {
        self.anchor_position = self.position_fine(now);
        if self.running {
            self.anchor_instant = Some(now);
        }
    }

    /// Exact position at `now`.
    pub fn position_fine(&self, now: Instant) -> TickTime {
        match self.anchor_instant {
            Some(anchor) if self.running && now > anchor => {
                let elapsed = now.duration_since(anchor).as_secs_f64();
                self.anchor_position + TickTime::from_float(elapsed * self.ticks_per_second())
            }
            _ => self.anchor_position,
        }
    }

    /// Whole-tick position at `now`.
    pub fn position(&self, now: Instant) -> Ticks {
        self.position_fine(now).floor()
    }

    /// Snapshot of tempo, position and run state.
    pub fn state(&self, now: Instant) -> TransportState {
        TransportState {
            bpm: self.bpm,
            position_ticks: self.position(now),
            running: self.running,
        }
    }

    /// Get the current BPM.
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Check if the transport is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn ticks_per_beat(&self) -> u32 {
        self.ticks_per_beat
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.signature
    }

    /// Ticks elapsed per second at the current tempo.
    pub fn ticks_per_second(&self) -> f64 {
        self.bpm / 60.0 * self.ticks_per_beat as f64
    }

    /// Duration of `ticks` at the current tempo.
    pub fn ticks_to_duration(&self, ticks: f64) -> Duration {
        Duration::from_secs_f64((ticks / self.ticks_per_second()).max(0.0))
    }

    /// Ticks covered by `duration` at the current tempo.
    pub fn duration_to_ticks(&self, duration: Duration) -> f64 {
        duration.as_secs_f64() * self.ticks_per_second()
    }

    /// Number of whole ticks that fit in the given lookahead window (at least 1).
    pub fn lookahead_ticks(&self, lookahead_ms: u64) -> Ticks {
        let ticks = self.duration_to_ticks(Duration::from_millis(lookahead_ms));
        (ticks.ceil() as Ticks).max(1)
    }
}

fn validate_bpm(bpm: f64) -> Result<()> {
    if bpm.is_finite() && (MIN_BPM..=MAX_BPM).contains(&bpm) {
        Ok(())
    } else {
        Err(Error::InvalidTempo(bpm))
    }
}
