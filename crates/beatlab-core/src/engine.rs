//! The engine: one transport, one scheduler and one voice pool per instance.
//!
//! The host drives the engine by calling [`Engine::process`] (or
//! [`Engine::tick`] and [`Engine::render_block`] separately) from its audio
//! or timer loop. Every time-dependent call takes the current [`Instant`], so
//! the same engine can run against the wall clock or a simulated one.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::ScheduledEvent;
use crate::export::{CaptureHandle, CaptureTap, EncodedAudio};
use crate::model::{ChordSequence, LaneContent, LaneId, NoteSequence, SampleId, StepPattern, DEFAULT_VELOCITY};
use crate::samples::{SampleLibrary, SampleState};
use crate::scheduler::{EventScheduler, LaneTemplate};
use crate::theory::Chord;
use crate::timing::{Ticks, TickTime, Transport, TransportState};
use crate::voices::{PreviewTarget, RenderSpan, StereoFrame, VoicePool};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Notifications for the UI layer.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Playhead moved. `step` is the sixteenth-note index since tick 0.
    Position { tick: Ticks, step: u64 },
    SampleStateChanged { id: SampleId, state: SampleState },
    TransportChanged(TransportState),
    /// A lifecycle failure (disposed voice, aborted export).
    Error { message: String },
}

struct ActiveCapture {
    tap: CaptureTap,
    /// The capture started the transport and stops it when done.
    started_transport: bool,
}

pub struct Engine {
    config: EngineConfig,
    transport: Transport,
    scheduler: EventScheduler,
    pool: VoicePool,
    library: SampleLibrary,
    subscribers: Vec<Sender<EngineEvent>>,
    capture: Option<ActiveCapture>,
    last_position: Option<(Ticks, Instant)>,
    announced: HashSet<String>,
    disposed: bool,
}

impl Engine {
    /// Build an engine around an injected voice pool and sample library.
    pub fn new(config: EngineConfig, pool: VoicePool, library: SampleLibrary) -> Result<Self> {
        config.validate()?;
        let transport = Transport::new(config.bpm, config.ticks_per_beat, config.time_signature)?;
        log::info!(
            "[ENGINE] Created at {} BPM, {} ticks per beat, {} Hz",
            config.bpm,
            config.ticks_per_beat,
            config.sample_rate
        );
        Ok(Self {
            config,
            transport,
            scheduler: EventScheduler::new(),
            pool,
            library,
            subscribers: Vec::new(),
            capture: None,
            last_position: None,
            announced: HashSet::new(),
            disposed: false,
        })
    }

    /// The standard engine: default instruments and effects from `config`.
    pub fn from_config(config: EngineConfig, library: SampleLibrary) -> Result<Self> {
        let pool = VoicePool::from_config(&config, library.clone());
        Self::new(config, pool, library)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive engine notifications, including sample load transitions.
    pub fn subscribe(&mut self) -> Receiver<EngineEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.library.subscribe(tx.clone());
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: EngineEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Report a lifecycle error once, then hand it back to the caller.
    fn announce(&mut self, err: Error) -> Error {
        self.announce_once(&err);
        err
    }

    /// Emit a lifecycle error to subscribers unless it was already reported.
    fn announce_once(&mut self, err: &Error) {
        if !err.is_lifecycle() {
            return;
        }
        let message = err.to_string();
        if self.announced.insert(message.clone()) {
            log::error!("[ENGINE] {}", message);
            self.emit(EngineEvent::Error { message });
        }
    }

    fn ensure_live(&mut self) -> Result<()> {
        if self.disposed || self.pool.is_disposed() {
            return Err(self.announce(Error::VoiceUnavailable("engine disposed".to_string())));
        }
        Ok(())
    }

    // ---- content ----

    /// Replace the step pattern of `lane`.
    pub fn update_pattern(&mut self, lane: &LaneId, pattern: &StepPattern) -> Result<()> {
        self.reschedule(lane, LaneContent::Steps(pattern))
    }

    /// Replace the note sequence of `lane`.
    pub fn update_notes(&mut self, lane: &LaneId, notes: &NoteSequence) -> Result<()> {
        self.reschedule(lane, LaneContent::Notes(notes))
    }

    /// Replace the chord sequence of `lane`.
    pub fn update_chords(&mut self, lane: &LaneId, chords: &ChordSequence) -> Result<()> {
        self.reschedule(lane, LaneContent::Chords(chords))
    }

    /// Re-derive a lane from new content.
    ///
    /// Events that have not started sounding yet, including ones already
    /// handed to the voice pool, are replaced; sounded events are untouched.
    pub fn reschedule(&mut self, lane: &LaneId, content: LaneContent<'_>) -> Result<()> {
        self.ensure_live()?;
        let template = LaneTemplate::derive(content, self.transport.ticks_per_beat())?;
        let slot = self.scheduler.register(lane);
        let mut frontier = self.pool.rendered_until().ceil();
        if let Some(earliest) = self.pool.retract_lane(slot) {
            frontier = frontier.min(earliest);
        }
        self.scheduler.replace_lane(lane, template, frontier, frontier);
        Ok(())
    }

    /// Drop a lane's content; notes already sounding finish normally.
    pub fn remove_lane(&mut self, lane: &LaneId) {
        if let Some(slot) = self.scheduler.remove_lane(lane) {
            self.pool.retract_lane(slot);
            log::debug!("[ENGINE] Removed lane '{}'", lane);
        }
    }

    /// Events of `lane` derived but not yet handed to the voice pool.
    pub fn pending_events(&self, lane: &LaneId) -> Vec<ScheduledEvent> {
        self.scheduler.pending_for(lane)
    }

    // ---- transport ----

    pub fn set_tempo(&mut self, bpm: f64, now: Instant) -> Result<()> {
        self.transport.set_tempo(bpm, now)?;
        let state = self.transport.state(now);
        self.emit(EngineEvent::TransportChanged(state));
        Ok(())
    }

    /// Start or resume playback. Returns `false` if already running.
    pub fn start(&mut self, now: Instant) -> Result<bool> {
        self.ensure_live()?;
        if !self.transport.start(now) {
            return Ok(false);
        }
        self.announced.clear();
        log::info!("[ENGINE] Started at tick {}", self.transport.position(now));
        let state = self.transport.state(now);
        self.emit(EngineEvent::TransportChanged(state));
        Ok(true)
    }

    /// Stop, rewind to tick 0 and silence everything.
    ///
    /// Every pending event is cancelled and every sounding voice released
    /// before this returns. A running capture is aborted.
    pub fn stop(&mut self) {
        if let Some(capture) = self.capture.take() {
            drop(capture);
            self.announce_once(&Error::ExportAborted);
        }
        self.halt();
        log::info!("[ENGINE] Stopped");
    }

    fn halt(&mut self) {
        self.transport.stop();
        self.scheduler.reset(0);
        self.pool.cancel_pending();
        self.pool.release_all();
        self.pool.reset_effects();
        self.pool.rewind(TickTime::ZERO);
        self.last_position = None;
        self.emit(EngineEvent::TransportChanged(TransportState {
            bpm: self.transport.bpm(),
            position_ticks: 0,
            running: false,
        }));
    }

    /// Halt playback at the current position, releasing sounding voices.
    pub fn pause(&mut self, now: Instant) {
        self.transport.pause(now);
        self.pool.release_all();
        log::info!("[ENGINE] Paused at tick {}", self.transport.position(now));
        let state = self.transport.state(now);
        self.emit(EngineEvent::TransportChanged(state));
    }

    pub fn position(&self, now: Instant) -> Ticks {
        self.transport.position(now)
    }

    pub fn transport_state(&self, now: Instant) -> TransportState {
        self.transport.state(now)
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }

    // ---- previews ----

    /// Audition a sound immediately, bypassing the scheduler.
    pub fn preview_trigger(&mut self, target: PreviewTarget) -> Result<()> {
        self.ensure_live()?;
        self.pool
            .preview(target, DEFAULT_VELOCITY)
            .map_err(|e| self.announce(e))
    }

    /// Audition a chord on the harmony voice.
    pub fn preview_chord(&mut self, chord: &Chord, octave: i32) -> Result<()> {
        let pitches = chord.pitches(octave).into_iter().collect();
        self.preview_trigger(PreviewTarget::Harmony(pitches))
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.pool.set_master_volume(volume);
    }

    /// Read-only view of the voice pool.
    pub fn voices(&self) -> &VoicePool {
        &self.pool
    }

    // ---- processing ----

    fn lookahead_ticks(&self) -> Ticks {
        self.transport.lookahead_ticks(self.config.lookahead_ms)
    }

    fn schedule_ahead_ticks(&self) -> Ticks {
        let ahead = (self.config.schedule_ahead_beats * self.transport.ticks_per_beat() as f64).ceil() as Ticks;
        ahead.max(self.lookahead_ticks())
    }

    /// Derive pending events up to the horizon and hand the ones due before
    /// `until` to the voice pool.
    fn dispatch_until(&mut self, horizon: Ticks, until: Ticks) -> Result<usize> {
        self.scheduler.fill(horizon.max(until));
        let due = self.scheduler.take_due(until);
        for event in &due {
            if let Err(e) = self.pool.dispatch(event) {
                return Err(self.announce(e));
            }
        }
        if !due.is_empty() {
            log::trace!("[ENGINE] Dispatched {} events before tick {}", due.len(), until);
        }
        Ok(due.len())
    }

    /// One scheduling step: dispatch everything due within the lookahead.
    pub fn tick(&mut self, now: Instant) -> Result<usize> {
        self.ensure_live()?;
        if !self.transport.is_running() {
            return Ok(0);
        }
        let position = self.transport.position(now);
        let dispatched = self.dispatch_until(position + self.schedule_ahead_ticks(), position + self.lookahead_ticks())?;
        self.notify_position(position, now);
        Ok(dispatched)
    }

    fn notify_position(&mut self, tick: Ticks, now: Instant) {
        let interval = Duration::from_secs_f64(1.0 / self.config.position_notify_hz.max(1.0));
        let due = match self.last_position {
            Some((last_tick, at)) => last_tick != tick && now.duration_since(at) >= interval,
            None => true,
        };
        if due {
            self.last_position = Some((tick, now));
            let step = tick * 4 / self.transport.ticks_per_beat() as Ticks;
            self.emit(EngineEvent::Position { tick, step });
        }
    }

    fn block_duration(&self, frames: usize) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.config.sample_rate as f64)
    }

    /// Render the block of audio that starts at `now`.
    pub fn render_block(&mut self, now: Instant, out: &mut [StereoFrame]) -> Result<()> {
        self.ensure_live()?;
        let start = self.pool.rendered_until();
        let span = if self.transport.is_running() {
            let end = self.transport.position_fine(now + self.block_duration(out.len()));
            let span = RenderSpan::new(start, end);
            // anything falling inside this block must reach the pool first
            self.dispatch_until(span.end.ceil(), span.end.ceil())?;
            span
        } else {
            RenderSpan::at(start)
        };
        self.pool.render(out, span);
        self.feed_capture(out);
        Ok(())
    }

    /// `tick` followed by `render_block`.
    pub fn process(&mut self, now: Instant, out: &mut [StereoFrame]) -> Result<()> {
        self.tick(now)?;
        self.render_block(now, out)
    }

    // ---- export ----

    fn feed_capture(&mut self, block: &[StereoFrame]) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        if !capture.tap.push(block) {
            return;
        }
        if let Some(capture) = self.capture.take() {
            capture.tap.complete();
            if capture.started_transport {
                self.halt();
            }
        }
    }

    /// Capture the next `duration_secs` of output.
    ///
    /// Starts the transport if it is not running and stops it again when the
    /// capture ends. Stopping or disposing the engine first aborts the
    /// capture with [`Error::ExportAborted`]. A second capture replaces (and
    /// aborts) the first.
    pub fn start_capture(&mut self, duration_secs: f64, now: Instant) -> Result<CaptureHandle> {
        self.ensure_live()?;
        let (tap, handle) = CaptureTap::new(duration_secs, self.config.sample_rate, self.config.export_format)?;
        let started_transport = self.start(now)?;
        if self.capture.replace(ActiveCapture { tap, started_transport }).is_some() {
            log::warn!("[EXPORT] Replacing a running capture");
        }
        log::info!("[EXPORT] Capturing {:.2}s", duration_secs);
        Ok(handle)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Render `duration_secs` of the arrangement from tick 0, offline.
    ///
    /// The engine is driven block by block on a simulated clock. The
    /// transport is stopped afterwards and the capture released on every
    /// exit path.
    pub fn render(&mut self, duration_secs: f64) -> Result<EncodedAudio> {
        self.ensure_live()?;
        // rewind even when paused
        self.halt();
        let mut now = Instant::now();
        let mut handle = self.start_capture(duration_secs, now)?;
        let block = self.config.block_duration();
        let mut out = vec![[0.0; 2]; self.config.block_size];

        let result = loop {
            if let Some(result) = handle.try_finish() {
                break result;
            }
            if let Err(e) = self.process(now, &mut out) {
                self.capture = None;
                break Err(e);
            }
            now += block;
        };
        self.halt();
        result
    }

    /// Tear down voices, effects and any capture. Safe to call twice.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.capture = None;
        self.transport.stop();
        self.scheduler.reset(0);
        self.pool.dispose();
        self.disposed = true;
        log::info!("[ENGINE] Disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.dispose();
    }
}
