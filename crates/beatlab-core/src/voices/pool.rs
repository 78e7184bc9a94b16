//! The voice pool: sole owner of the instruments and the effects chain.
//!
//! Triggers are queued with their musical time and started at the exact
//! frame of a render block where that time falls. Sustained notes end at a
//! tick (scheduled content) or after a frame count (previews).

use super::{EffectsChain, Instrument, PolySynth, SampleVoice, StereoFrame, Trigger};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{EventPayload, ScheduledEvent};
use crate::model::{Pitch, SampleId};
use crate::samples::{SampleBuffer, SampleLibrary, SampleLookup};
use crate::timing::{TickTime, Ticks};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Pitch handed to one-shot sample voices.
const SAMPLE_PITCH: Pitch = 60;

/// Builds the player for a sample once its buffer is ready.
pub type SampleVoiceFactory = Box<dyn Fn(&SampleId, Arc<SampleBuffer>) -> Box<dyn Instrument> + Send>;

/// Musical time covered by one render block, `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSpan {
    pub start: TickTime,
    pub end: TickTime,
}

impl RenderSpan {
    pub fn new(start: TickTime, end: TickTime) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// A block during which musical time does not advance (stopped or paused).
    pub fn at(position: TickTime) -> Self {
        Self::new(position, position)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Frame of a block of `frames` frames at which `at` falls.
    fn frame_of(&self, at: TickTime, frames: usize) -> usize {
        if self.is_empty() || at <= self.start {
            return 0;
        }
        let fraction = (at - self.start).to_float() / (self.end - self.start).to_float();
        ((fraction * frames as f64).floor() as usize).min(frames.saturating_sub(1))
    }
}

/// What an audition click plays.
#[derive(Clone, Debug, PartialEq)]
pub enum PreviewTarget {
    Melodic(Pitch),
    Harmony(Vec<Pitch>),
    Sample(SampleId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Voice {
    Melodic,
    Harmony,
    Sample(SampleId),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Length {
    Ticks(Ticks),
    Frames(u64),
    OneShot,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum NoteEnd {
    Tick(TickTime),
    Frame(u64),
}

#[derive(Clone, Debug)]
struct QueuedTrigger {
    /// `None` starts at the next rendered frame.
    at: Option<TickTime>,
    lane: Option<u32>,
    voice: Voice,
    pitches: Vec<Pitch>,
    velocity: f32,
    length: Length,
}

#[derive(Clone, Debug)]
struct Sounding {
    voice: Voice,
    pitch: Pitch,
    lane: Option<u32>,
    end: NoteEnd,
}

struct SampleSlot {
    buffer: Arc<SampleBuffer>,
    instrument: Box<dyn Instrument>,
}

pub struct VoicePool {
    melodic: Box<dyn Instrument>,
    harmony: Box<dyn Instrument>,
    samples: BTreeMap<SampleId, SampleSlot>,
    sample_factory: SampleVoiceFactory,
    library: SampleLibrary,
    effects: EffectsChain,
    /// Sorted by `at`; immediate triggers sort first.
    queue: Vec<QueuedTrigger>,
    sounding: Vec<Sounding>,
    rendered_until: TickTime,
    frames_rendered: u64,
    preview_frames: u64,
    warned_failed: HashSet<SampleId>,
    disposed: bool,
}

impl VoicePool {
    pub fn new(
        melodic: Box<dyn Instrument>,
        harmony: Box<dyn Instrument>,
        effects: EffectsChain,
        library: SampleLibrary,
    ) -> Self {
        Self {
            melodic,
            harmony,
            samples: BTreeMap::new(),
            sample_factory: Box::new(|id: &SampleId, buffer: Arc<SampleBuffer>| -> Box<dyn Instrument> {
                Box::new(SampleVoice::new(id.as_str(), buffer))
            }),
            library,
            effects,
            queue: Vec::new(),
            sounding: Vec::new(),
            rendered_until: TickTime::ZERO,
            frames_rendered: 0,
            preview_frames: 22_050,
            warned_failed: HashSet::new(),
            disposed: false,
        }
    }

    /// The standard pool: triangle lead, sine pads and the configured chain.
    pub fn from_config(config: &EngineConfig, library: SampleLibrary) -> Self {
        let sr = config.sample_rate;
        Self::new(
            Box::new(PolySynth::from_config("melodic", &config.melodic, config.max_polyphony, sr)),
            Box::new(PolySynth::from_config("harmony", &config.harmony, config.max_polyphony, sr)),
            EffectsChain::new(&config.effects, config.master_volume, sr),
            library,
        )
        .with_preview_frames(config.preview_ms * sr as u64 / 1000)
    }

    pub fn with_sample_factory(mut self, factory: SampleVoiceFactory) -> Self {
        self.sample_factory = factory;
        self
    }

    pub fn with_preview_frames(mut self, frames: u64) -> Self {
        self.preview_frames = frames.max(1);
        self
    }

    /// Queue a melodic note at `at_ticks`.
    pub fn trigger_melodic(&mut self, pitch: Pitch, duration_ticks: Ticks, velocity: f32, at_ticks: Ticks) -> Result<()> {
        self.enqueue(QueuedTrigger {
            at: Some(TickTime::from_ticks(at_ticks)),
            lane: None,
            voice: Voice::Melodic,
            pitches: vec![pitch],
            velocity,
            length: Length::Ticks(duration_ticks),
        })
    }

    /// Queue a chord on the harmony voice at `at_ticks`.
    pub fn trigger_harmony(&mut self, pitches: &[Pitch], duration_ticks: Ticks, velocity: f32, at_ticks: Ticks) -> Result<()> {
        self.enqueue(QueuedTrigger {
            at: Some(TickTime::from_ticks(at_ticks)),
            lane: None,
            voice: Voice::Harmony,
            pitches: pitches.to_vec(),
            velocity,
            length: Length::Ticks(duration_ticks),
        })
    }

    /// Queue a one-shot sample hit at `at_ticks`.
    ///
    /// The buffer is looked up when the hit fires; a sample that is not
    /// ready by then is skipped.
    pub fn trigger_sample(&mut self, sample_id: &SampleId, velocity: f32, at_ticks: Ticks) -> Result<()> {
        self.enqueue(QueuedTrigger {
            at: Some(TickTime::from_ticks(at_ticks)),
            lane: None,
            voice: Voice::Sample(sample_id.clone()),
            pitches: vec![SAMPLE_PITCH],
            velocity,
            length: Length::OneShot,
        })
    }

    /// Queue a scheduled event for its lane.
    pub fn dispatch(&mut self, event: &ScheduledEvent) -> Result<()> {
        let (voice, pitches, velocity, length) = match &event.payload {
            EventPayload::Sample { sample_id, velocity } => {
                (Voice::Sample(sample_id.clone()), vec![SAMPLE_PITCH], *velocity, Length::OneShot)
            }
            EventPayload::Melodic {
                pitch,
                duration_ticks,
                velocity,
            } => (Voice::Melodic, vec![*pitch], *velocity, Length::Ticks(*duration_ticks)),
            EventPayload::Harmony {
                pitches,
                duration_ticks,
                velocity,
            } => (Voice::Harmony, pitches.clone(), *velocity, Length::Ticks(*duration_ticks)),
        };
        log::trace!("[VOICES] Queued {:?} at tick {}", event.id, event.fire_at_ticks);
        self.enqueue(QueuedTrigger {
            at: Some(TickTime::from_ticks(event.fire_at_ticks)),
            lane: Some(event.id.lane_slot),
            voice,
            pitches,
            velocity,
            length,
        })
    }

    /// Play something right away, outside musical time.
    pub fn preview(&mut self, target: PreviewTarget, velocity: f32) -> Result<()> {
        let (voice, pitches, length) = match target {
            PreviewTarget::Melodic(pitch) => (Voice::Melodic, vec![pitch], Length::Frames(self.preview_frames)),
            PreviewTarget::Harmony(pitches) => (Voice::Harmony, pitches, Length::Frames(self.preview_frames)),
            PreviewTarget::Sample(id) => (Voice::Sample(id), vec![SAMPLE_PITCH], Length::OneShot),
        };
        self.enqueue(QueuedTrigger {
            at: None,
            lane: None,
            voice,
            pitches,
            velocity,
            length,
        })
    }

    fn enqueue(&mut self, trigger: QueuedTrigger) -> Result<()> {
        self.ensure_available(&trigger.voice)?;
        let index = self.queue.partition_point(|q| q.at <= trigger.at);
        self.queue.insert(index, trigger);
        Ok(())
    }

    fn ensure_available(&self, voice: &Voice) -> Result<()> {
        if self.disposed {
            return Err(Error::VoiceUnavailable("voice pool".to_string()));
        }
        let instrument = match voice {
            Voice::Melodic => Some(&self.melodic),
            Voice::Harmony => Some(&self.harmony),
            Voice::Sample(id) => self.samples.get(id).map(|slot| &slot.instrument),
        };
        match instrument {
            Some(instrument) if instrument.is_disposed() => Err(Error::VoiceUnavailable(instrument.name().to_string())),
            _ => Ok(()),
        }
    }

    /// Drop queued (not yet started) triggers of one lane.
    ///
    /// Returns the earliest tick that was dropped.
    pub fn retract_lane(&mut self, lane_slot: u32) -> Option<Ticks> {
        let mut earliest: Option<Ticks> = None;
        self.queue.retain(|q| {
            if q.lane != Some(lane_slot) {
                return true;
            }
            if let Some(at) = q.at {
                earliest = Some(earliest.map_or(at.floor(), |e| e.min(at.floor())));
            }
            false
        });
        earliest
    }

    /// Drop every queued trigger.
    pub fn cancel_pending(&mut self) {
        if !self.queue.is_empty() {
            log::debug!("[VOICES] Cancelled {} queued triggers", self.queue.len());
        }
        self.queue.clear();
    }

    /// Silence every sounding voice.
    pub fn release_all(&mut self) {
        self.melodic.release();
        self.harmony.release();
        for slot in self.samples.values_mut() {
            slot.instrument.release();
        }
        self.sounding.clear();
        log::debug!("[VOICES] Released all voices");
    }

    /// Clear effect tails (delay lines, reverb).
    pub fn reset_effects(&mut self) {
        self.effects.reset();
    }

    /// Move the musical-time cursor, e.g. after a stop.
    pub fn rewind(&mut self, position: TickTime) {
        self.rendered_until = position;
    }

    /// Musical time up to which audio has been rendered.
    pub fn rendered_until(&self) -> TickTime {
        self.rendered_until
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn pending_triggers(&self) -> usize {
        self.queue.len()
    }

    pub fn active_voices(&self) -> usize {
        self.melodic.active_voices()
            + self.harmony.active_voices()
            + self.samples.values().map(|s| s.instrument.active_voices()).sum::<usize>()
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.effects.set_master_volume(volume);
    }

    pub fn effects(&self) -> &EffectsChain {
        &self.effects
    }

    pub fn library(&self) -> &SampleLibrary {
        &self.library
    }

    /// Release and drop every voice and the effects chain. Safe to call twice.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.queue.clear();
        self.sounding.clear();
        self.melodic.dispose();
        self.harmony.dispose();
        for slot in self.samples.values_mut() {
            slot.instrument.dispose();
        }
        self.samples.clear();
        self.effects.dispose();
        self.disposed = true;
        log::info!("[VOICES] Voice pool disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Render one block of the mix for the musical time `span`.
    ///
    /// Queued triggers with `at < span.end` start at their frame, triggers
    /// already in the past start at the first frame. Releases due on a frame
    /// are applied before triggers on the same frame.
    pub fn render(&mut self, out: &mut [StereoFrame], span: RenderSpan) {
        out.fill([0.0; 2]);
        if self.disposed {
            return;
        }
        let frames = out.len();
        let block_start = self.frames_rendered;
        let mut cursor = 0;

        while let Some(frame) = self.next_action(span, frames, block_start, cursor) {
            self.render_instruments(&mut out[cursor..frame]);
            cursor = frame;
            self.frames_rendered = block_start + cursor as u64;
            self.apply_releases(span, frames, block_start, cursor);
            self.apply_triggers(span, frames, cursor);
        }
        self.render_instruments(&mut out[cursor..]);
        self.frames_rendered = block_start + frames as u64;

        self.effects.process(out);
        self.rendered_until = self.rendered_until.max(span.end);
    }

    fn trigger_frame(trigger: &QueuedTrigger, span: RenderSpan, frames: usize, cursor: usize) -> Option<usize> {
        match trigger.at {
            None => Some(cursor),
            Some(at) if at < span.end || at < span.start => Some(span.frame_of(at, frames).max(cursor)),
            Some(_) => None,
        }
    }

    fn end_frame(end: NoteEnd, span: RenderSpan, frames: usize, block_start: u64, cursor: usize) -> Option<usize> {
        match end {
            NoteEnd::Tick(t) if t < span.end || t <= span.start => Some(span.frame_of(t, frames).max(cursor)),
            NoteEnd::Frame(f) if f < block_start + frames as u64 => Some((f.saturating_sub(block_start) as usize).max(cursor)),
            _ => None,
        }
    }

    fn next_action(&self, span: RenderSpan, frames: usize, block_start: u64, cursor: usize) -> Option<usize> {
        if frames == 0 {
            return None;
        }
        let trigger = self
            .queue
            .first()
            .and_then(|q| Self::trigger_frame(q, span, frames, cursor));
        let release = self
            .sounding
            .iter()
            .filter_map(|s| Self::end_frame(s.end, span, frames, block_start, cursor))
            .min();
        match (trigger, release) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn apply_releases(&mut self, span: RenderSpan, frames: usize, block_start: u64, cursor: usize) {
        self.release_sounding(|s| Self::end_frame(s.end, span, frames, block_start, cursor) == Some(cursor));
    }

    fn apply_triggers(&mut self, span: RenderSpan, frames: usize, cursor: usize) {
        let due = self
            .queue
            .iter()
            .take_while(|q| Self::trigger_frame(q, span, frames, cursor) == Some(cursor))
            .count();
        let fired: Vec<QueuedTrigger> = self.queue.drain(..due).collect();
        for trigger in fired {
            self.fire(trigger);
        }
    }

    fn release_sounding(&mut self, mut done: impl FnMut(&Sounding) -> bool) {
        let (ended, keep): (Vec<Sounding>, Vec<Sounding>) =
            std::mem::take(&mut self.sounding).into_iter().partition(|s| done(s));
        self.sounding = keep;
        for note in ended {
            if let Some(instrument) = self.instrument_mut(&note.voice) {
                instrument.release_note(note.pitch);
            }
        }
    }

    fn instrument_mut(&mut self, voice: &Voice) -> Option<&mut Box<dyn Instrument>> {
        match voice {
            Voice::Melodic => Some(&mut self.melodic),
            Voice::Harmony => Some(&mut self.harmony),
            Voice::Sample(id) => self.samples.get_mut(id).map(|slot| &mut slot.instrument),
        }
    }

    fn fire(&mut self, trigger: QueuedTrigger) {
        if let Some(lane) = trigger.lane {
            self.release_sounding(|s| s.lane == Some(lane));
        }
        let velocity = trigger.velocity.clamp(0.0, 1.0);
        let at_ticks = trigger.at.map(TickTime::floor);
        let end = match trigger.length {
            Length::Ticks(duration) => Some(NoteEnd::Tick(
                trigger.at.unwrap_or(self.rendered_until) + TickTime::from_ticks(duration),
            )),
            Length::Frames(frames) => Some(NoteEnd::Frame(self.frames_rendered + frames)),
            Length::OneShot => None,
        };

        match &trigger.voice {
            Voice::Melodic | Voice::Harmony => {
                let instrument = if trigger.voice == Voice::Melodic {
                    &mut self.melodic
                } else {
                    &mut self.harmony
                };
                for &pitch in &trigger.pitches {
                    instrument.trigger(&Trigger {
                        pitch,
                        velocity,
                        at_ticks,
                    });
                    if let Some(end) = end {
                        self.sounding.push(Sounding {
                            voice: trigger.voice.clone(),
                            pitch,
                            lane: trigger.lane,
                            end,
                        });
                    }
                }
            }
            Voice::Sample(id) => self.fire_sample(id, velocity, at_ticks),
        }
    }

    fn fire_sample(&mut self, id: &SampleId, velocity: f32, at_ticks: Option<Ticks>) {
        let buffer = match self.library.lookup(id) {
            SampleLookup::Ready(buffer) => buffer,
            SampleLookup::Failed => {
                if self.warned_failed.insert(id.clone()) {
                    log::warn!("[VOICES] Sample '{}' failed to load, skipping its hits", id);
                }
                return;
            }
            SampleLookup::Loading | SampleLookup::Missing => {
                log::debug!("[VOICES] Sample '{}' not ready, skipping hit", id);
                return;
            }
        };

        let stale = self
            .samples
            .get(id)
            .map_or(true, |slot| !Arc::ptr_eq(&slot.buffer, &buffer));
        if stale {
            if let Some(mut old) = self.samples.remove(id) {
                old.instrument.dispose();
            }
            let instrument = (self.sample_factory)(id, Arc::clone(&buffer));
            self.samples.insert(id.clone(), SampleSlot { buffer, instrument });
            self.warned_failed.remove(id);
        }
        if let Some(slot) = self.samples.get_mut(id) {
            slot.instrument.trigger(&Trigger {
                pitch: SAMPLE_PITCH,
                velocity,
                at_ticks,
            });
        }
    }

    fn render_instruments(&mut self, out: &mut [StereoFrame]) {
        if out.is_empty() {
            return;
        }
        self.melodic.render(out);
        self.harmony.render(out);
        for slot in self.samples.values_mut() {
            slot.instrument.render(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectsConfig;
    use crate::events::ScheduledEvent;
    use crate::testing::{self, Call, CallLog, MemorySource, RecordingInstrument};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chain() -> EffectsChain {
        EffectsChain::new(&EffectsConfig::default(), 0.8, 44_100)
    }

    fn pool_with(library: SampleLibrary) -> (VoicePool, CallLog, CallLog) {
        let (melodic, melodic_log) = RecordingInstrument::boxed("melodic");
        let (harmony, harmony_log) = RecordingInstrument::boxed("harmony");
        (VoicePool::new(melodic, harmony, chain(), library), melodic_log, harmony_log)
    }

    fn pool() -> (VoicePool, CallLog, CallLog) {
        pool_with(testing::empty_library())
    }

    fn span(start: Ticks, end: Ticks) -> RenderSpan {
        RenderSpan::new(TickTime::from_ticks(start), TickTime::from_ticks(end))
    }

    fn render(pool: &mut VoicePool, frames: usize, span: RenderSpan) -> Vec<StereoFrame> {
        let mut out = vec![[0.0; 2]; frames];
        pool.render(&mut out, span);
        out
    }

    fn melodic_event(slot: u32, tick: Ticks, pitch: Pitch, duration: Ticks) -> ScheduledEvent {
        ScheduledEvent::new(
            "lead".into(),
            slot,
            tick,
            EventPayload::Melodic {
                pitch,
                duration_ticks: duration,
                velocity: 0.8,
            },
        )
    }

    #[test]
    fn test_trigger_and_end_are_frame_accurate() {
        let (mut pool, melodic, _) = pool();
        pool.trigger_melodic(60, 4, 1.0, 8).unwrap();
        render(&mut pool, 100, span(0, 16));
        assert_eq!(melodic.triggers(), vec![(60, 50)]);
        assert_eq!(melodic.note_releases(), vec![(60, 75)]);
        assert_eq!(pool.rendered_until(), TickTime::from_ticks(16));
    }

    #[test]
    fn test_span_end_is_exclusive() {
        let (mut pool, melodic, _) = pool();
        pool.trigger_melodic(60, 4, 1.0, 16).unwrap();
        render(&mut pool, 100, span(0, 16));
        assert!(melodic.triggers().is_empty());
        assert_eq!(pool.pending_triggers(), 1);
        render(&mut pool, 100, span(16, 32));
        assert_eq!(melodic.triggers(), vec![(60, 100)]);
    }

    #[test]
    fn test_late_trigger_starts_at_block_start() {
        let (mut pool, melodic, _) = pool();
        render(&mut pool, 100, span(0, 16));
        pool.trigger_melodic(62, 100, 1.0, 4).unwrap();
        render(&mut pool, 100, span(16, 32));
        assert_eq!(melodic.triggers(), vec![(62, 100)]);
    }

    #[test]
    fn test_new_onset_releases_previous_note_first() {
        let (mut pool, melodic, _) = pool();
        pool.dispatch(&melodic_event(0, 0, 60, 100)).unwrap();
        pool.dispatch(&melodic_event(0, 8, 62, 100)).unwrap();
        render(&mut pool, 100, span(0, 16));
        let calls = melodic.calls();
        assert_eq!(
            calls[..3],
            [
                Call::Trigger {
                    pitch: 60,
                    velocity: 0.8,
                    frame: 0
                },
                Call::ReleaseNote { pitch: 60, frame: 50 },
                Call::Trigger {
                    pitch: 62,
                    velocity: 0.8,
                    frame: 50
                },
            ]
        );
    }

    #[test]
    fn test_chord_triggers_and_releases_every_pitch() {
        let (mut pool, _, harmony) = pool();
        pool.trigger_harmony(&[60, 64, 67], 8, 0.7, 0).unwrap();
        render(&mut pool, 160, span(0, 16));
        assert_eq!(harmony.triggers(), vec![(60, 0), (64, 0), (67, 0)]);
        assert_eq!(harmony.note_releases().len(), 3);
        assert!(harmony.note_releases().iter().all(|&(_, frame)| frame == 80));
        assert_eq!(pool.active_voices(), 0);
    }

    #[test]
    fn test_retract_lane_keeps_other_lanes() {
        let (mut pool, melodic, _) = pool();
        pool.dispatch(&melodic_event(0, 8, 60, 4)).unwrap();
        pool.dispatch(&melodic_event(0, 4, 62, 4)).unwrap();
        pool.dispatch(&melodic_event(1, 6, 64, 4)).unwrap();
        assert_eq!(pool.retract_lane(0), Some(4));
        assert_eq!(pool.retract_lane(0), None);
        render(&mut pool, 160, span(0, 16));
        assert_eq!(melodic.triggers(), vec![(64, 60)]);
    }

    #[test]
    fn test_release_all_silences_everything() {
        let (mut pool, melodic, harmony) = pool();
        pool.trigger_melodic(60, 1000, 1.0, 0).unwrap();
        pool.trigger_harmony(&[48, 52], 1000, 1.0, 0).unwrap();
        render(&mut pool, 64, span(0, 4));
        assert_eq!(pool.active_voices(), 3);
        pool.release_all();
        assert_eq!(pool.active_voices(), 0);
        assert_eq!(melodic.count(|c| matches!(c, Call::Release { .. })), 1);
        assert_eq!(harmony.count(|c| matches!(c, Call::Release { .. })), 1);
        // released notes are not released again when their end passes
        render(&mut pool, 64, span(4, 2000));
        assert!(melodic.note_releases().is_empty());
    }

    #[test]
    fn test_preview_plays_without_musical_time() {
        let (pool, melodic, _) = pool();
        let mut pool = pool.with_preview_frames(10);
        pool.preview(PreviewTarget::Melodic(64), 1.0).unwrap();
        render(&mut pool, 32, RenderSpan::at(TickTime::ZERO));
        assert_eq!(melodic.triggers(), vec![(64, 0)]);
        assert_eq!(melodic.note_releases(), vec![(64, 10)]);
    }

    #[test]
    fn test_paused_span_holds_queued_triggers() {
        let (mut pool, melodic, _) = pool();
        pool.trigger_melodic(60, 4, 1.0, 8).unwrap();
        render(&mut pool, 64, RenderSpan::at(TickTime::from_ticks(8)));
        assert!(melodic.triggers().is_empty());
        assert_eq!(pool.pending_triggers(), 1);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (mut pool, melodic, _) = pool();
        pool.trigger_melodic(60, 4, 1.0, 0).unwrap();
        pool.dispose();
        pool.dispose();
        assert_eq!(melodic.count(|c| *c == Call::Dispose), 1);
        assert!(matches!(pool.trigger_melodic(60, 4, 1.0, 0), Err(Error::VoiceUnavailable(_))));
        assert!(matches!(pool.preview(PreviewTarget::Sample("kick".into()), 1.0), Err(Error::VoiceUnavailable(_))));
        let out = render(&mut pool, 32, span(0, 4));
        assert!(out.iter().all(|f| *f == [0.0, 0.0]));
        assert!(pool.effects().is_disposed());
    }

    #[test]
    fn test_disposed_instrument_is_unavailable() {
        let (mut melodic, _) = RecordingInstrument::new("melodic");
        melodic.dispose();
        let (harmony, _) = RecordingInstrument::boxed("harmony");
        let mut pool = VoicePool::new(Box::new(melodic), harmony, chain(), testing::empty_library());
        assert!(matches!(pool.trigger_melodic(60, 4, 1.0, 0), Err(Error::VoiceUnavailable(name)) if name == "melodic"));
        assert!(pool.trigger_harmony(&[60], 4, 1.0, 0).is_ok());
    }

    #[tokio::test]
    async fn test_sample_hits_use_ready_buffers() {
        let loader = testing::memory_loader(
            MemorySource::default()
                .with("kick.wav", testing::wav_bytes(4410, 16_000, 44_100))
                .with("kick2.wav", testing::wav_bytes(4410, 8_000, 44_100)),
        );
        loader.load("kick", "kick.wav").await;
        loader.load("snare", "snare.wav").await;

        let created = Arc::new(AtomicUsize::new(0));
        let hits = CallLog::default();
        let factory: SampleVoiceFactory = {
            let created = Arc::clone(&created);
            let hits = hits.clone();
            Box::new(move |id: &SampleId, _buffer: Arc<SampleBuffer>| -> Box<dyn Instrument> {
                created.fetch_add(1, Ordering::SeqCst);
                Box::new(RecordingInstrument::with_log(id.as_str(), hits.clone()))
            })
        };
        let (mut pool, _, _) = pool_with(loader.library());
        pool = pool.with_sample_factory(factory);

        pool.trigger_sample(&"kick".into(), 1.0, 0).unwrap();
        pool.trigger_sample(&"snare".into(), 1.0, 0).unwrap();
        pool.trigger_sample(&"clap".into(), 1.0, 0).unwrap();
        pool.trigger_sample(&"kick".into(), 1.0, 4).unwrap();
        let out = render(&mut pool, 128, span(0, 8));
        assert_eq!(hits.triggers(), vec![(60, 0), (60, 64)]);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(out.iter().any(|f| f[0] != 0.0));

        // a reloaded sample gets a fresh voice
        loader.load("kick", "kick2.wav").await;
        pool.trigger_sample(&"kick".into(), 1.0, 8).unwrap();
        render(&mut pool, 128, span(8, 16));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_from_config_builds_working_pool() {
        let config = EngineConfig::default();
        let mut pool = VoicePool::from_config(&config, testing::empty_library());
        assert_eq!(pool.preview_frames, 22_050);
        pool.preview(PreviewTarget::Harmony(vec![60, 64, 67]), 0.8).unwrap();
        let out = render(&mut pool, 4410, RenderSpan::at(TickTime::ZERO));
        assert_eq!(pool.active_voices(), 3);
        assert!(out.iter().any(|f| f[0].abs() > 1e-4));
    }
}
