//! Instruments, the shared effects chain and the voice pool that owns them.

mod effects;
mod pool;
mod sampler;
mod synth;

pub use effects::{Compressor, Effect, EffectsChain, Eq3, FeedbackDelay, Limiter, Reverb};
pub use pool::{PreviewTarget, RenderSpan, SampleVoiceFactory, VoicePool};
pub use sampler::SampleVoice;
pub use synth::{Envelope, PolySynth, Waveform};

use crate::model::Pitch;
use crate::timing::Ticks;

/// One frame of interleaved stereo audio.
pub type StereoFrame = [f32; 2];

/// Note-on handed to an instrument at the frame it should start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Trigger {
    pub pitch: Pitch,
    pub velocity: f32,
    /// Musical time of the onset, `None` for immediate (preview) triggers.
    pub at_ticks: Option<Ticks>,
}

/// A sound source owned by the voice pool.
///
/// Instruments render additively into the buffer they are given; the pool
/// applies the effects chain to the summed result.
pub trait Instrument: Send {
    /// Instrument display name
    fn name(&self) -> &str;
    /// Start a note (or restart a one-shot) at the next rendered frame
    fn trigger(&mut self, trigger: &Trigger);
    /// Begin the release of one sounding pitch
    fn release_note(&mut self, pitch: Pitch);
    /// Silence every sounding voice
    fn release(&mut self);
    /// Add this instrument's output to `out`
    fn render(&mut self, out: &mut [StereoFrame]);
    /// Voices currently producing sound
    fn active_voices(&self) -> usize;
    /// Release all resources; later triggers are ignored
    fn dispose(&mut self);
    fn is_disposed(&self) -> bool;
}

/// Convert decibels to linear gain.
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Convert linear gain to decibels.
pub fn gain_to_db(gain: f32) -> f32 {
    20.0 * gain.max(1e-9).log10()
}
