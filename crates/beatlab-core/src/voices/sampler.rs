//! One-shot sample player for percussion.

use super::{Instrument, StereoFrame, Trigger};
use crate::model::Pitch;
use crate::samples::SampleBuffer;
use std::sync::Arc;

/// Fade applied on `release()` to avoid clicks, in seconds.
const RELEASE_FADE_SECS: f32 = 0.005;

/// Plays a shared, read-only buffer from the start on every trigger.
///
/// Retriggering restarts playback (one voice per percussion instrument).
pub struct SampleVoice {
    name: String,
    buffer: Arc<SampleBuffer>,
    position: Option<usize>,
    gain: f32,
    /// Remaining frames and per-frame decrement of an active fade-out.
    fade: Option<(usize, f32)>,
    disposed: bool,
}

impl SampleVoice {
    pub fn new(name: impl Into<String>, buffer: Arc<SampleBuffer>) -> Self {
        Self {
            name: name.into(),
            buffer,
            position: None,
            gain: 1.0,
            fade: None,
            disposed: false,
        }
    }

    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.buffer
    }
}

impl Instrument for SampleVoice {
    fn name(&self) -> &str {
        &self.name
    }

    fn trigger(&mut self, trigger: &Trigger) {
        if self.disposed {
            return;
        }
        self.position = Some(0);
        self.gain = trigger.velocity;
        self.fade = None;
    }

    fn release_note(&mut self, _pitch: Pitch) {}

    fn release(&mut self) {
        if self.position.is_none() {
            return;
        }
        let frames = ((RELEASE_FADE_SECS * self.buffer.sample_rate() as f32) as usize).max(1);
        self.fade = Some((frames, self.gain / frames as f32));
    }

    fn render(&mut self, out: &mut [StereoFrame]) {
        let Some(mut position) = self.position else {
            return;
        };
        let source = self.buffer.frames();
        for frame in out.iter_mut() {
            let Some(sample) = source.get(position) else {
                self.position = None;
                return;
            };
            if let Some((remaining, step)) = self.fade.as_mut() {
                if *remaining == 0 {
                    self.position = None;
                    self.fade = None;
                    return;
                }
                *remaining -= 1;
                self.gain = (self.gain - *step).max(0.0);
            }
            frame[0] += sample[0] * self.gain;
            frame[1] += sample[1] * self.gain;
            position += 1;
        }
        self.position = Some(position);
    }

    fn active_voices(&self) -> usize {
        usize::from(self.position.is_some())
    }

    fn dispose(&mut self) {
        self.position = None;
        self.disposed = true;
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}
