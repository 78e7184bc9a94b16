//! Polyphonic oscillator synth used for the melodic and harmony voices.

use super::{Instrument, StereoFrame, Trigger};
use crate::config::SynthConfig;
use crate::model::Pitch;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// Time for a forced release (`release()`), in seconds.
const FAST_RELEASE_SECS: f32 = 0.005;

/// Per-voice output level before velocity.
const VOICE_GAIN: f32 = 0.2;

/// Oscillator shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    #[default]
    Sine,
    Triangle,
    Square,
    Sawtooth,
}

impl Waveform {
    /// Sample at phase `0.0..1.0`.
    fn sample(self, phase: f32) -> f32 {
        match self {
            Waveform::Sine => (phase * TAU).sin(),
            Waveform::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * phase - 1.0,
        }
    }
}

/// ADSR envelope, times in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            attack: 0.1,
            decay: 0.1,
            sustain: 0.3,
            release: 0.4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Stage {
    Attack,
    Decay,
    Sustain,
    Release { step: f32 },
    Idle,
}

#[derive(Clone, Debug)]
struct SynthVoice {
    pitch: Pitch,
    phase_inc: f32,
    phase: f32,
    velocity: f32,
    level: f32,
    stage: Stage,
    started: u64,
}

impl SynthVoice {
    fn release_over(&mut self, seconds: f32, sample_rate: f32) {
        if self.stage == Stage::Idle {
            return;
        }
        let frames = (seconds * sample_rate).max(1.0);
        self.stage = Stage::Release {
            step: self.level / frames,
        };
    }

    fn is_released(&self) -> bool {
        matches!(self.stage, Stage::Release { .. } | Stage::Idle)
    }

    fn advance_envelope(&mut self, env: &Envelope, sample_rate: f32) {
        match self.stage {
            Stage::Attack => {
                self.level += 1.0 / (env.attack * sample_rate).max(1.0);
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = Stage::Decay;
                }
            }
            Stage::Decay => {
                self.level -= (1.0 - env.sustain) / (env.decay * sample_rate).max(1.0);
                if self.level <= env.sustain {
                    self.level = env.sustain;
                    self.stage = Stage::Sustain;
                }
            }
            Stage::Sustain => {}
            Stage::Release { step } => {
                self.level -= step;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = Stage::Idle;
                }
            }
            Stage::Idle => {}
        }
    }
}

/// Polyphonic synth with a voice cap; the oldest voice is stolen when full.
pub struct PolySynth {
    name: String,
    waveform: Waveform,
    envelope: Envelope,
    max_voices: usize,
    sample_rate: f32,
    voices: Vec<SynthVoice>,
    started: u64,
    disposed: bool,
}

impl PolySynth {
    pub fn new(name: impl Into<String>, waveform: Waveform, envelope: Envelope, max_voices: usize, sample_rate: u32) -> Self {
        Self {
            name: name.into(),
            waveform,
            envelope,
            max_voices: max_voices.max(1),
            sample_rate: sample_rate as f32,
            voices: Vec::new(),
            started: 0,
            disposed: false,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &SynthConfig, max_voices: usize, sample_rate: u32) -> Self {
        Self::new(name, config.waveform, config.envelope, max_voices, sample_rate)
    }
}

fn midi_to_freq(pitch: Pitch) -> f32 {
    440.0 * 2f32.powf((pitch as f32 - 69.0) / 12.0)
}

impl Instrument for PolySynth {
    fn name(&self) -> &str {
        &self.name
    }

    fn trigger(&mut self, trigger: &Trigger) {
        if self.disposed {
            return;
        }
        if self.voices.len() >= self.max_voices {
            if let Some(oldest) = self
                .voices
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.started)
                .map(|(i, _)| i)
            {
                log::trace!("[VOICES] {} stealing voice for pitch {}", self.name, trigger.pitch);
                self.voices.swap_remove(oldest);
            }
        }
        self.started += 1;
        self.voices.push(SynthVoice {
            pitch: trigger.pitch,
            phase_inc: midi_to_freq(trigger.pitch) / self.sample_rate,
            phase: 0.0,
            velocity: trigger.velocity,
            level: 0.0,
            stage: Stage::Attack,
            started: self.started,
        });
    }

    fn release_note(&mut self, pitch: Pitch) {
        let release = self.envelope.release;
        let sample_rate = self.sample_rate;
        if let Some(voice) = self
            .voices
            .iter_mut()
            .filter(|v| v.pitch == pitch && !v.is_released())
            .min_by_key(|v| v.started)
        {
            voice.release_over(release, sample_rate);
        }
    }

    fn release(&mut self) {
        for voice in &mut self.voices {
            voice.release_over(FAST_RELEASE_SECS, self.sample_rate);
        }
    }

    fn render(&mut self, out: &mut [StereoFrame]) {
        if self.disposed || self.voices.is_empty() {
            return;
        }
        for frame in out.iter_mut() {
            let mut mix = 0.0;
            for voice in &mut self.voices {
                voice.advance_envelope(&self.envelope, self.sample_rate);
                mix += self.waveform.sample(voice.phase) * voice.level * voice.velocity * VOICE_GAIN;
                voice.phase = (voice.phase + voice.phase_inc).fract();
            }
            frame[0] += mix;
            frame[1] += mix;
        }
        self.voices.retain(|v| v.stage != Stage::Idle);
    }

    fn active_voices(&self) -> usize {
        self.voices.len()
    }

    fn dispose(&mut self) {
        self.voices.clear();
        self.disposed = true;
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}
