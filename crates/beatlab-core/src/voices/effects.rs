//! Master effects chain shared by every voice.
//!
//! Fixed order: compressor -> three-band EQ -> feedback delay -> reverb ->
//! limiter -> master gain.

use super::{db_to_gain, gain_to_db, StereoFrame};
use crate::config::EffectsConfig;
use std::fmt;

/// Stereo effect that processes a block in place.
pub trait Effect: Send + fmt::Debug {
    fn name(&self) -> &str;
    fn process(&mut self, block: &mut [StereoFrame]);
    /// Clear internal state (delay lines, envelopes).
    fn reset(&mut self);
}

fn time_coefficient(seconds: f32, sample_rate: f32) -> f32 {
    (-1.0 / (seconds.max(1e-4) * sample_rate)).exp()
}

/// Feed-forward compressor with a peak envelope follower.
#[derive(Debug)]
pub struct Compressor {
    threshold_db: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope_db: f32,
}

impl Compressor {
    pub fn new(threshold_db: f32, ratio: f32, attack: f32, release: f32, sample_rate: f32) -> Self {
        Self {
            threshold_db,
            ratio: ratio.max(1.0),
            attack_coeff: time_coefficient(attack, sample_rate),
            release_coeff: time_coefficient(release, sample_rate),
            envelope_db: -120.0,
        }
    }
}

impl Effect for Compressor {
    fn name(&self) -> &str {
        "Compressor"
    }

    fn process(&mut self, block: &mut [StereoFrame]) {
        for frame in block.iter_mut() {
            let peak_db = gain_to_db(frame[0].abs().max(frame[1].abs()));
            let coeff = if peak_db > self.envelope_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope_db = peak_db + coeff * (self.envelope_db - peak_db);
            let over = self.envelope_db - self.threshold_db;
            if over > 0.0 {
                let gain = db_to_gain(-over * (1.0 - 1.0 / self.ratio));
                frame[0] *= gain;
                frame[1] *= gain;
            }
        }
    }

    fn reset(&mut self) {
        self.envelope_db = -120.0;
    }
}

/// Three-band EQ built from two one-pole crossovers.
#[derive(Debug)]
pub struct Eq3 {
    low_gain: f32,
    mid_gain: f32,
    high_gain: f32,
    low_coeff: f32,
    high_coeff: f32,
    low_state: StereoFrame,
    high_state: StereoFrame,
}

impl Eq3 {
    pub fn new(low_db: f32, mid_db: f32, high_db: f32, low_freq: f32, high_freq: f32, sample_rate: f32) -> Self {
        let coeff = |freq: f32| 1.0 - (-std::f32::consts::TAU * freq / sample_rate).exp();
        Self {
            low_gain: db_to_gain(low_db),
            mid_gain: db_to_gain(mid_db),
            high_gain: db_to_gain(high_db),
            low_coeff: coeff(low_freq),
            high_coeff: coeff(high_freq),
            low_state: [0.0; 2],
            high_state: [0.0; 2],
        }
    }

    fn is_flat(&self) -> bool {
        self.low_gain == 1.0 && self.mid_gain == 1.0 && self.high_gain == 1.0
    }
}

impl Effect for Eq3 {
    fn name(&self) -> &str {
        "EQ3"
    }

    fn process(&mut self, block: &mut [StereoFrame]) {
        if self.is_flat() {
            return;
        }
        for frame in block.iter_mut() {
            for ch in 0..2 {
                let x = frame[ch];
                self.low_state[ch] += self.low_coeff * (x - self.low_state[ch]);
                self.high_state[ch] += self.high_coeff * (x - self.high_state[ch]);
                let low = self.low_state[ch];
                let high = x - self.high_state[ch];
                let mid = x - low - high;
                frame[ch] = low * self.low_gain + mid * self.mid_gain + high * self.high_gain;
            }
        }
    }

    fn reset(&mut self) {
        self.low_state = [0.0; 2];
        self.high_state = [0.0; 2];
    }
}

/// Stereo feedback delay on a ring buffer.
#[derive(Debug)]
pub struct FeedbackDelay {
    feedback: f32,
    mix: f32,
    buffer: Vec<StereoFrame>,
    write_pos: usize,
}

impl FeedbackDelay {
    pub fn new(delay_secs: f32, feedback: f32, mix: f32, sample_rate: f32) -> Self {
        let frames = ((delay_secs * sample_rate) as usize).max(1);
        Self {
            feedback: feedback.clamp(0.0, 0.95),
            mix: mix.clamp(0.0, 1.0),
            buffer: vec![[0.0; 2]; frames],
            write_pos: 0,
        }
    }
}

impl Effect for FeedbackDelay {
    fn name(&self) -> &str {
        "FeedbackDelay"
    }

    fn process(&mut self, block: &mut [StereoFrame]) {
        if self.mix == 0.0 {
            return;
        }
        let len = self.buffer.len();
        for frame in block.iter_mut() {
            // write_pos holds the oldest frame, exactly one delay behind
            let delayed = self.buffer[self.write_pos];
            for ch in 0..2 {
                self.buffer[self.write_pos][ch] = frame[ch] + delayed[ch] * self.feedback;
                frame[ch] = frame[ch] * (1.0 - self.mix) + delayed[ch] * self.mix;
            }
            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    fn reset(&mut self) {
        self.buffer.iter_mut().for_each(|f| *f = [0.0; 2]);
        self.write_pos = 0;
    }
}

/// Schroeder-style reverb: parallel combs tuned to a decay time.
pub struct Reverb {
    mix: f32,
    combs: Vec<(Vec<f32>, usize, f32)>,
}

impl Reverb {
    const COMB_MS: [f32; 4] = [29.7, 37.1, 41.1, 43.7];

    pub fn new(decay_secs: f32, mix: f32, sample_rate: f32) -> Self {
        let decay = decay_secs.max(0.01);
        let combs = Self::COMB_MS
            .iter()
            .map(|&ms| {
                let frames = ((ms * sample_rate / 1000.0) as usize).max(1);
                // -60 dB after `decay` seconds
                let feedback = 10f32.powf(-3.0 * (ms / 1000.0) / decay);
                (vec![0.0; frames], 0, feedback)
            })
            .collect();
        Self {
            mix: mix.clamp(0.0, 1.0),
            combs,
        }
    }
}

impl fmt::Debug for Reverb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reverb")
            .field("mix", &self.mix)
            .field("combs", &self.combs.len())
            .finish()
    }
}

impl Effect for Reverb {
    fn name(&self) -> &str {
        "Reverb"
    }

    fn process(&mut self, block: &mut [StereoFrame]) {
        if self.mix == 0.0 {
            return;
        }
        let count = self.combs.len() as f32;
        for frame in block.iter_mut() {
            let input = (frame[0] + frame[1]) * 0.5;
            let mut wet = [0.0f32; 2];
            for (i, (line, pos, feedback)) in self.combs.iter_mut().enumerate() {
                let delayed = line[*pos];
                line[*pos] = input + delayed * *feedback;
                *pos = (*pos + 1) % line.len();
                // alternate combs between channels for width
                wet[i % 2] += delayed;
            }
            for ch in 0..2 {
                frame[ch] = frame[ch] * (1.0 - self.mix) + wet[ch] * 2.0 / count * self.mix;
            }
        }
    }

    fn reset(&mut self) {
        for (line, pos, _) in &mut self.combs {
            line.iter_mut().for_each(|s| *s = 0.0);
            *pos = 0;
        }
    }
}

/// Peak limiter with instant attack and smoothed recovery.
#[derive(Debug)]
pub struct Limiter {
    ceiling: f32,
    release_coeff: f32,
    gain: f32,
}

impl Limiter {
    pub fn new(ceiling_db: f32, sample_rate: f32) -> Self {
        Self {
            ceiling: db_to_gain(ceiling_db),
            release_coeff: time_coefficient(0.05, sample_rate),
            gain: 1.0,
        }
    }
}

impl Effect for Limiter {
    fn name(&self) -> &str {
        "Limiter"
    }

    fn process(&mut self, block: &mut [StereoFrame]) {
        for frame in block.iter_mut() {
            let peak = frame[0].abs().max(frame[1].abs());
            let target = if peak * self.gain > self.ceiling {
                self.ceiling / peak
            } else {
                1.0
            };
            self.gain = if target < self.gain {
                target
            } else {
                target + self.release_coeff * (self.gain - target)
            };
            frame[0] = (frame[0] * self.gain).clamp(-self.ceiling, self.ceiling);
            frame[1] = (frame[1] * self.gain).clamp(-self.ceiling, self.ceiling);
        }
    }

    fn reset(&mut self) {
        self.gain = 1.0;
    }
}

/// The shared chain, applied once to the summed output of all voices.
pub struct EffectsChain {
    stages: Vec<Box<dyn Effect>>,
    master_gain: f32,
    channel_gain: f32,
    disposed: bool,
}

impl EffectsChain {
    pub fn new(config: &EffectsConfig, master_volume: f32, sample_rate: u32) -> Self {
        let sr = sample_rate as f32;
        let stages: Vec<Box<dyn Effect>> = vec![
            Box::new(Compressor::new(
                config.compressor_threshold_db,
                config.compressor_ratio,
                config.compressor_attack,
                config.compressor_release,
                sr,
            )),
            Box::new(Eq3::new(config.eq_low_db, config.eq_mid_db, config.eq_high_db, 400.0, 2500.0, sr)),
            Box::new(FeedbackDelay::new(config.delay_time, config.delay_feedback, config.delay_mix, sr)),
            Box::new(Reverb::new(config.reverb_decay, config.reverb_mix, sr)),
            Box::new(Limiter::new(config.limiter_ceiling_db, sr)),
        ];
        Self {
            stages,
            master_gain: master_volume.clamp(0.0, 1.0),
            channel_gain: db_to_gain(config.master_channel_db),
            disposed: false,
        }
    }

    /// Stage names in processing order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_gain = volume.clamp(0.0, 1.0);
    }

    pub fn master_volume(&self) -> f32 {
        self.master_gain
    }

    pub fn process(&mut self, block: &mut [StereoFrame]) {
        if self.disposed {
            block.iter_mut().for_each(|f| *f = [0.0; 2]);
            return;
        }
        for stage in &mut self.stages {
            stage.process(block);
        }
        let gain = self.master_gain * self.channel_gain;
        for frame in block.iter_mut() {
            frame[0] *= gain;
            frame[1] *= gain;
        }
    }

    /// Clear delay lines and envelopes (tails stop immediately).
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }

    /// Drop all stages. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.stages.clear();
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44_100.0;

    #[test]
    fn test_chain_order() {
        let chain = EffectsChain::new(&EffectsConfig::default(), 0.8, 44_100);
        assert_eq!(
            chain.stage_names(),
            vec!["Compressor", "EQ3", "FeedbackDelay", "Reverb", "Limiter"]
        );
    }

    #[test]
    fn test_limiter_holds_ceiling() {
        let mut limiter = Limiter::new(-1.0, SR);
        let mut block = vec![[2.0, -3.0]; 64];
        limiter.process(&mut block);
        let ceiling = db_to_gain(-1.0);
        assert!(block.iter().all(|f| f[0].abs() <= ceiling + 1e-6 && f[1].abs() <= ceiling + 1e-6));
    }

    #[test]
    fn test_compressor_reduces_loud_signal() {
        let mut comp = Compressor::new(-24.0, 4.0, 0.005, 0.1, SR);
        let mut block = vec![[1.0, 1.0]; 4410];
        comp.process(&mut block);
        assert!(block[4409][0] < 0.5);
        let mut quiet = vec![[0.01, 0.01]; 64];
        comp.reset();
        comp.process(&mut quiet);
        assert!((quiet[63][0] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_delay_echoes_after_delay_time() {
        let mut delay = FeedbackDelay::new(0.01, 0.0, 1.0, SR);
        let mut block = vec![[0.0; 2]; 1000];
        block[0] = [1.0, 1.0];
        delay.process(&mut block);
        assert_eq!(block[0], [0.0, 0.0]);
        assert_eq!(block[441], [1.0, 1.0]);
    }

    #[test]
    fn test_flat_eq_is_transparent() {
        let mut eq = Eq3::new(0.0, 0.0, 0.0, 400.0, 2500.0, SR);
        let mut block = vec![[0.3, -0.2]; 16];
        eq.process(&mut block);
        assert_eq!(block[15], [0.3, -0.2]);
    }

    #[test]
    fn test_disposed_chain_outputs_silence() {
        let mut chain = EffectsChain::new(&EffectsConfig::default(), 0.8, 44_100);
        chain.dispose();
        chain.dispose();
        let mut block = vec![[0.5; 2]; 8];
        chain.process(&mut block);
        assert!(block.iter().all(|f| *f == [0.0, 0.0]));
    }

    #[test]
    fn test_reverb_tail_decays() {
        let mut reverb = Reverb::new(0.2, 1.0, SR);
        let mut block = vec![[0.0; 2]; 44_100];
        block[0] = [1.0, 1.0];
        reverb.process(&mut block);
        let early: f32 = block[..4410].iter().map(|f| f[0].abs()).sum();
        let late: f32 = block[40_000..].iter().map(|f| f[0].abs()).sum();
        assert!(early > 0.0);
        assert!(late < early * 0.01);
    }
}
