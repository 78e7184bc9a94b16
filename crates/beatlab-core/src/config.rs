//! Engine configuration.
//!
//! Configuration is plain TOML; every field has a default so partial files
//! are fine:
//!
//! ```toml
//! bpm = 96
//! ticks_per_beat = 192
//!
//! [effects]
//! reverb_mix = 0.4
//! ```

use crate::error::{Error, Result};
use crate::export::ExportFormat;
use crate::timing::{TimeSignature, DEFAULT_TICKS_PER_BEAT, MAX_BPM, MIN_BPM};
use crate::voices::{Envelope, Waveform};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Tick resolution per quarter note
    pub ticks_per_beat: u32,
    pub time_signature: TimeSignature,
    /// Initial tempo
    pub bpm: f64,
    /// How far ahead of the playhead events are handed to the voice pool
    pub lookahead_ms: u64,
    /// How far ahead of the playhead the pending event set is derived
    pub schedule_ahead_beats: f64,
    /// Maximum rate of playhead notifications
    pub position_notify_hz: f64,
    /// Voice cap for each polyphonic synth
    pub max_polyphony: usize,
    /// Length of preview (audition) notes
    pub preview_ms: u64,
    /// Frames per block when rendering offline
    pub block_size: usize,
    /// Master volume, 0.0 - 1.0
    pub master_volume: f32,
    pub export_format: ExportFormat,
    pub melodic: SynthConfig,
    pub harmony: SynthConfig,
    pub effects: EffectsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            ticks_per_beat: DEFAULT_TICKS_PER_BEAT,
            time_signature: TimeSignature::default(),
            bpm: 120.0,
            lookahead_ms: 50,
            schedule_ahead_beats: 1.0,
            position_notify_hz: 30.0,
            max_polyphony: 32,
            preview_ms: 500,
            block_size: 128,
            master_volume: 0.8,
            export_format: ExportFormat::Wav16,
            melodic: SynthConfig::melodic(),
            harmony: SynthConfig::harmony(),
            effects: EffectsConfig::default(),
        }
    }
}

/// Oscillator and envelope of one polyphonic synth
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    pub waveform: Waveform,
    pub envelope: Envelope,
}

impl SynthConfig {
    /// Lead voice: triangle wave, short sustain.
    pub fn melodic() -> Self {
        Self {
            waveform: Waveform::Triangle,
            envelope: Envelope::default(),
        }
    }

    /// Chord voice: sine wave, longer decay and release for pads.
    pub fn harmony() -> Self {
        Self {
            waveform: Waveform::Sine,
            envelope: Envelope {
                attack: 0.1,
                decay: 0.3,
                sustain: 0.4,
                release: 0.8,
            },
        }
    }
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self::melodic()
    }
}

/// Master effects chain parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub compressor_threshold_db: f32,
    pub compressor_ratio: f32,
    /// Seconds
    pub compressor_attack: f32,
    /// Seconds
    pub compressor_release: f32,
    pub eq_low_db: f32,
    pub eq_mid_db: f32,
    pub eq_high_db: f32,
    /// Seconds
    pub delay_time: f32,
    pub delay_feedback: f32,
    pub delay_mix: f32,
    /// Seconds to -60 dB
    pub reverb_decay: f32,
    pub reverb_mix: f32,
    pub limiter_ceiling_db: f32,
    /// Fixed master channel trim applied before master volume
    pub master_channel_db: f32,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            compressor_threshold_db: -24.0,
            compressor_ratio: 4.0,
            compressor_attack: 0.005,
            compressor_release: 0.1,
            eq_low_db: 0.0,
            eq_mid_db: 0.0,
            eq_high_db: 0.0,
            delay_time: 0.25,
            delay_feedback: 0.3,
            delay_mix: 0.2,
            reverb_decay: 2.5,
            reverb_mix: 0.25,
            limiter_ceiling_db: -1.0,
            master_channel_db: -6.0,
        }
    }
}

impl EngineConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!("Config file not found at {:?}", path)));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration or return default if missing or invalid
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("[CONFIG] Using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Check ranges that would otherwise fail later at engine construction.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BPM..=MAX_BPM).contains(&self.bpm) {
            return Err(Error::InvalidTempo(self.bpm));
        }
        if self.sample_rate < 8_000 {
            return Err(Error::Config(format!("sample_rate {} is too low", self.sample_rate)));
        }
        if self.ticks_per_beat == 0 {
            return Err(Error::Config("ticks_per_beat must be at least 1".to_string()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be at least 1".to_string()));
        }
        if self.schedule_ahead_beats.is_nan() || self.schedule_ahead_beats <= 0.0 {
            return Err(Error::Config("schedule_ahead_beats must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.master_volume) {
            return Err(Error::Config(format!("master_volume {} outside 0.0-1.0", self.master_volume)));
        }
        Ok(())
    }

    /// Length of one offline render block.
    pub fn block_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_product_settings() {
        let config = EngineConfig::default();
        assert_eq!(config.bpm, 120.0);
        assert_eq!(config.master_volume, 0.8);
        assert_eq!(config.effects.compressor_ratio, 4.0);
        assert_eq!(config.harmony.waveform, Waveform::Sine);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            bpm = 96
            ticks_per_beat = 4

            [effects]
            reverb_mix = 0.5

            [melodic]
            waveform = "square"
            "#,
        )
        .unwrap();
        assert_eq!(config.bpm, 96.0);
        assert_eq!(config.ticks_per_beat, 4);
        assert_eq!(config.effects.reverb_mix, 0.5);
        assert_eq!(config.effects.delay_time, 0.25);
        assert_eq!(config.melodic.waveform, Waveform::Square);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(EngineConfig::from_toml_str("bpm = 400"), Err(Error::InvalidTempo(_))));
        assert!(EngineConfig::from_toml_str("master_volume = 2.0").is_err());
        assert!(EngineConfig::from_toml_str("bpm = \"fast\"").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");
        let mut config = EngineConfig::default();
        config.bpm = 140.0;
        config.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.bpm, 140.0);
        assert_eq!(EngineConfig::load_or_default(&dir.path().join("missing.toml")).bpm, 120.0);
    }
}
