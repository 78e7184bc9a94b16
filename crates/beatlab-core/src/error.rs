//! Error types for beatlab-core

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the engine.
///
/// Musical content problems (missing sample, out-of-range pitch, empty lane)
/// never show up here; they are skipped and logged where they are found.
#[derive(Debug, Error)]
pub enum Error {
    /// Tempo outside the supported range
    #[error("Invalid tempo: {0} BPM (expected 20-300)")]
    InvalidTempo(f64),

    /// The target instrument has been disposed
    #[error("Voice unavailable: {0}")]
    VoiceUnavailable(String),

    /// A sample could not be fetched or decoded
    #[error("Sample '{id}' failed to load: {reason}")]
    SampleLoadFailed { id: String, reason: String },

    /// Export was interrupted before the requested duration was captured
    #[error("Export aborted")]
    ExportAborted,

    /// Caller handed the scheduler structurally invalid data
    #[error("Malformed schedule input: {0}")]
    MalformedScheduleInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WAV encode/decode error
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// Whether this error concerns engine lifecycle (surfaced to the UI once).
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Error::VoiceUnavailable(_) | Error::ExportAborted)
    }
}
