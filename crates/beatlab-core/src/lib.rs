//! beatlab core - transport, scheduling and voices for the beatlab music tool.
//!
//! This crate provides the audio core behind the step sequencer, piano roll
//! and chord tools:
//!
//! - **Timing** - Tick-based transport clock, time signatures, notation
//! - **Model** - Step patterns, note sequences and chord sequences
//! - **Scheduler** - Derives a deduplicated, tick-ordered event stream per lane
//! - **Voices** - Synths, sample players and the shared effects chain
//! - **Samples** - Asynchronous, deduplicated sample loading
//! - **Export** - Capture of the master output to WAV
//! - **Theory** - Note names, chord spelling and common progressions
//!
//! # Architecture
//!
//! An [`Engine`] owns exactly one [`Transport`], one [`EventScheduler`] and
//! one [`VoicePool`]. The editing layer calls `update_*` on every model edit;
//! the host calls [`Engine::process`] from its audio loop. Events are
//! dispatched slightly ahead of the playhead and started at the exact frame
//! where their tick falls.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod export;
pub mod model;
pub mod samples;
pub mod scheduler;
pub mod theory;
pub mod timing;
pub mod voices;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EffectsConfig, EngineConfig, SynthConfig};
pub use engine::{Engine, EngineEvent};
pub use error::{Error, Result};
pub use events::{EventId, EventPayload, ScheduledEvent};
pub use export::{encode_wav, CaptureHandle, CaptureTap, EncodedAudio, ExportFormat};
pub use model::{
    ChordEntry, ChordSequence, LaneContent, LaneId, Note, NoteSequence, Pitch, SampleId, StepPattern, DEFAULT_VELOCITY,
};
pub use samples::{FileSource, SampleBuffer, SampleLibrary, SampleLoader, SampleLookup, SampleSource, SampleState};
pub use scheduler::{EventScheduler, LaneTemplate};
pub use theory::{Chord, ChordQuality, Progression, COMMON_PROGRESSIONS};
pub use timing::{parse_notation, Subdivision, TickTime, Ticks, TimeSignature, Transport, TransportState};
pub use voices::{Instrument, PolySynth, PreviewTarget, RenderSpan, SampleVoice, VoicePool};
