//! Test doubles shared by the unit tests.

use crate::error::{Error, Result};
use crate::model::Pitch;
use crate::samples::{SampleLibrary, SampleLoader, SampleSource};
use crate::voices::{Instrument, StereoFrame, Trigger};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

/// Level each sounding voice adds to every rendered frame.
pub(crate) const RECORDED_LEVEL: f32 = 0.1;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    /// `frame` counts frames rendered by this instrument before the call.
    Trigger { pitch: Pitch, velocity: f32, frame: u64 },
    ReleaseNote { pitch: Pitch, frame: u64 },
    Release { frame: u64 },
    Dispose,
}

#[derive(Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn triggers(&self) -> Vec<(Pitch, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Trigger { pitch, frame, .. } => Some((pitch, frame)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn note_releases(&self) -> Vec<(Pitch, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ReleaseNote { pitch, frame } => Some((pitch, frame)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }
}

/// Instrument that logs every call with the frame it happened at and emits
/// a constant level per sounding pitch.
pub(crate) struct RecordingInstrument {
    name: String,
    log: CallLog,
    frames: u64,
    sounding: Vec<Pitch>,
    disposed: bool,
}

impl RecordingInstrument {
    pub(crate) fn new(name: &str) -> (Self, CallLog) {
        let log = CallLog::default();
        (Self::with_log(name, log.clone()), log)
    }

    pub(crate) fn with_log(name: &str, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            frames: 0,
            sounding: Vec::new(),
            disposed: false,
        }
    }

    pub(crate) fn boxed(name: &str) -> (Box<dyn Instrument>, CallLog) {
        let (instrument, log) = Self::new(name);
        (Box::new(instrument), log)
    }
}

impl Instrument for RecordingInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn trigger(&mut self, trigger: &Trigger) {
        self.log.push(Call::Trigger {
            pitch: trigger.pitch,
            velocity: trigger.velocity,
            frame: self.frames,
        });
        self.sounding.push(trigger.pitch);
    }

    fn release_note(&mut self, pitch: Pitch) {
        self.log.push(Call::ReleaseNote {
            pitch,
            frame: self.frames,
        });
        if let Some(i) = self.sounding.iter().position(|&p| p == pitch) {
            self.sounding.remove(i);
        }
    }

    fn release(&mut self) {
        self.log.push(Call::Release { frame: self.frames });
        self.sounding.clear();
    }

    fn render(&mut self, out: &mut [StereoFrame]) {
        self.frames += out.len() as u64;
        let level = self.sounding.len() as f32 * RECORDED_LEVEL;
        for frame in out.iter_mut() {
            frame[0] += level;
            frame[1] += level;
        }
    }

    fn active_voices(&self) -> usize {
        self.sounding.len()
    }

    fn dispose(&mut self) {
        self.log.push(Call::Dispose);
        self.sounding.clear();
        self.disposed = true;
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

/// 16-bit mono WAV bytes holding `frames` frames of a constant level.
pub(crate) fn wav_bytes(frames: usize, level: i16, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(level).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Serves WAV bytes from memory; unknown urls fail with `NotFound`.
#[derive(Default)]
pub(crate) struct MemorySource {
    files: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub(crate) fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(url.to_string(), bytes);
        self
    }
}

impl SampleSource for MemorySource {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let found = self.files.get(url).cloned();
        let url = url.to_string();
        async move {
            found.ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, url)))
        }
        .boxed()
    }
}

/// A loader over an in-memory source at 44.1 kHz.
pub(crate) fn memory_loader(source: MemorySource) -> SampleLoader {
    SampleLoader::new(Arc::new(source), 44_100)
}

/// A library with nothing loaded.
pub(crate) fn empty_library() -> SampleLibrary {
    memory_loader(MemorySource::default()).library()
}
