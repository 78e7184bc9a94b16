//! Capture of the master output and WAV encoding.

use crate::error::{Error, Result};
use crate::voices::StereoFrame;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use tokio::sync::oneshot;

pub const WAV_MIME_TYPE: &str = "audio/wav";

/// Upper bound on what a capture reserves up front; longer captures grow.
const MAX_RESERVED_FRAMES: usize = 60 * 48_000;

/// Container and sample format of exported audio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// 16-bit PCM WAV
    #[default]
    Wav16,
    /// 32-bit float WAV
    WavFloat,
}

impl ExportFormat {
    fn wav_spec(self, sample_rate: u32) -> hound::WavSpec {
        let (bits_per_sample, sample_format) = match self {
            ExportFormat::Wav16 => (16, hound::SampleFormat::Int),
            ExportFormat::WavFloat => (32, hound::SampleFormat::Float),
        };
        hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample,
            sample_format,
        }
    }
}

/// An encoded audio asset.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: usize,
}

impl EncodedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate.max(1) as f64
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }
}

/// Encode stereo frames as an in-memory WAV file.
pub fn encode_wav(frames: &[StereoFrame], sample_rate: u32, format: ExportFormat) -> Result<EncodedAudio> {
    let spec = format.wav_spec(sample_rate);
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for frame in frames {
            for &sample in frame {
                match format {
                    ExportFormat::Wav16 => {
                        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
                    }
                    ExportFormat::WavFloat => writer.write_sample(sample)?,
                }
            }
        }
        writer.finalize()?;
    }
    Ok(EncodedAudio {
        bytes: cursor.into_inner(),
        mime_type: WAV_MIME_TYPE,
        sample_rate,
        channels: spec.channels,
        frames: frames.len(),
    })
}

/// Scoped capture of the master output.
///
/// Collects rendered blocks until the requested length is reached, then
/// encodes and delivers the asset to its [`CaptureHandle`]. A tap dropped
/// before completion delivers [`Error::ExportAborted`].
pub struct CaptureTap {
    buffer: Vec<StereoFrame>,
    target_frames: usize,
    sample_rate: u32,
    format: ExportFormat,
    sender: Option<oneshot::Sender<Result<EncodedAudio>>>,
}

impl CaptureTap {
    pub fn new(duration_secs: f64, sample_rate: u32, format: ExportFormat) -> Result<(Self, CaptureHandle)> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(Error::Config(format!(
                "capture duration {} must be positive and finite",
                duration_secs
            )));
        }
        let target_frames = (duration_secs * sample_rate as f64).round().max(1.0) as usize;
        let (sender, receiver) = oneshot::channel();
        let tap = Self {
            buffer: Vec::with_capacity(target_frames.min(MAX_RESERVED_FRAMES)),
            target_frames,
            sample_rate,
            format,
            sender: Some(sender),
        };
        Ok((tap, CaptureHandle { receiver }))
    }

    /// Append a rendered block. Returns `true` once the capture is full;
    /// frames beyond the requested length are ignored.
    pub fn push(&mut self, block: &[StereoFrame]) -> bool {
        let room = self.target_frames - self.buffer.len();
        self.buffer.extend_from_slice(&block[..block.len().min(room)]);
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() >= self.target_frames
    }

    pub fn captured_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn target_frames(&self) -> usize {
        self.target_frames
    }

    /// Encode what was captured and deliver it.
    pub fn complete(mut self) {
        let result = encode_wav(&self.buffer, self.sample_rate, self.format);
        match &result {
            Ok(audio) => log::info!(
                "[EXPORT] Captured {:.2}s ({} bytes)",
                audio.duration_secs(),
                audio.bytes.len()
            ),
            Err(e) => log::error!("[EXPORT] Encoding failed: {}", e),
        }
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(result);
        }
    }

    /// Give up on the capture.
    pub fn abort(self) {
        drop(self);
    }
}

impl Drop for CaptureTap {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            log::warn!(
                "[EXPORT] Capture aborted after {} of {} frames",
                self.buffer.len(),
                self.target_frames
            );
            let _ = sender.send(Err(Error::ExportAborted));
        }
    }
}

/// Receiving end of a capture.
pub struct CaptureHandle {
    receiver: oneshot::Receiver<Result<EncodedAudio>>,
}

impl CaptureHandle {
    /// Wait for the capture to finish or abort.
    pub async fn finish(self) -> Result<EncodedAudio> {
        self.receiver.await.unwrap_or(Err(Error::ExportAborted))
    }

    /// The result if the capture has ended, `None` while it is running.
    pub fn try_finish(&mut self) -> Option<Result<EncodedAudio>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::ExportAborted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_back(audio: &EncodedAudio) -> hound::WavReader<Cursor<Vec<u8>>> {
        hound::WavReader::new(Cursor::new(audio.bytes.clone())).unwrap()
    }

    #[test]
    fn test_encode_wav16() {
        let frames = vec![[0.5, -0.5], [1.5, -1.5]];
        let audio = encode_wav(&frames, 44_100, ExportFormat::Wav16).unwrap();
        assert_eq!(audio.mime_type, "audio/wav");
        assert_eq!(audio.frames, 2);

        let mut reader = read_back(&audio);
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![16383, -16383, i16::MAX, -i16::MAX]);
    }

    #[test]
    fn test_encode_float_keeps_values() {
        let audio = encode_wav(&[[0.25, -0.75]], 48_000, ExportFormat::WavFloat).unwrap();
        let mut reader = read_back(&audio);
        assert_eq!(reader.spec().sample_rate, 48_000);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.25, -0.75]);
    }

    #[tokio::test]
    async fn test_tap_delivers_exact_length() {
        let (mut tap, handle) = CaptureTap::new(0.01, 1000, ExportFormat::Wav16).unwrap();
        assert_eq!(tap.target_frames(), 10);
        assert!(!tap.push(&[[0.1, 0.1]; 6]));
        assert!(tap.push(&[[0.1, 0.1]; 6]));
        assert_eq!(tap.captured_frames(), 10);
        tap.complete();

        let audio = handle.finish().await.unwrap();
        assert_eq!(audio.frames, 10);
        assert_eq!(audio.duration_secs(), 0.01);
    }

    #[tokio::test]
    async fn test_dropped_tap_aborts() {
        let (mut tap, handle) = CaptureTap::new(1.0, 1000, ExportFormat::Wav16).unwrap();
        tap.push(&[[0.0, 0.0]; 100]);
        drop(tap);
        assert!(matches!(handle.finish().await, Err(Error::ExportAborted)));
    }

    #[test]
    fn test_try_finish() {
        let (tap, mut handle) = CaptureTap::new(1.0, 1000, ExportFormat::Wav16).unwrap();
        assert!(handle.try_finish().is_none());
        tap.abort();
        assert!(matches!(handle.try_finish(), Some(Err(Error::ExportAborted))));
    }

    #[test]
    fn test_invalid_duration() {
        assert!(CaptureTap::new(0.0, 44_100, ExportFormat::Wav16).is_err());
        assert!(CaptureTap::new(f64::NAN, 44_100, ExportFormat::Wav16).is_err());
        assert!(matches!(
            CaptureTap::new(f64::INFINITY, 44_100, ExportFormat::Wav16),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_long_capture_reserves_a_bounded_buffer() {
        let (mut tap, _handle) = CaptureTap::new(1e12, 44_100, ExportFormat::Wav16).unwrap();
        assert!(tap.buffer.capacity() < tap.target_frames());
        assert!(!tap.push(&[[0.0, 0.0]; 64]));
        assert_eq!(tap.captured_frames(), 64);
    }

    #[test]
    fn test_format_from_config_text() {
        #[derive(Deserialize)]
        struct Holder {
            format: ExportFormat,
        }
        let holder: Holder = toml::from_str("format = \"wav_float\"").unwrap();
        assert_eq!(holder.format, ExportFormat::WavFloat);
    }
}
