//! Asynchronous loading of percussion samples.
//!
//! [`SampleLoader`] fetches and decodes sample assets; [`SampleLibrary`] is
//! the read-only view the voice pool uses to find ready buffers. Concurrent
//! loads of the same id share one in-flight future.

use crate::engine::EngineEvent;
use crate::error::{Error, Result};
use crate::model::SampleId;
use crate::voices::StereoFrame;
use crossbeam_channel::Sender;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Decoded audio, resampled to the engine rate. Shared read-only.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBuffer {
    frames: Vec<StereoFrame>,
    sample_rate: u32,
}

impl SampleBuffer {
    pub fn from_frames(frames: Vec<StereoFrame>, sample_rate: u32) -> Self {
        Self { frames, sample_rate }
    }

    /// Decode a WAV file held in memory and resample it to `target_rate`.
    pub fn decode_wav(bytes: &[u8], target_rate: u32) -> Result<Self> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|x| x as f32 / max))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let channels = spec.channels.max(1) as usize;
        let frames: Vec<StereoFrame> = samples
            .chunks_exact(channels)
            .map(|c| if channels == 1 { [c[0], c[0]] } else { [c[0], c[1]] })
            .collect();

        Ok(Self {
            frames: resample_linear(&frames, spec.sample_rate, target_rate),
            sample_rate: target_rate,
        })
    }

    pub fn frames(&self) -> &[StereoFrame] {
        &self.frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames.len() as f64 / self.sample_rate.max(1) as f64
    }
}

fn resample_linear(frames: &[StereoFrame], source_rate: u32, target_rate: u32) -> Vec<StereoFrame> {
    if source_rate == target_rate || frames.is_empty() || source_rate == 0 {
        return frames.to_vec();
    }
    let ratio = target_rate as f64 / source_rate as f64;
    let out_len = (frames.len() as f64 * ratio).ceil() as usize;
    let last = frames.len() - 1;
    (0..out_len)
        .map(|i| {
            let src_pos = i as f64 / ratio;
            let idx = src_pos.floor() as usize;
            if idx >= last {
                return frames[last];
            }
            let frac = (src_pos - idx as f64) as f32;
            let (a, b) = (frames[idx], frames[idx + 1]);
            [a[0] * (1.0 - frac) + b[0] * frac, a[1] * (1.0 - frac) + b[1] * frac]
        })
        .collect()
}

/// Load state of one sample id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleState {
    NotLoaded,
    Loading,
    Ready,
    Failed,
}

/// What the voice pool finds when it looks a sample up.
#[derive(Clone, Debug)]
pub enum SampleLookup {
    Ready(Arc<SampleBuffer>),
    Loading,
    Failed,
    Missing,
}

/// Where sample bytes come from. Injected so hosts can fetch over HTTP,
/// from an asset bundle, or from disk.
pub trait SampleSource: Send + Sync {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>>;
}

/// Reads plain paths and `file://` URLs, relative paths resolved against `root`.
#[derive(Clone, Debug, Default)]
pub struct FileSource {
    root: Option<PathBuf>,
}

impl FileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

impl SampleSource for FileSource {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let path = self.resolve(url);
        async move { Ok(tokio::fs::read(&path).await?) }.boxed()
    }
}

type LoadFuture = Shared<BoxFuture<'static, SampleState>>;

struct AssetEntry {
    url: String,
    state: SampleState,
    buffer: Option<Arc<SampleBuffer>>,
    inflight: Option<LoadFuture>,
    generation: u64,
    failure: Option<String>,
}

struct LoaderShared {
    source: Arc<dyn SampleSource>,
    sample_rate: u32,
    assets: Mutex<HashMap<SampleId, AssetEntry>>,
    notifiers: Mutex<Vec<Sender<EngineEvent>>>,
    next_generation: AtomicU64,
}

impl LoaderShared {
    fn assets(&self) -> MutexGuard<'_, HashMap<SampleId, AssetEntry>> {
        self.assets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, id: &SampleId, state: SampleState) {
        let mut notifiers = self.notifiers.lock().unwrap_or_else(PoisonError::into_inner);
        notifiers.retain(|tx| {
            tx.send(EngineEvent::SampleStateChanged {
                id: id.clone(),
                state,
            })
            .is_ok()
        });
    }

    /// Record the outcome of a load unless a newer load replaced it.
    fn finish(&self, id: &SampleId, generation: u64, outcome: Result<SampleBuffer>) -> SampleState {
        let state = {
            let mut assets = self.assets();
            let Some(entry) = assets.get_mut(id) else {
                return SampleState::NotLoaded;
            };
            if entry.generation != generation {
                log::debug!("[SAMPLES] Discarding superseded load of '{}'", id);
                return entry.state;
            }
            entry.inflight = None;
            match outcome {
                Ok(buffer) => {
                    log::info!(
                        "[SAMPLES] Loaded '{}' ({:.2}s, {} frames)",
                        id,
                        buffer.duration_secs(),
                        buffer.len()
                    );
                    entry.buffer = Some(Arc::new(buffer));
                    entry.failure = None;
                    entry.state = SampleState::Ready;
                }
                Err(e) => {
                    let err = Error::SampleLoadFailed {
                        id: id.to_string(),
                        reason: e.to_string(),
                    };
                    log::warn!("[SAMPLES] {}", err);
                    entry.buffer = None;
                    entry.failure = Some(e.to_string());
                    entry.state = SampleState::Failed;
                }
            }
            entry.state
        };
        self.notify(id, state);
        state
    }
}

enum LoadPlan {
    Done(SampleState),
    Wait(LoadFuture),
}

/// Fetches and decodes samples; cheap to clone.
#[derive(Clone)]
pub struct SampleLoader {
    shared: Arc<LoaderShared>,
}

impl SampleLoader {
    pub fn new(source: Arc<dyn SampleSource>, sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                source,
                sample_rate,
                assets: Mutex::new(HashMap::new()),
                notifiers: Mutex::new(Vec::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Read-only view for the voice pool.
    pub fn library(&self) -> SampleLibrary {
        SampleLibrary {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Load `url` under `id`.
    ///
    /// A second call for an id that is already loading the same url awaits
    /// the first load instead of fetching again. An id that is ready with the
    /// same url resolves immediately. Failures resolve to
    /// [`SampleState::Failed`]; they are logged, not returned as errors.
    pub fn load(&self, id: impl Into<SampleId>, url: impl Into<String>) -> impl Future<Output = SampleState> + Send + 'static {
        let id = id.into();
        let url = url.into();
        let plan = self.plan_load(id, url);
        async move {
            match plan {
                LoadPlan::Done(state) => state,
                LoadPlan::Wait(load) => load.await,
            }
        }
    }

    fn plan_load(&self, id: SampleId, url: String) -> LoadPlan {
        let load = {
            let mut assets = self.shared.assets();
            let entry = assets.entry(id.clone()).or_insert_with(|| AssetEntry {
                url: url.clone(),
                state: SampleState::NotLoaded,
                buffer: None,
                inflight: None,
                generation: 0,
                failure: None,
            });
            if entry.url == url {
                if let Some(inflight) = &entry.inflight {
                    log::debug!("[SAMPLES] '{}' already loading, joining in-flight load", id);
                    return LoadPlan::Wait(inflight.clone());
                }
                if entry.state == SampleState::Ready {
                    return LoadPlan::Done(SampleState::Ready);
                }
            }

            let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::clone(&self.shared);
            let load_id = id.clone();
            let load_url = url.clone();
            let load: LoadFuture = async move {
                let outcome = fetch_and_decode(&shared, &load_url).await;
                shared.finish(&load_id, generation, outcome)
            }
            .boxed()
            .shared();

            entry.url = url;
            entry.state = SampleState::Loading;
            entry.buffer = None;
            entry.generation = generation;
            entry.inflight = Some(load.clone());
            load
        };
        log::debug!("[SAMPLES] Loading '{}'", id);
        self.shared.notify(&id, SampleState::Loading);
        LoadPlan::Wait(load)
    }

    /// Load several samples concurrently.
    pub async fn load_all(&self, items: &[(SampleId, String)]) -> Vec<(SampleId, SampleState)> {
        let loads = items.iter().map(|(id, url)| {
            let id = id.clone();
            let load = self.load(id.clone(), url.clone());
            async move { (id, load.await) }
        });
        futures::future::join_all(loads).await
    }
}

async fn fetch_and_decode(shared: &LoaderShared, url: &str) -> Result<SampleBuffer> {
    let bytes = shared.source.fetch(url).await?;
    let sample_rate = shared.sample_rate;
    tokio::task::spawn_blocking(move || SampleBuffer::decode_wav(&bytes, sample_rate))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?
}

/// Read-only access to loaded samples.
#[derive(Clone)]
pub struct SampleLibrary {
    shared: Arc<LoaderShared>,
}

impl SampleLibrary {
    /// Find the buffer for `id`, if it is ready.
    pub fn lookup(&self, id: &SampleId) -> SampleLookup {
        match self.shared.assets().get(id) {
            Some(entry) => match (entry.state, &entry.buffer) {
                (SampleState::Ready, Some(buffer)) => SampleLookup::Ready(Arc::clone(buffer)),
                (SampleState::Loading, _) => SampleLookup::Loading,
                (SampleState::Failed, _) => SampleLookup::Failed,
                _ => SampleLookup::Missing,
            },
            None => SampleLookup::Missing,
        }
    }

    pub fn state(&self, id: &SampleId) -> SampleState {
        self.shared
            .assets()
            .get(id)
            .map(|entry| entry.state)
            .unwrap_or(SampleState::NotLoaded)
    }

    /// Why the last load of `id` failed.
    pub fn failure_reason(&self, id: &SampleId) -> Option<String> {
        self.shared.assets().get(id).and_then(|entry| entry.failure.clone())
    }

    /// Receive [`EngineEvent::SampleStateChanged`] for every transition.
    pub fn subscribe(&self, sender: Sender<EngineEvent>) {
        self.shared
            .notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
    }
}
