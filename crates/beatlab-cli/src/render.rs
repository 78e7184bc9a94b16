//! Offline rendering of a groove to a WAV file.
//!
//! Builds a four-on-the-floor drum pattern from the given samples, a chord
//! progression on the harmony voice and a bass line on the melodic voice,
//! then renders the engine offline and writes the result.

use crate::RenderArgs;
use anyhow::{Context, Result};
use beatlab_core::theory::{find_progression, progression_to_chords};
use beatlab_core::{
    ChordSequence, Engine, EngineConfig, ExportFormat, FileSource, LaneId, Note, NoteSequence, SampleId,
    SampleLoader, SampleState, StepPattern,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_PROGRESSION: &str = "i-v-vi-iv";

/// Beats each chord of the progression lasts.
const BEATS_PER_CHORD: u32 = 2;

const KICK: &str = "x...x...x...x...";
const SNARE: &str = "....x.......x...";
const HIHAT: &str = "x.x.x.x.x.x.x.x.";

pub fn render(args: RenderArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(bpm) = args.bpm {
        config.bpm = bpm;
    }
    if args.float {
        config.export_format = ExportFormat::WavFloat;
    }

    log::info!("beatlab render");
    log::info!("Output:   {}", args.out.display());
    log::info!("Duration: {}", humantime::format_duration(args.duration));
    log::info!("Tempo:    {} BPM", config.bpm);

    let loader = SampleLoader::new(Arc::new(FileSource::new()), config.sample_rate);
    let drums = load_drums(&loader, &args)?;

    let mut engine = Engine::from_config(config, loader.library()).context("Failed to create engine")?;
    for (sample, grid) in &drums {
        let lane = LaneId::new(sample.as_str());
        engine.update_pattern(&lane, &StepPattern::from_grid(sample.clone(), grid))?;
    }

    let chords = progression(&args, &engine)?;
    engine.update_notes(&LaneId::new("bass"), &bass_line(&chords))?;
    engine.update_chords(&LaneId::new("chords"), &chords)?;

    let audio = engine
        .render(args.duration.as_secs_f64())
        .context("Render failed")?;
    create_parent(&args.out)?;
    audio
        .write_to(&args.out)
        .with_context(|| format!("Failed to write {}", args.out.display()))?;
    log::info!(
        "Render complete: {} ({:.2}s, {} bytes)",
        args.out.display(),
        audio.duration_secs(),
        audio.bytes.len()
    );
    engine.dispose();
    Ok(())
}

/// Load the drum samples that were given, returning the lanes to build.
fn load_drums(loader: &SampleLoader, args: &RenderArgs) -> Result<Vec<(SampleId, &'static str)>> {
    let wanted: Vec<(SampleId, &PathBuf, &'static str)> = [
        ("kick", &args.kick, KICK),
        ("snare", &args.snare, SNARE),
        ("hihat", &args.hihat, HIHAT),
    ]
    .into_iter()
    .filter_map(|(id, path, grid)| path.as_ref().map(|p| (SampleId::new(id), p, grid)))
    .collect();
    if wanted.is_empty() {
        log::info!("No drum samples given, rendering without drums");
        return Ok(Vec::new());
    }

    let items: Vec<(SampleId, String)> = wanted
        .iter()
        .map(|(id, path, _)| (id.clone(), path.display().to_string()))
        .collect();
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let results = runtime.block_on(loader.load_all(&items));

    let mut lanes = Vec::new();
    for ((id, state), (_, path, grid)) in results.into_iter().zip(wanted) {
        if state == SampleState::Ready {
            log::info!("Loaded {} from {}", id, path.display());
            lanes.push((id, grid));
        } else {
            log::warn!("Could not load {} from {}, its lane stays silent", id, path.display());
        }
    }
    Ok(lanes)
}

fn progression(args: &RenderArgs, engine: &Engine) -> Result<ChordSequence> {
    let symbols: Vec<String> = match (&args.progression, &args.preset) {
        (Some(text), _) => text.split_whitespace().map(str::to_string).collect(),
        (None, preset) => {
            let id = preset.as_deref().unwrap_or(DEFAULT_PROGRESSION);
            let progression = find_progression(id)
                .with_context(|| format!("Unknown progression '{}' (see `beatlab progressions`)", id))?;
            progression.chords.iter().map(|s| s.to_string()).collect()
        }
    };
    if symbols.is_empty() {
        anyhow::bail!("Progression has no chords");
    }
    log::info!("Chords:   {}", symbols.join(" "));

    let config = engine.config();
    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    Ok(progression_to_chords(
        &refs,
        4,
        BEATS_PER_CHORD,
        config.ticks_per_beat,
        config.time_signature.ticks_per_bar(config.ticks_per_beat),
    ))
}

/// Root of each chord two octaves down, on the beat and the off-beat.
fn bass_line(chords: &ChordSequence) -> NoteSequence {
    let notes = chords
        .entries
        .iter()
        .filter_map(|entry| {
            let root = entry.pitches.first()?.checked_sub(24)?;
            let half = entry.duration_ticks / 2;
            Some([
                Note::new(root, entry.start_tick, half),
                Note::new(root, entry.start_tick + half.max(0) as u64, half),
            ])
        })
        .flatten()
        .collect();
    let sequence = NoteSequence::new(notes);
    match chords.loop_ticks {
        Some(loop_ticks) => sequence.looped(loop_ticks),
        None => sequence,
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beatlab_core::ChordEntry;

    #[test]
    fn test_bass_line_follows_chord_roots() {
        let chords = ChordSequence::new(vec![
            ChordEntry::new([60, 64, 67], 0, 8),
            ChordEntry::new([67, 71, 74], 8, 8),
        ])
        .looped(16);
        let bass = bass_line(&chords);
        let notes: Vec<(u8, u64, i64)> = bass.notes.iter().map(|n| (n.pitch, n.start_tick, n.duration_ticks)).collect();
        assert_eq!(notes, vec![(36, 0, 4), (36, 4, 4), (43, 8, 4), (43, 12, 4)]);
        assert_eq!(bass.loop_ticks, Some(16));
    }
}
