//! Pattern and sequence data edited by the user.
//!
//! These types are owned by the editing layer. The scheduler only reads them
//! when a lane is rescheduled and never keeps a reference afterwards.

use crate::theory::parse_note_name;
use crate::timing::{Subdivision, Ticks};
use std::collections::BTreeSet;
use std::fmt;

/// MIDI note number.
pub type Pitch = u8;

/// Default velocity for steps and notes that do not specify one.
pub const DEFAULT_VELOCITY: f32 = 0.8;

/// Identifies a schedulable lane ("kick", "melody", "chords").
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LaneId(String);

impl LaneId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LaneId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for LaneId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a percussion sample ("kick", "snare", ...).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleId(String);

impl SampleId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SampleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SampleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A looping step grid for one percussion instrument.
#[derive(Clone, Debug, PartialEq)]
pub struct StepPattern {
    pub instrument_id: SampleId,
    pub steps: Vec<bool>,
    /// Loop length in steps. Steps past `steps.len()` are inactive.
    pub length: usize,
    pub subdivision: Subdivision,
    pub velocity: f32,
}

impl StepPattern {
    /// An empty pattern of `length` sixteenth-note steps.
    pub fn new(instrument_id: impl Into<SampleId>, length: usize) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            steps: vec![false; length],
            length,
            subdivision: Subdivision::Sixteenth,
            velocity: DEFAULT_VELOCITY,
        }
    }

    /// Build from a grid string where `x`/`X` marks an active step
    /// ("x...x...x...x..."). Bar separators `|` and whitespace are ignored.
    pub fn from_grid(instrument_id: impl Into<SampleId>, grid: &str) -> Self {
        let steps: Vec<bool> = grid
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '|')
            .map(|c| matches!(c, 'x' | 'X'))
            .collect();
        let length = steps.len();
        Self {
            instrument_id: instrument_id.into(),
            steps,
            length,
            subdivision: Subdivision::Sixteenth,
            velocity: DEFAULT_VELOCITY,
        }
    }

    pub fn with_active(mut self, indices: &[usize]) -> Self {
        for &index in indices {
            self.set_step(index, true);
        }
        self
    }

    pub fn with_subdivision(mut self, subdivision: Subdivision) -> Self {
        self.subdivision = subdivision;
        self
    }

    pub fn with_velocity(mut self, velocity: f32) -> Self {
        self.velocity = velocity;
        self
    }

    /// Toggle a step, growing the step list if needed.
    pub fn set_step(&mut self, index: usize, active: bool) {
        if index >= self.steps.len() {
            self.steps.resize(index + 1, false);
        }
        self.steps[index] = active;
    }

    /// Active step indices within the loop.
    pub fn active_steps(&self) -> impl Iterator<Item = usize> + '_ {
        self.steps
            .iter()
            .take(self.length)
            .enumerate()
            .filter_map(|(i, &on)| on.then_some(i))
    }
}

/// A single piano-roll note.
#[derive(Clone, Debug, PartialEq)]
pub struct Note {
    pub pitch: Pitch,
    pub start_tick: Ticks,
    /// Signed so a negative value can be rejected instead of wrapping.
    pub duration_ticks: i64,
    pub velocity: f32,
}

impl Note {
    pub fn new(pitch: Pitch, start_tick: Ticks, duration_ticks: i64) -> Self {
        Self {
            pitch,
            start_tick,
            duration_ticks,
            velocity: DEFAULT_VELOCITY,
        }
    }

    /// Build from a note name ("E4"). Returns `None` for unknown names.
    pub fn named(name: &str, start_tick: Ticks, duration_ticks: i64) -> Option<Self> {
        parse_note_name(name).map(|pitch| Self::new(pitch, start_tick, duration_ticks))
    }

    pub fn with_velocity(mut self, velocity: f32) -> Self {
        self.velocity = velocity;
        self
    }
}

/// Free-timed melodic notes. Plays once unless `loop_ticks` is set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NoteSequence {
    pub notes: Vec<Note>,
    pub loop_ticks: Option<Ticks>,
}

impl NoteSequence {
    pub fn new(notes: Vec<Note>) -> Self {
        Self {
            notes,
            loop_ticks: None,
        }
    }

    pub fn looped(mut self, loop_ticks: Ticks) -> Self {
        self.loop_ticks = Some(loop_ticks);
        self
    }
}

/// One chord in a [`ChordSequence`].
#[derive(Clone, Debug, PartialEq)]
pub struct ChordEntry {
    pub pitches: BTreeSet<Pitch>,
    pub start_tick: Ticks,
    pub duration_ticks: i64,
    pub velocity: f32,
}

impl ChordEntry {
    pub fn new(pitches: impl IntoIterator<Item = Pitch>, start_tick: Ticks, duration_ticks: i64) -> Self {
        Self {
            pitches: pitches.into_iter().collect(),
            start_tick,
            duration_ticks,
            velocity: DEFAULT_VELOCITY,
        }
    }
}

/// A chord progression. Plays once unless `loop_ticks` is set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChordSequence {
    pub entries: Vec<ChordEntry>,
    pub loop_ticks: Option<Ticks>,
}

impl ChordSequence {
    pub fn new(entries: Vec<ChordEntry>) -> Self {
        Self {
            entries,
            loop_ticks: None,
        }
    }

    pub fn looped(mut self, loop_ticks: Ticks) -> Self {
        self.loop_ticks = Some(loop_ticks);
        self
    }
}

/// Content of one lane, borrowed from the editor at reschedule time.
#[derive(Clone, Copy, Debug)]
pub enum LaneContent<'a> {
    Steps(&'a StepPattern),
    Notes(&'a NoteSequence),
    Chords(&'a ChordSequence),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_grid() {
        let pattern = StepPattern::from_grid("kick", "x...x...|x...x...");
        assert_eq!(pattern.length, 16);
        assert_eq!(pattern.active_steps().collect::<Vec<_>>(), vec![0, 4, 8, 12]);
        assert_eq!(pattern.instrument_id.as_str(), "kick");
    }

    #[test]
    fn test_active_steps_respect_length() {
        let mut pattern = StepPattern::new("hihat", 8).with_active(&[0, 7, 9]);
        assert_eq!(pattern.steps.len(), 10);
        assert_eq!(pattern.active_steps().collect::<Vec<_>>(), vec![0, 7]);
        pattern.set_step(7, false);
        assert_eq!(pattern.active_steps().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_named_note() {
        let note = Note::named("E4", 96, 48).unwrap();
        assert_eq!(note.pitch, 64);
        assert!(Note::named("nope", 0, 48).is_none());
    }
}
