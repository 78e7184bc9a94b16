//! Note names, chord qualities and common progressions.

use crate::model::{ChordEntry, ChordSequence, Pitch};
use crate::timing::Ticks;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// Pitch-class names used for display (sharps only).
pub const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// Parse a note name to a MIDI note number.
///
/// Supports "C4", "F#3", "Bb", "C-1" and plain numbers ("60").
/// The octave defaults to 4, so "C" is 60.
pub fn parse_note_name(name: &str) -> Option<Pitch> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    if let Ok(midi) = name.parse::<i32>() {
        return (0..=127).contains(&midi).then_some(midi as Pitch);
    }

    let mut chars = name.chars().peekable();
    let base: i32 = pitch_class(chars.next()?)?;

    let mut accidental = 0i32;
    while let Some(&c) = chars.peek() {
        match c {
            '#' | '♯' => accidental += 1,
            'b' | '♭' => accidental -= 1,
            _ => break,
        }
        chars.next();
    }

    let rest: String = chars.collect();
    let octave: i32 = if rest.is_empty() { 4 } else { rest.parse().ok()? };

    let midi = octave_base(octave)?.checked_add(base + accidental)?;
    (0..=127).contains(&midi).then_some(midi as Pitch)
}

/// MIDI number of C in `octave`, `None` when the arithmetic overflows.
fn octave_base(octave: i32) -> Option<i32> {
    octave.checked_add(1)?.checked_mul(12)
}

fn pitch_class(letter: char) -> Option<i32> {
    match letter.to_ascii_uppercase() {
        'C' => Some(0),
        'D' => Some(2),
        'E' => Some(4),
        'F' => Some(5),
        'G' => Some(7),
        'A' => Some(9),
        'B' => Some(11),
        _ => None,
    }
}

/// Display name for a MIDI note ("C4" for 60).
pub fn note_name(pitch: Pitch) -> String {
    let octave = pitch as i32 / 12 - 1;
    format!("{}{}", NOTE_NAMES[pitch as usize % 12], octave)
}

/// Chord types offered by the chord tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChordQuality {
    Major,
    Minor,
    Seventh,
    Major7,
    Minor7,
    Sus4,
    Sus2,
    Dim,
    Aug,
    Sixth,
    Ninth,
    Add9,
}

impl ChordQuality {
    pub const ALL: [ChordQuality; 12] = [
        ChordQuality::Major,
        ChordQuality::Minor,
        ChordQuality::Seventh,
        ChordQuality::Major7,
        ChordQuality::Minor7,
        ChordQuality::Sus4,
        ChordQuality::Sus2,
        ChordQuality::Dim,
        ChordQuality::Aug,
        ChordQuality::Sixth,
        ChordQuality::Ninth,
        ChordQuality::Add9,
    ];

    /// Semitone offsets from the root.
    pub fn intervals(self) -> &'static [u8] {
        match self {
            ChordQuality::Major => &[0, 4, 7],
            ChordQuality::Minor => &[0, 3, 7],
            ChordQuality::Seventh => &[0, 4, 7, 10],
            ChordQuality::Major7 => &[0, 4, 7, 11],
            ChordQuality::Minor7 => &[0, 3, 7, 10],
            ChordQuality::Sus4 => &[0, 5, 7],
            ChordQuality::Sus2 => &[0, 2, 7],
            ChordQuality::Dim => &[0, 3, 6],
            ChordQuality::Aug => &[0, 4, 8],
            ChordQuality::Sixth => &[0, 4, 7, 9],
            ChordQuality::Ninth => &[0, 4, 7, 10, 14],
            ChordQuality::Add9 => &[0, 4, 7, 14],
        }
    }

    /// Suffix used in chord symbols ("m7" in "Dm7").
    pub fn symbol(self) -> &'static str {
        match self {
            ChordQuality::Major => "",
            ChordQuality::Minor => "m",
            ChordQuality::Seventh => "7",
            ChordQuality::Major7 => "maj7",
            ChordQuality::Minor7 => "m7",
            ChordQuality::Sus4 => "sus4",
            ChordQuality::Sus2 => "sus2",
            ChordQuality::Dim => "dim",
            ChordQuality::Aug => "aug",
            ChordQuality::Sixth => "6",
            ChordQuality::Ninth => "9",
            ChordQuality::Add9 => "add9",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "" | "maj" | "M" => Some(ChordQuality::Major),
            "m" | "min" => Some(ChordQuality::Minor),
            "min7" => Some(ChordQuality::Minor7),
            other => ChordQuality::ALL.into_iter().find(|q| q.symbol() == other),
        }
    }
}

/// A chord symbol: root pitch class plus quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chord {
    /// Pitch class 0..12 (C = 0).
    pub root: u8,
    pub quality: ChordQuality,
}

fn chord_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Ga-g])([#b]?)(.*)$").ok())
        .as_ref()
}

impl Chord {
    pub fn new(root: u8, quality: ChordQuality) -> Self {
        Self {
            root: root % 12,
            quality,
        }
    }

    /// Parse a symbol such as "Am", "Dm7", "Cmaj7" or "F#sus4".
    pub fn parse(symbol: &str) -> Option<Self> {
        let caps = chord_regex()?.captures(symbol.trim())?;
        let letter = caps[1].chars().next()?;
        let base = pitch_class(letter)?;
        let accidental = match &caps[2] {
            "#" => 1,
            "b" => -1,
            _ => 0,
        };
        let quality = ChordQuality::from_symbol(&caps[3])?;
        Some(Self::new((base + accidental).rem_euclid(12) as u8, quality))
    }

    /// Chord tones with the root in `octave` (C4 = 60). Tones above 127 are dropped.
    pub fn pitches(&self, octave: i32) -> BTreeSet<Pitch> {
        let Some(root) = octave_base(octave).and_then(|c| c.checked_add(self.root as i32)) else {
            return BTreeSet::new();
        };
        self.quality
            .intervals()
            .iter()
            .filter_map(|&i| root.checked_add(i as i32))
            .filter(|p| (0..=127).contains(p))
            .map(|p| p as Pitch)
            .collect()
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", NOTE_NAMES[self.root as usize], self.quality.symbol())
    }
}

/// A named chord progression preset.
#[derive(Clone, Copy, Debug)]
pub struct Progression {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub chords: &'static [&'static str],
}

pub const COMMON_PROGRESSIONS: [Progression; 6] = [
    Progression {
        id: "i-iv-v",
        name: "I-IV-V",
        description: "Classic progression",
        chords: &["C", "F", "G"],
    },
    Progression {
        id: "i-v-vi-iv",
        name: "I-V-vi-IV",
        description: "Pop progression",
        chords: &["C", "G", "Am", "F"],
    },
    Progression {
        id: "ii-v-i",
        name: "ii-V-I",
        description: "Jazz progression",
        chords: &["Dm7", "G7", "Cmaj7"],
    },
    Progression {
        id: "vi-iv-i-v",
        name: "vi-IV-I-V",
        description: "Sad progression",
        chords: &["Am", "F", "C", "G"],
    },
    Progression {
        id: "i-vi-iv-v",
        name: "I-vi-IV-V",
        description: "50s progression",
        chords: &["C", "Am", "F", "G"],
    },
    Progression {
        id: "i-iv-vi-v",
        name: "I-IV-vi-V",
        description: "Emotional progression",
        chords: &["C", "F", "Am", "G"],
    },
];

/// Look up a preset by id.
pub fn find_progression(id: &str) -> Option<&'static Progression> {
    COMMON_PROGRESSIONS.iter().find(|p| p.id.eq_ignore_ascii_case(id))
}

/// Lay chords out back to back, `beats_per_chord` beats each.
///
/// Unknown symbols are skipped but keep their slot, so the remaining chords
/// stay on the beat they were written on. The result loops over whole bars.
pub fn progression_to_chords(
    symbols: &[&str],
    octave: i32,
    beats_per_chord: u32,
    ticks_per_beat: u32,
    ticks_per_bar: Ticks,
) -> ChordSequence {
    let step = beats_per_chord as Ticks * ticks_per_beat as Ticks;
    let entries: Vec<ChordEntry> = symbols
        .iter()
        .enumerate()
        .filter_map(|(index, symbol)| match Chord::parse(symbol) {
            Some(chord) => Some(ChordEntry::new(chord.pitches(octave), index as Ticks * step, step as i64)),
            None => {
                log::warn!("[THEORY] Skipping unknown chord symbol '{}'", symbol);
                None
            }
        })
        .collect();

    let span = symbols.len() as Ticks * step;
    let loop_ticks = if ticks_per_bar == 0 {
        span
    } else {
        span.div_ceil(ticks_per_bar) * ticks_per_bar
    };
    ChordSequence {
        entries,
        loop_ticks: (loop_ticks > 0).then_some(loop_ticks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note_name() {
        assert_eq!(parse_note_name("C4"), Some(60));
        assert_eq!(parse_note_name("A4"), Some(69));
        assert_eq!(parse_note_name("C#4"), Some(61));
        assert_eq!(parse_note_name("Bb3"), Some(58));
        assert_eq!(parse_note_name("C"), Some(60));
        assert_eq!(parse_note_name("C-1"), Some(0));
        assert_eq!(parse_note_name("72"), Some(72));
        assert_eq!(parse_note_name("G9"), Some(127));
        assert_eq!(parse_note_name("G#9"), None);
        assert_eq!(parse_note_name("H2"), None);
        assert_eq!(parse_note_name(""), None);
    }

    #[test]
    fn test_huge_octaves_are_out_of_range() {
        assert_eq!(parse_note_name("C999999999"), None);
        assert_eq!(parse_note_name("C-999999999"), None);
        assert_eq!(parse_note_name("B178956969"), None);
        let c = Chord::parse("C").unwrap();
        assert!(c.pitches(i32::MAX / 2).is_empty());
        assert!(c.pitches(i32::MAX).is_empty());
        assert!(c.pitches(i32::MIN).is_empty());
        assert!(c.pitches(10).is_empty());
    }

    #[test]
    fn test_note_name() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(61), "C#4");
        assert_eq!(note_name(0), "C-1");
    }

    #[test]
    fn test_chord_parse() {
        let am = Chord::parse("Am").unwrap();
        assert_eq!(am.root, 9);
        assert_eq!(am.quality, ChordQuality::Minor);
        assert_eq!(Chord::parse("Dm7").unwrap().quality, ChordQuality::Minor7);
        assert_eq!(Chord::parse("Cmaj7").unwrap().quality, ChordQuality::Major7);
        assert_eq!(Chord::parse("G7").unwrap().quality, ChordQuality::Seventh);
        assert_eq!(Chord::parse("F#sus4").unwrap().root, 6);
        assert_eq!(Chord::parse("Bb").unwrap().root, 10);
        assert!(Chord::parse("Xm").is_none());
        assert!(Chord::parse("Cweird").is_none());
    }

    #[test]
    fn test_chord_pitches() {
        let c = Chord::parse("C").unwrap();
        assert_eq!(c.pitches(4).into_iter().collect::<Vec<_>>(), vec![60, 64, 67]);
        let add9 = Chord::parse("Cadd9").unwrap();
        assert_eq!(add9.pitches(4).into_iter().collect::<Vec<_>>(), vec![60, 64, 67, 74]);
        assert_eq!(Chord::parse("Am").unwrap().to_string(), "Am");
    }

    #[test]
    fn test_every_quality_round_trips_its_symbol() {
        for quality in ChordQuality::ALL {
            assert_eq!(ChordQuality::from_symbol(quality.symbol()), Some(quality));
        }
    }

    #[test]
    fn test_progression_layout() {
        let pop = find_progression("i-v-vi-iv").unwrap();
        let seq = progression_to_chords(pop.chords, 4, 2, 192, 768);
        assert_eq!(seq.entries.len(), 4);
        assert_eq!(seq.entries[1].start_tick, 384);
        assert_eq!(seq.entries[3].duration_ticks, 384);
        assert_eq!(seq.loop_ticks, Some(2 * 768));

        let jazz = find_progression("ii-v-i").unwrap();
        let seq = progression_to_chords(jazz.chords, 3, 2, 192, 768);
        // three chords of two beats round up to two bars
        assert_eq!(seq.loop_ticks, Some(2 * 768));
    }
}
