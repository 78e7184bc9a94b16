//! Tick-based event scheduler.
//!
//! Each lane's content is turned into a [`LaneTemplate`] once per edit. The
//! scheduler then materializes template occurrences into a pending set up to
//! a horizon, and hands due events out in `(tick, lane registration)` order.
//! Occurrences are always computed from absolute ticks, never by adding a
//! period to the previous fire time.

use crate::error::{Error, Result};
use crate::events::{EventId, EventPayload, ScheduledEvent};
use crate::model::{LaneContent, LaneId, Pitch, StepPattern, NoteSequence, ChordSequence};
use crate::timing::Ticks;
use std::collections::{BTreeMap, HashMap};

/// One onset within a lane template.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateEvent {
    /// Offset from the start of the loop (or of the session for one-shot lanes).
    pub offset: Ticks,
    pub payload: EventPayload,
}

/// Derived, read-only form of a lane's content.
///
/// Onsets are sorted, unique per tick, and already truncated so no note
/// overlaps the next onset on the same lane.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaneTemplate {
    events: Vec<TemplateEvent>,
    loop_length: Option<Ticks>,
}

impl LaneTemplate {
    /// Derive a template from lane content.
    ///
    /// Content problems (out-of-range pitch, empty pattern, onset past the
    /// loop end) are skipped with a warning. Structural problems such as a
    /// negative duration, a zero loop length or a subdivision that does not fit
    /// the tick grid fail with [`Error::MalformedScheduleInput`].
    pub fn derive(content: LaneContent<'_>, ticks_per_beat: u32) -> Result<Self> {
        match content {
            LaneContent::Steps(pattern) => Self::from_steps(pattern, ticks_per_beat),
            LaneContent::Notes(sequence) => Self::from_notes(sequence),
            LaneContent::Chords(sequence) => Self::from_chords(sequence),
        }
    }

    fn from_steps(pattern: &StepPattern, ticks_per_beat: u32) -> Result<Self> {
        let ticks_per_step = pattern.subdivision.ticks_per_step(ticks_per_beat)?;
        if pattern.length == 0 {
            log::debug!("[SCHEDULER] Pattern for '{}' is empty", pattern.instrument_id);
            return Ok(Self::default());
        }
        let velocity = clamp_velocity(pattern.velocity);
        let events = pattern
            .active_steps()
            .map(|step| TemplateEvent {
                offset: step as Ticks * ticks_per_step,
                payload: EventPayload::Sample {
                    sample_id: pattern.instrument_id.clone(),
                    velocity,
                },
            })
            .collect();
        Ok(Self {
            events,
            loop_length: Some(pattern.length as Ticks * ticks_per_step),
        })
    }

    fn from_notes(sequence: &NoteSequence) -> Result<Self> {
        let loop_length = validate_loop(sequence.loop_ticks)?;
        let mut onsets: BTreeMap<Ticks, (Vec<Pitch>, Ticks, f32)> = BTreeMap::new();
        for note in &sequence.notes {
            let duration = validate_duration(note.duration_ticks)?;
            if note.pitch > 127 {
                log::warn!("[SCHEDULER] Skipping note with out-of-range pitch {}", note.pitch);
                continue;
            }
            if let Some(onset) = accept_onset(note.start_tick, duration, loop_length, &onsets) {
                onsets.insert(onset, (vec![note.pitch], duration, clamp_velocity(note.velocity)));
            }
        }
        Ok(Self::from_onsets(onsets, loop_length, |pitches, duration_ticks, velocity| {
            EventPayload::Melodic {
                pitch: pitches[0],
                duration_ticks,
                velocity,
            }
        }))
    }

    fn from_chords(sequence: &ChordSequence) -> Result<Self> {
        let loop_length = validate_loop(sequence.loop_ticks)?;
        let mut onsets: BTreeMap<Ticks, (Vec<Pitch>, Ticks, f32)> = BTreeMap::new();
        for entry in &sequence.entries {
            let duration = validate_duration(entry.duration_ticks)?;
            let pitches: Vec<Pitch> = entry.pitches.iter().copied().filter(|p| *p <= 127).collect();
            if pitches.is_empty() {
                log::warn!("[SCHEDULER] Skipping chord at tick {} with no playable pitches", entry.start_tick);
                continue;
            }
            if let Some(onset) = accept_onset(entry.start_tick, duration, loop_length, &onsets) {
                onsets.insert(onset, (pitches, duration, clamp_velocity(entry.velocity)));
            }
        }
        Ok(Self::from_onsets(onsets, loop_length, |pitches, duration_ticks, velocity| {
            EventPayload::Harmony {
                pitches: pitches.to_vec(),
                duration_ticks,
                velocity,
            }
        }))
    }

    fn from_onsets(
        onsets: BTreeMap<Ticks, (Vec<Pitch>, Ticks, f32)>,
        loop_length: Option<Ticks>,
        make: impl Fn(&[Pitch], Ticks, f32) -> EventPayload,
    ) -> Self {
        let offsets: Vec<Ticks> = onsets.keys().copied().collect();
        let events = onsets
            .iter()
            .enumerate()
            .map(|(index, (&offset, (pitches, duration, velocity)))| {
                let next_onset = match (offsets.get(index + 1), loop_length) {
                    (Some(&next), _) => Some(next),
                    (None, Some(len)) => Some(offsets[0] + len),
                    (None, None) => None,
                };
                let duration = match next_onset {
                    Some(next) => (*duration).min(next - offset),
                    None => *duration,
                };
                TemplateEvent {
                    offset,
                    payload: make(pitches, duration, *velocity),
                }
            })
            .collect();
        Self { events, loop_length }
    }

    pub fn events(&self) -> &[TemplateEvent] {
        &self.events
    }

    pub fn loop_length(&self) -> Option<Ticks> {
        self.loop_length
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Visit every occurrence with `from <= tick < to`.
    fn occurrences(&self, from: Ticks, to: Ticks, mut visit: impl FnMut(Ticks, &TemplateEvent)) {
        if to <= from {
            return;
        }
        for event in &self.events {
            match self.loop_length {
                Some(len) => {
                    // First iteration at or after `from`, from absolute ticks
                    let mut n = if from <= event.offset {
                        0
                    } else {
                        (from - event.offset).div_ceil(len)
                    };
                    loop {
                        let tick = event.offset + n * len;
                        if tick >= to {
                            break;
                        }
                        visit(tick, event);
                        n += 1;
                    }
                }
                None => {
                    if (from..to).contains(&event.offset) {
                        visit(event.offset, event);
                    }
                }
            }
        }
    }
}

fn clamp_velocity(velocity: f32) -> f32 {
    if velocity.is_finite() {
        velocity.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn validate_duration(duration: i64) -> Result<Ticks> {
    if duration < 0 {
        return Err(Error::MalformedScheduleInput(format!("negative duration {}", duration)));
    }
    Ok(duration as Ticks)
}

fn validate_loop(loop_ticks: Option<Ticks>) -> Result<Option<Ticks>> {
    match loop_ticks {
        Some(0) => Err(Error::MalformedScheduleInput("loop length must be positive".to_string())),
        other => Ok(other),
    }
}

/// Content checks shared by notes and chords. Returns the onset to use.
fn accept_onset<T>(
    start: Ticks,
    duration: Ticks,
    loop_length: Option<Ticks>,
    onsets: &BTreeMap<Ticks, T>,
) -> Option<Ticks> {
    if duration == 0 {
        log::warn!("[SCHEDULER] Skipping zero-length event at tick {}", start);
        return None;
    }
    if let Some(len) = loop_length {
        if start >= len {
            log::warn!("[SCHEDULER] Skipping event at tick {} past loop end {}", start, len);
            return None;
        }
    }
    if onsets.contains_key(&start) {
        log::warn!("[SCHEDULER] Dropping second onset at tick {} on the same lane", start);
        return None;
    }
    Some(start)
}

struct LaneSlot {
    id: LaneId,
    template: LaneTemplate,
    /// Occurrences before this tick are already pending or dispatched.
    materialized_until: Ticks,
}

/// Tick-based event scheduler with per-lane tracking.
pub struct EventScheduler {
    /// Lanes in registration order; slots are never reused.
    lanes: Vec<LaneSlot>,
    index: HashMap<LaneId, usize>,
    /// Scheduled but not yet dispatched, keyed in dispatch order.
    pending: BTreeMap<EventId, ScheduledEvent>,
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventScheduler {
    /// Create a new event scheduler.
    pub fn new() -> Self {
        Self {
            lanes: Vec::new(),
            index: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Register a lane, returning its slot. Registering twice returns the same slot.
    pub fn register(&mut self, lane: &LaneId) -> u32 {
        if let Some(&slot) = self.index.get(lane) {
            return slot as u32;
        }
        let slot = self.lanes.len();
        self.lanes.push(LaneSlot {
            id: lane.clone(),
            template: LaneTemplate::default(),
            materialized_until: 0,
        });
        self.index.insert(lane.clone(), slot);
        log::debug!("[SCHEDULER] Registered lane '{}' in slot {}", lane, slot);
        slot as u32
    }

    pub fn lane_slot(&self, lane: &LaneId) -> Option<u32> {
        self.index.get(lane).map(|&slot| slot as u32)
    }

    /// Lane name for a slot.
    pub fn lane_id(&self, slot: u32) -> Option<&LaneId> {
        self.lanes.get(slot as usize).map(|lane| &lane.id)
    }

    /// Replace a lane's template.
    ///
    /// Every pending event of the lane is dropped and the lane is
    /// re-materialized over `[frontier, horizon)`. Returns the lane's slot.
    pub fn replace_lane(&mut self, lane: &LaneId, template: LaneTemplate, frontier: Ticks, horizon: Ticks) -> u32 {
        let slot = self.register(lane);
        self.pending.retain(|id, _| id.lane_slot != slot);
        let entry = &mut self.lanes[slot as usize];
        entry.template = template;
        entry.materialized_until = frontier;
        let added = self.materialize(slot as usize, horizon);
        log::debug!(
            "[SCHEDULER] Rescheduled '{}' from tick {} ({} events pending)",
            lane,
            frontier,
            added
        );
        slot
    }

    /// Clear a lane's content. Its slot keeps its place in the tie-break order.
    pub fn remove_lane(&mut self, lane: &LaneId) -> Option<u32> {
        let slot = self.lane_slot(lane)?;
        self.pending.retain(|id, _| id.lane_slot != slot);
        self.lanes[slot as usize].template = LaneTemplate::default();
        Some(slot)
    }

    /// Materialize every lane up to `horizon` (exclusive).
    pub fn fill(&mut self, horizon: Ticks) -> usize {
        (0..self.lanes.len()).map(|slot| self.materialize(slot, horizon)).sum()
    }

    fn materialize(&mut self, slot: usize, horizon: Ticks) -> usize {
        let lane = &mut self.lanes[slot];
        let from = lane.materialized_until;
        if horizon <= from {
            return 0;
        }
        let mut added = 0;
        let pending = &mut self.pending;
        lane.template.occurrences(from, horizon, |tick, event| {
            let scheduled = ScheduledEvent::new(lane.id.clone(), slot as u32, tick, event.payload.clone());
            pending.insert(scheduled.id, scheduled);
            added += 1;
        });
        lane.materialized_until = horizon;
        if added > 0 {
            log::trace!("[SCHEDULER] '{}' materialized {} events in [{}, {})", lane.id, added, from, horizon);
        }
        added
    }

    /// Remove and return every pending event with `fire_at < until`,
    /// ordered by tick and then lane registration order.
    pub fn take_due(&mut self, until: Ticks) -> Vec<ScheduledEvent> {
        let later = self.pending.split_off(&EventId {
            fire_at: until,
            lane_slot: 0,
        });
        let due = std::mem::replace(&mut self.pending, later);
        due.into_values().collect()
    }

    /// Pending events of one lane in fire order.
    pub fn pending_for(&self, lane: &LaneId) -> Vec<ScheduledEvent> {
        match self.lane_slot(lane) {
            Some(slot) => self
                .pending
                .values()
                .filter(|event| event.id.lane_slot == slot)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop all pending events and restart every lane at `position`.
    ///
    /// Call this when the transport is stopped or rewound.
    pub fn reset(&mut self, position: Ticks) {
        self.pending.clear();
        for lane in &mut self.lanes {
            lane.materialized_until = position;
        }
    }

    /// Get the number of registered lanes.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChordEntry, Note, StepPattern};
    use crate::timing::Subdivision;

    fn kick() -> StepPattern {
        StepPattern::new("kick", 16).with_active(&[0, 4, 8, 12])
    }

    fn derive(content: LaneContent<'_>) -> LaneTemplate {
        LaneTemplate::derive(content, 4).unwrap()
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = EventScheduler::new();
        assert_eq!(scheduler.lane_count(), 0);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn test_kick_pattern_one_loop() {
        let mut scheduler = EventScheduler::new();
        let lane = LaneId::from("kick");
        scheduler.replace_lane(&lane, derive(LaneContent::Steps(&kick())), 0, 16);
        let due = scheduler.take_due(16);
        let ticks: Vec<Ticks> = due.iter().map(|e| e.fire_at_ticks).collect();
        assert_eq!(ticks, vec![0, 4, 8, 12]);
        assert!(due.iter().all(|e| e.lane == lane));
        assert!(due.iter().all(|e| matches!(&e.payload, EventPayload::Sample { sample_id, .. } if sample_id.as_str() == "kick")));
    }

    #[test]
    fn test_active_step_count_matches_triggers_per_loop() {
        for active in [vec![], vec![3], vec![0, 1, 2, 3, 4, 5, 6], vec![1, 6]] {
            let pattern = StepPattern::new("snare", 7).with_active(&active);
            let mut scheduler = EventScheduler::new();
            let lane = LaneId::from("snare");
            scheduler.replace_lane(&lane, derive(LaneContent::Steps(&pattern)), 0, 7);
            let due = scheduler.take_due(7);
            let ticks: Vec<Ticks> = due.iter().map(|e| e.fire_at_ticks).collect();
            assert_eq!(ticks, active.iter().map(|&s| s as Ticks).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_reschedule_is_idempotent() {
        let mut scheduler = EventScheduler::new();
        let lane = LaneId::from("kick");
        scheduler.replace_lane(&lane, derive(LaneContent::Steps(&kick())), 0, 32);
        let first = scheduler.pending_for(&lane);
        scheduler.replace_lane(&lane, derive(LaneContent::Steps(&kick())), 0, 32);
        let second = scheduler.pending_for(&lane);
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
    }

    #[test]
    fn test_edit_supersedes_pending() {
        let mut scheduler = EventScheduler::new();
        let lane = LaneId::from("hat");
        let mut pattern = StepPattern::new("hat", 16).with_active(&[1, 3, 5]);
        scheduler.replace_lane(&lane, derive(LaneContent::Steps(&pattern)), 0, 16);
        // tick 1 fires, then step 3 is switched off
        let fired = scheduler.take_due(2);
        assert_eq!(fired.len(), 1);
        pattern.set_step(3, false);
        scheduler.replace_lane(&lane, derive(LaneContent::Steps(&pattern)), 2, 16);
        let rest: Vec<Ticks> = scheduler.take_due(16).iter().map(|e| e.fire_at_ticks).collect();
        assert_eq!(rest, vec![5]);
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let mut scheduler = EventScheduler::new();
        let hat = LaneId::from("hat");
        let kick_lane = LaneId::from("kick");
        scheduler.register(&hat);
        scheduler.register(&kick_lane);
        scheduler.replace_lane(&kick_lane, derive(LaneContent::Steps(&kick())), 0, 4);
        let hats = StepPattern::new("hat", 4).with_active(&[0]);
        scheduler.replace_lane(&hat, derive(LaneContent::Steps(&hats)), 0, 4);
        let lanes: Vec<String> = scheduler.take_due(4).iter().map(|e| e.lane.to_string()).collect();
        assert_eq!(lanes, vec!["hat", "kick"]);
    }

    #[test]
    fn test_thousand_loops_without_drift() {
        let mut scheduler = EventScheduler::new();
        let lane = LaneId::from("kick");
        let pattern = StepPattern::new("kick", 16).with_active(&[0]).with_subdivision(Subdivision::Sixteenth);
        let template = LaneTemplate::derive(LaneContent::Steps(&pattern), 192).unwrap();
        let loop_len = template.loop_length().unwrap();
        scheduler.replace_lane(&lane, template, 0, 0);
        let mut fired = Vec::new();
        // advance in uneven chunks like a real tick loop
        let mut horizon = 0;
        while fired.len() < 1001 {
            horizon += 37;
            scheduler.fill(horizon);
            fired.extend(scheduler.take_due(horizon).into_iter().map(|e| e.fire_at_ticks));
        }
        for pair in fired.windows(2) {
            assert_eq!(pair[1] - pair[0], loop_len);
        }
    }

    #[test]
    fn test_chord_truncated_at_next_onset() {
        let chords = ChordSequence::new(vec![
            ChordEntry::new([60, 64, 67], 0, 8),
            ChordEntry::new([62, 65, 69], 4, 8),
        ]);
        let template = derive(LaneContent::Chords(&chords));
        assert_eq!(template.events()[0].payload.duration_ticks(), 4);
        // last chord is not looped so keeps its length
        assert_eq!(template.events()[1].payload.duration_ticks(), 8);
    }

    #[test]
    fn test_looped_notes_truncate_across_wrap() {
        let notes = NoteSequence::new(vec![Note::new(60, 2, 4), Note::new(64, 12, 10)]).looped(16);
        let template = derive(LaneContent::Notes(&notes));
        assert_eq!(template.events()[0].payload.duration_ticks(), 4);
        // 12 -> wraps to the onset at 16 + 2
        assert_eq!(template.events()[1].payload.duration_ticks(), 6);
    }

    #[test]
    fn test_content_errors_are_skipped() {
        let notes = NoteSequence::new(vec![
            Note::new(200, 0, 4),
            Note::new(60, 4, 0),
            Note::new(62, 8, 4),
            Note::new(64, 8, 4),
            Note::new(65, 40, 4),
        ])
        .looped(16);
        let template = derive(LaneContent::Notes(&notes));
        assert_eq!(template.events().len(), 1);
        assert!(matches!(template.events()[0].payload, EventPayload::Melodic { pitch: 62, .. }));

        let empty = StepPattern::new("kick", 0);
        assert!(derive(LaneContent::Steps(&empty)).is_empty());
    }

    #[test]
    fn test_programmer_errors_are_reported() {
        let negative = NoteSequence::new(vec![Note::new(60, 0, -4)]);
        assert!(matches!(
            LaneTemplate::derive(LaneContent::Notes(&negative), 4),
            Err(Error::MalformedScheduleInput(_))
        ));
        let zero_loop = ChordSequence::new(vec![ChordEntry::new([60], 0, 4)]).looped(0);
        assert!(LaneTemplate::derive(LaneContent::Chords(&zero_loop), 4).is_err());
        let off_grid = StepPattern::new("hat", 8).with_subdivision(Subdivision::ThirtySecond);
        assert!(LaneTemplate::derive(LaneContent::Steps(&off_grid), 4).is_err());
    }

    #[test]
    fn test_one_shot_sequence_fires_once() {
        let mut scheduler = EventScheduler::new();
        let lane = LaneId::from("melody");
        let notes = NoteSequence::new(vec![Note::new(60, 0, 2), Note::new(62, 2, 2)]);
        scheduler.replace_lane(&lane, derive(LaneContent::Notes(&notes)), 0, 100);
        assert_eq!(scheduler.take_due(100).len(), 2);
        scheduler.fill(1000);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn test_reset_rewinds_lanes() {
        let mut scheduler = EventScheduler::new();
        let lane = LaneId::from("kick");
        scheduler.replace_lane(&lane, derive(LaneContent::Steps(&kick())), 0, 10);
        scheduler.take_due(6);
        scheduler.reset(0);
        assert_eq!(scheduler.pending_len(), 0);
        scheduler.fill(16);
        let ticks: Vec<Ticks> = scheduler.take_due(16).iter().map(|e| e.fire_at_ticks).collect();
        assert_eq!(ticks, vec![0, 4, 8, 12]);
    }

    #[test]
    fn test_remove_lane_drops_pending() {
        let mut scheduler = EventScheduler::new();
        let lane = LaneId::from("kick");
        scheduler.replace_lane(&lane, derive(LaneContent::Steps(&kick())), 0, 16);
        scheduler.remove_lane(&lane);
        assert_eq!(scheduler.pending_len(), 0);
        scheduler.fill(64);
        assert_eq!(scheduler.pending_len(), 0);
        assert_eq!(scheduler.lane_slot(&lane), Some(0));
    }
}
