//! Scheduled events handed from the scheduler to the voice pool.

use crate::model::{LaneId, Pitch, SampleId};
use crate::timing::Ticks;

/// Identity of a scheduled event.
///
/// Derived from the lane's registration slot and the fire tick, so deriving
/// the same content twice yields the same ids. Field order gives the dispatch
/// order: ascending tick, then lane registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    pub fire_at: Ticks,
    pub lane_slot: u32,
}

/// What an event plays.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    /// One-shot percussion hit.
    Sample { sample_id: SampleId, velocity: f32 },
    /// Single note on the melodic voice.
    Melodic {
        pitch: Pitch,
        duration_ticks: Ticks,
        velocity: f32,
    },
    /// Chord on the harmony voice.
    Harmony {
        pitches: Vec<Pitch>,
        duration_ticks: Ticks,
        velocity: f32,
    },
}

impl EventPayload {
    /// Sounding length in ticks (zero for one-shots).
    pub fn duration_ticks(&self) -> Ticks {
        match self {
            EventPayload::Sample { .. } => 0,
            EventPayload::Melodic { duration_ticks, .. } | EventPayload::Harmony { duration_ticks, .. } => {
                *duration_ticks
            }
        }
    }
}

/// A trigger scheduled for a specific tick on a specific lane.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledEvent {
    pub id: EventId,
    pub lane: LaneId,
    pub fire_at_ticks: Ticks,
    pub payload: EventPayload,
}

impl ScheduledEvent {
    pub fn new(lane: LaneId, lane_slot: u32, fire_at_ticks: Ticks, payload: EventPayload) -> Self {
        Self {
            id: EventId {
                fire_at: fire_at_ticks,
                lane_slot,
            },
            lane,
            fire_at_ticks,
            payload,
        }
    }
}
