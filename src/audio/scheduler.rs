//! Sequential playback scheduling against the output device clock.
//!
//! Chunks arrive at irregular times and sizes; each is placed at
//! `max(cursor, now)` and the cursor advances by its duration, so buffers
//! play back to back with no gap and no overlap. The set of scheduled
//! buffers is the only jitter buffer there is.

use std::collections::BTreeMap;

pub type BufferId = u64;

/// Placement of one buffer on the device timeline (seconds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start: f64,
    next_id: BufferId,
    scheduled: BTreeMap<BufferId, ScheduledBuffer>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a buffer of `duration` seconds given the device clock `now`.
    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledBuffer {
        self.next_start = self.next_start.max(now);
        let slot = ScheduledBuffer {
            id: self.next_id,
            start: self.next_start,
            duration,
        };
        self.next_id += 1;
        self.next_start += duration;
        self.scheduled.insert(slot.id, slot);
        slot
    }

    /// A buffer finished playing on its own.
    ///
    /// Returns `None` for ids no longer in the set (already flushed), else
    /// whether the set is now empty.
    pub fn finish(&mut self, id: BufferId) -> Option<bool> {
        self.scheduled.remove(&id)?;
        Some(self.scheduled.is_empty())
    }

    /// The sink placed `id` later than scheduled. Buffers scheduled after it
    /// follow its real end so none of them overlap it.
    pub fn reschedule(&mut self, id: BufferId, start: f64) {
        if let Some(slot) = self.scheduled.get_mut(&id) {
            if start > slot.start {
                slot.start = start;
                self.next_start = self.next_start.max(slot.end());
            }
        }
    }

    /// Barge-in: empty the set and pull the cursor back to `now`.
    /// Returns the ids the sink must stop, in schedule order.
    pub fn interrupt(&mut self, now: f64) -> Vec<BufferId> {
        self.next_start = now;
        self.drain()
    }

    /// Empty the set without touching the cursor.
    pub fn drain(&mut self) -> Vec<BufferId> {
        std::mem::take(&mut self.scheduled).into_keys().collect()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}
