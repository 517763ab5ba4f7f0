//! Shot reconstruction.
//!
//! The timer only reports a running shot counter and, per shot, the elapsed
//! time since the start signal. [`ShotBook`] turns that into an ordered list
//! of slots: the counter reserves empty slots, time fetches fill them in any
//! order, and [`ShotBook::snapshot`] derives splits for display.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::Bound::{Excluded, Unbounded};

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::SessionState;

/// One recorded shot as presented to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ShotSlot {
    /// 1-based, in discovery order.
    pub id: u32,
    /// Milliseconds since the start signal, once fetched.
    pub elapsed_ms: Option<u32>,
    /// Counted while the session was not running.
    pub false_start: bool,
    /// Gap to the nearest lower filled slot. `None` for the first slot or
    /// while either side is unfilled.
    pub split_ms: Option<i64>,
}

/// Result of a successful [`ShotBook::fill_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Filled,
    /// The slot already had a value; the new one was ignored.
    AlreadyFilled,
}

/// Rejected [`ShotBook::fill_slot`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FillError {
    #[error("shot {id} is not reserved")]
    SlotNotReserved { id: u32 },

    #[error("{elapsed_ms} ms for shot {id} already recorded for shot {existing}")]
    DuplicateValue {
        id: u32,
        elapsed_ms: u32,
        existing: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slot {
    elapsed_ms: Option<u32>,
    false_start: bool,
}

/// Slots for the current session, keyed by 1-based id.
#[derive(Debug, Clone, Default)]
pub struct ShotBook {
    slots: BTreeMap<u32, Slot>,
    seen: u32,
}

impl ShotBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest shot count observed so far.
    pub fn seen(&self) -> u32 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reserve a slot for every id above the previously seen count, up to
    /// `count`. Returns the newly reserved ids.
    ///
    /// Slots reserved while `state` is not running are marked as false starts.
    /// A count at or below the seen count reserves nothing.
    pub fn advance_count(&mut self, count: u32, state: SessionState) -> Vec<u32> {
        if count <= self.seen {
            if count < self.seen {
                debug!(count, seen = self.seen, "ignoring lower shot count");
            }
            return Vec::new();
        }
        let false_start = !state.is_running();
        let mut added = Vec::new();
        for id in self.seen + 1..=count {
            if let Entry::Vacant(slot) = self.slots.entry(id) {
                slot.insert(Slot {
                    elapsed_ms: None,
                    false_start,
                });
                added.push(id);
            }
        }
        self.seen = count;
        added
    }

    /// Record the elapsed time for slot `id`.
    ///
    /// A value already recorded under another id is rejected: the timer
    /// answers a not-yet-ready slot with the previous shot's time.
    pub fn fill_slot(&mut self, id: u32, elapsed_ms: u32) -> Result<Fill, FillError> {
        let Some(slot) = self.slots.get(&id) else {
            return Err(FillError::SlotNotReserved { id });
        };
        if slot.elapsed_ms.is_some() {
            return Ok(Fill::AlreadyFilled);
        }
        if let Some((&existing, _)) = self
            .slots
            .iter()
            .find(|(other, s)| **other != id && s.elapsed_ms == Some(elapsed_ms))
        {
            warn!(id, elapsed_ms, existing, "rejecting duplicate shot time");
            return Err(FillError::DuplicateValue {
                id,
                elapsed_ms,
                existing,
            });
        }
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.elapsed_ms = Some(elapsed_ms);
        }
        Ok(Fill::Filled)
    }

    /// Lowest id still waiting for its time.
    pub fn next_unfilled(&self) -> Option<u32> {
        self.slots
            .iter()
            .find(|(_, s)| s.elapsed_ms.is_none())
            .map(|(&id, _)| id)
    }

    /// Lowest unfilled id above `after`, wrapping to the lowest unfilled id
    /// when there is none above it.
    pub fn next_unfilled_after(&self, after: u32) -> Option<u32> {
        self.slots
            .range((Excluded(after), Unbounded))
            .find(|(_, s)| s.elapsed_ms.is_none())
            .map(|(&id, _)| id)
            .or_else(|| self.next_unfilled())
    }

    /// All slots in id order, with splits.
    pub fn snapshot(&self) -> Vec<ShotSlot> {
        let mut prev: Option<u32> = None;
        self.slots
            .iter()
            .map(|(&id, s)| {
                let split_ms = match (prev, s.elapsed_ms) {
                    (Some(p), Some(ms)) => Some(i64::from(ms) - i64::from(p)),
                    _ => None,
                };
                if s.elapsed_ms.is_some() {
                    prev = s.elapsed_ms;
                }
                ShotSlot {
                    id,
                    elapsed_ms: s.elapsed_ms,
                    false_start: s.false_start,
                    split_ms,
                }
            })
            .collect()
    }

    /// Forget every slot and the seen count.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.seen = 0;
    }
}

/// Render milliseconds as seconds with two decimals: `5123` → `"5.12 s"`.
pub fn format_seconds(ms: i64) -> String {
    format!("{:.2} s", ms as f64 / 1000.0)
}
