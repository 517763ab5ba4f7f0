//! Session object: timer state, shot slots and the generation token.
//!
//! A [`Session`] is replaced wholesale (by bumping its generation) on start
//! and reset. Work begun under an older [`SessionToken`] is discarded when it
//! completes.

use crate::poller::PollPhase;
use crate::protocol::SessionState;
use crate::shots::{ShotBook, ShotSlot};

// ---------------------------------------------------------------------------
// State tracker
// ---------------------------------------------------------------------------

/// Last timer state read from the device.
///
/// Changes only through a successful state read; a failed read leaves it as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateTracker {
    state: SessionState,
}

impl StateTracker {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Record a freshly read state. Returns it if it differs from the last.
    pub(crate) fn apply(&mut self, state: SessionState) -> Option<SessionState> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Identifies the session a piece of in-flight work belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(u64);

impl SessionToken {
    pub fn generation(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    generation: u64,
    phase: PollPhase,
    tracker: StateTracker,
    shots: ShotBook,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> SessionToken {
        SessionToken(self.generation)
    }

    pub fn is_current(&self, token: SessionToken) -> bool {
        self.generation == token.0
    }

    /// Start a new generation with empty state and slots. The phase is kept.
    pub fn renew(&mut self) -> SessionToken {
        self.generation = self.generation.wrapping_add(1);
        self.tracker.reset();
        self.shots.reset();
        self.token()
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    /// Returns `true` if the phase changed.
    pub fn set_phase(&mut self, phase: PollPhase) -> bool {
        std::mem::replace(&mut self.phase, phase) != phase
    }

    pub fn state(&self) -> SessionState {
        self.tracker.state()
    }

    pub(crate) fn apply_state(&mut self, state: SessionState) -> Option<SessionState> {
        self.tracker.apply(state)
    }

    pub fn shots(&self) -> &ShotBook {
        &self.shots
    }

    pub fn shots_mut(&mut self) -> &mut ShotBook {
        &mut self.shots
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            generation: self.generation,
            phase: self.phase,
            state: self.tracker.state(),
            slots: self.shots.snapshot(),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only view of a session for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Snapshot {
    pub generation: u64,
    pub phase: PollPhase,
    pub state: SessionState,
    pub slots: Vec<ShotSlot>,
}

impl Snapshot {
    pub fn shot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slots counted after the start signal.
    pub fn real_shots(&self) -> impl Iterator<Item = &ShotSlot> {
        self.slots.iter().filter(|s| !s.false_start)
    }

    /// Elapsed time of the first timed, non-false-start shot.
    pub fn first_ms(&self) -> Option<u32> {
        self.real_shots().find_map(|s| s.elapsed_ms)
    }

    /// Elapsed time of the last timed, non-false-start shot.
    pub fn last_ms(&self) -> Option<u32> {
        self.real_shots().filter_map(|s| s.elapsed_ms).last()
    }

    #[cfg(feature = "json")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
