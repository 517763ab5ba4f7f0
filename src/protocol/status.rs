//! Session state query (`#G_STATE`).

use std::fmt;

use crate::codec;
use crate::error::{Result, WireError};

use super::TAG_STATE;

/// Exercise state reported by the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum SessionState {
    #[default]
    Idle = 0,
    /// Start signal armed, waiting out the start delay.
    Countdown = 1,
    /// Start signal given; shots count toward the session.
    Running = 2,
}

impl SessionState {
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Idle),
            1 => Ok(Self::Countdown),
            2 => Ok(Self::Running),
            other => Err(WireError::OutOfRange {
                field: TAG_STATE,
                value: other,
            }),
        }
    }

    /// Decode a `#G_STATE=<0|1|2>` response.
    pub fn decode(line: &str) -> Result<Self> {
        Self::from_code(codec::read_int(line, TAG_STATE)?)
    }

    pub fn as_code(self) -> u8 {
        self as u8
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Countdown => write!(f, "COUNTDOWN"),
            Self::Running => write!(f, "RUNNING"),
        }
    }
}
